use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

impl PowerState {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerControlKind {
    Ipmi,
    LabAutomation,
    ShellReboot,
}

impl PowerControlKind {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Ipmi => "power.ipmi",
            Self::LabAutomation => "power.lab_automation",
            Self::ShellReboot => "power.shell_reboot",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "power.ipmi" => Some(Self::Ipmi),
            "power.lab_automation" => Some(Self::LabAutomation),
            "power.shell_reboot" => Some(Self::ShellReboot),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("power backend failure: {0}")]
    BackendFailure(String),
    #[error("power target unreachable: {0}")]
    Unreachable(String),
    #[error("power operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("power controller misconfigured: {0}")]
    Configuration(String),
}

pub type PowerResult<T> = Result<T, PowerError>;

#[async_trait]
pub trait PowerController: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> PowerControlKind;

    fn provider_key(&self) -> &'static str {
        self.kind().as_key()
    }

    /// Best-effort, bounded; never blocks on an unreachable back end.
    async fn status(&self) -> PowerResult<PowerState>;

    async fn on(&self) -> PowerResult<()>;
    async fn off(&self) -> PowerResult<()>;
    async fn reset(&self) -> PowerResult<()>;

    /// Hard off, wait, on. Returns once the command is accepted, not after
    /// the host boots.
    async fn cycle(&self) -> PowerResult<()>;

    /// Whether this back end can bring back a host whose OS stopped
    /// responding. False for reboot-over-shell.
    fn can_recover_unreachable(&self) -> bool {
        true
    }
}

/// Local process seam so providers can be exercised against scripted
/// back ends in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<std::process::Output>;
}

pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<std::process::Output> {
        tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
    }
}

pub(crate) const RETRY_ATTEMPTS: u32 = 3;
pub(crate) const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Bounded retry with linear backoff for transient back-end failures.
pub(crate) async fn with_retry<T, F, Fut>(label: &str, mut operation: F) -> PowerResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PowerResult<T>>,
{
    let mut last_error = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(PowerError::Unsupported(op)) => return Err(PowerError::Unsupported(op)),
            Err(error) => {
                warn!("{label} attempt {attempt}/{RETRY_ATTEMPTS} failed: {error}");
                last_error = Some(error);
                if attempt < RETRY_ATTEMPTS {
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| PowerError::BackendFailure(format!("{label}: no attempts made"))))
}
