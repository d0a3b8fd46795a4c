//! Serial-console capture: a background task copies the console byte stream
//! into a buffer that spills to disk past a threshold. Capture is optional
//! by contract — a bisection proceeds without it — so the chain logs
//! failures instead of raising them.

mod buffer;
mod chain;
mod providers;

pub use buffer::CaptureBuffer;
pub use chain::ConsoleChain;
pub use providers::conserver::ConserverCollector;
pub use providers::ipmi_sol::IpmiSolCollector;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("console collector failed to start: {0}")]
    Start(String),
    #[error("console capture i/o error: {0}")]
    Io(String),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCollectorKind {
    Conserver,
    IpmiSol,
}

impl ConsoleCollectorKind {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Conserver => "console.conserver",
            Self::IpmiSol => "console.ipmi_sol",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "console.conserver" => Some(Self::Conserver),
            "console.ipmi_sol" => Some(Self::IpmiSol),
            _ => None,
        }
    }
}

/// A running capture. Stopping kills the reader and returns everything
/// captured so far; dropping without stopping aborts the capture and loses
/// the bytes, so runners stop it on every exit path.
pub struct CaptureHandle {
    inner: providers::RunningCapture,
}

impl CaptureHandle {
    pub(crate) fn new(inner: providers::RunningCapture) -> Self {
        Self { inner }
    }

    pub fn kind(&self) -> ConsoleCollectorKind {
        self.inner.kind
    }

    pub async fn stop(self) -> Vec<u8> {
        self.inner.stop().await
    }
}

#[async_trait]
pub trait ConsoleCollector: Send + Sync {
    fn kind(&self) -> ConsoleCollectorKind;

    fn provider_key(&self) -> &'static str {
        self.kind().as_key()
    }

    async fn start(&self) -> ConsoleResult<CaptureHandle>;
}

#[cfg(test)]
mod tests {
    use super::ConsoleCollectorKind;

    #[test]
    fn provider_keys_roundtrip() {
        for kind in [ConsoleCollectorKind::Conserver, ConsoleCollectorKind::IpmiSol] {
            assert_eq!(ConsoleCollectorKind::from_key(kind.as_key()), Some(kind));
        }
        assert_eq!(ConsoleCollectorKind::from_key("console.telnet"), None);
    }
}
