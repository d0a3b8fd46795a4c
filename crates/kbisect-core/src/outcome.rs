use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::identifiers::{BlobId, HostId};

/// Lifecycle of one bisection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Halted,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Halted => "halted",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "running" => Some(Self::Running),
            "halted" => Some(Self::Halted),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Aggregate verdict for one tested commit, as consumed by git bisect.
/// `Pending` means the iteration could not be concluded and no mark was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationVerdict {
    Good,
    Bad,
    Skip,
    Pending,
}

impl IterationVerdict {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Skip => "skip",
            Self::Pending => "pending",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "good" => Some(Self::Good),
            "bad" => Some(Self::Bad),
            "skip" => Some(Self::Skip),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Per-host verdict for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostVerdict {
    Pass,
    Fail,
    Skip,
    Unreachable,
}

impl HostVerdict {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Unreachable => "unreachable",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "skip" => Some(Self::Skip),
            "unreachable" => Some(Self::Unreachable),
            _ => None,
        }
    }
}

/// The furthest phase a host runner reached within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    Install,
    Boot,
    Test,
    Done,
}

impl Phase {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Install => "install",
            Self::Boot => "boot",
            Self::Test => "test",
            Self::Done => "done",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "build" => Some(Self::Build),
            "install" => Some(Self::Install),
            "boot" => Some(Self::Boot),
            "test" => Some(Self::Test),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// What the configured test asserts. The distinction matters when a kernel
/// fails to boot: in boot mode that is the signal under test, in custom mode
/// it tells us nothing about the feature under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    Boot,
    Custom,
}

impl TestMode {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Custom => "custom",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "boot" => Some(Self::Boot),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Progress of the paired (store verdict, VCS mark) close of an iteration.
/// `Marking` persists before the VCS mark is attempted so a crash between the
/// two writes is detectable on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkState {
    None,
    Marking,
    Marked,
}

impl MarkState {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Marking => "marking",
            Self::Marked => "marked",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "none" => Some(Self::None),
            "marking" => Some(Self::Marking),
            "marked" => Some(Self::Marked),
            _ => None,
        }
    }
}

/// Phase-level failure classifications produced by the host runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseFailure {
    BuildFailed,
    /// The one-shot kernel panicked and firmware selected the protected one.
    BootFallback,
    /// Boot timed out, but a power cycle brought the host back on the
    /// protected kernel; the one-shot entry was consumed unbooted.
    BootTimeoutRecovered,
    /// Recovery exhausted; the host no longer answers.
    Unreachable,
}

/// Per-host verdict for a phase failure under the configured test mode.
pub fn verdict_for_phase_failure(failure: PhaseFailure, mode: TestMode) -> HostVerdict {
    match failure {
        PhaseFailure::BuildFailed => HostVerdict::Skip,
        PhaseFailure::BootFallback | PhaseFailure::BootTimeoutRecovered => match mode {
            TestMode::Boot => HostVerdict::Fail,
            TestMode::Custom => HostVerdict::Skip,
        },
        PhaseFailure::Unreachable => HostVerdict::Unreachable,
    }
}

/// Full per-host result of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOutcome {
    pub host: HostId,
    pub phase: Phase,
    pub verdict: HostVerdict,
    pub observed_kernel: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub build_log: Option<BlobId>,
    pub console_log: Option<BlobId>,
    pub test_log: Option<BlobId>,
}

impl HostOutcome {
    pub fn new(host: HostId, phase: Phase, verdict: HostVerdict) -> Self {
        Self {
            host,
            phase,
            verdict,
            observed_kernel: None,
            error_kind: None,
            error: None,
            build_log: None,
            console_log: None,
            test_log: None,
        }
    }

    pub fn with_error(mut self, kind: ErrorKind, detail: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.error = Some(detail.into());
        self
    }
}
