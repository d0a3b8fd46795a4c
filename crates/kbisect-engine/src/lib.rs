//! The bisection engine: the coordinator loop that drives candidates through
//! parallel host runners, aggregates verdicts, pairs store writes with VCS
//! marks, halts durably when a host is lost, and resumes exactly where it
//! stopped.

mod agent;
mod check;
mod compose;
mod coordinator;

pub use agent::{AgentDescriptor, HostAgent, LiveHostAgent};
pub use check::{run_checks, CheckResult, CheckStatus};
pub use compose::{build_coordinator, build_remote, power_settings, SshCommandRunner};
pub use coordinator::{Coordinator, EngineSettings, HaltReport, RunOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] kbisect_store::StoreError),
    #[error(transparent)]
    Vcs(#[from] kbisect_vcs::VcsError),
    #[error(transparent)]
    Runner(#[from] kbisect_runner::RunnerError),
    #[error("remote initialization failed: {0}")]
    Remote(String),
    #[error("no open bisection session; run `kbisect init <good> <bad>` first")]
    NoSession,
    #[error("an open session exists with different endpoints: {0}")]
    SessionMismatch(String),
    #[error("cannot resume: hosts still unreachable: {}", .0.join(", "))]
    HostsUnreachable(Vec<String>),
    #[error("iteration safety limit of {0} reached; session aborted")]
    IterationLimit(u32),
    #[error("host task failed: {0}")]
    Join(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
