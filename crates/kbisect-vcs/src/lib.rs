//! Narrow adapter over git's bisection primitive. The working copy is a
//! single-writer resource owned by the driver; nothing else in the system
//! touches it.

mod driver;

pub use driver::{GitBisectDriver, MarkOutcome};

use async_trait::async_trait;
use thiserror::Error;

use kbisect_core::IterationVerdict;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    Command(String),
    #[error("git bisect mark rejected: {0}")]
    MarkRejected(String),
    #[error("bisection already started with different endpoints: expected good={expected_good} bad={expected_bad}, found good={found_good} bad={found_bad}")]
    EndpointMismatch {
        expected_good: String,
        expected_bad: String,
        found_good: String,
        found_bad: String,
    },
    #[error("unexpected git output: {0}")]
    InvalidOutput(String),
}

pub type VcsResult<T> = Result<T, VcsError>;

/// The bisection primitive as the coordinator consumes it. `GitBisectDriver`
/// is the production implementation; tests substitute scripted drivers.
#[async_trait]
pub trait BisectDriver: Send + Sync {
    async fn resolve(&self, reference: &str) -> VcsResult<String>;
    async fn start(&self, good_ref: &str, bad_ref: &str) -> VcsResult<()>;
    async fn current(&self) -> VcsResult<Option<String>>;
    async fn mark(&self, verdict: IterationVerdict) -> VcsResult<MarkOutcome>;
    async fn last_mark(&self) -> VcsResult<Option<(String, IterationVerdict)>>;
    async fn first_bad(&self) -> VcsResult<Option<String>>;
    async fn reset(&self) -> VcsResult<()>;
    async fn commit_message(&self, sha: &str) -> VcsResult<String>;
}

#[async_trait]
impl BisectDriver for GitBisectDriver {
    async fn resolve(&self, reference: &str) -> VcsResult<String> {
        GitBisectDriver::resolve(self, reference).await
    }

    async fn start(&self, good_ref: &str, bad_ref: &str) -> VcsResult<()> {
        GitBisectDriver::start(self, good_ref, bad_ref).await
    }

    async fn current(&self) -> VcsResult<Option<String>> {
        GitBisectDriver::current(self).await
    }

    async fn mark(&self, verdict: IterationVerdict) -> VcsResult<MarkOutcome> {
        GitBisectDriver::mark(self, verdict).await
    }

    async fn last_mark(&self) -> VcsResult<Option<(String, IterationVerdict)>> {
        GitBisectDriver::last_mark(self).await
    }

    async fn first_bad(&self) -> VcsResult<Option<String>> {
        GitBisectDriver::first_bad(self).await
    }

    async fn reset(&self) -> VcsResult<()> {
        GitBisectDriver::reset(self).await
    }

    async fn commit_message(&self, sha: &str) -> VcsResult<String> {
        GitBisectDriver::commit_message(self, sha).await
    }
}

/// Local process seam; tests drive the driver with scripted git output.
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
