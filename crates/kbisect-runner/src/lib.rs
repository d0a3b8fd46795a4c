//! Per-host execution of one bisection iteration: the BUILD →
//! INSTALL+REBOOT → WAIT_BOOT → TEST state machine with boot recovery, and
//! the boot monitor it relies on.

mod monitor;
mod runner;

pub use monitor::{wait_for_boot, BootResult};
pub use runner::{HostRunner, HostRunnerSpec, RecoveryPolicy, RunnerTimeouts};

use thiserror::Error;

/// Only fatal infrastructure failures escape a host runner; everything a
/// host can do wrong is folded into its `HostOutcome`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] kbisect_store::StoreError),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
