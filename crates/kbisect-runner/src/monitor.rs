use std::time::Duration;

use tracing::debug;

use kbisect_remote::RemoteExec;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// What the boot wait observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootResult {
    /// The host answers and runs the kernel we expected (or any kernel when
    /// no expectation was given).
    BootedExpected { observed: Option<String> },
    /// The host answers but runs a different kernel: the one-shot entry
    /// failed to boot and firmware fell back to the protected kernel.
    FellBack { expected: String, observed: String },
    /// No answer within the deadline.
    TimedOut,
}

/// Poll the host until it answers `uname -r` or the deadline passes.
/// Backoff is exponential from one second, capped at a few seconds; a boot
/// takes a while and hammering a dead host helps nobody.
pub async fn wait_for_boot(
    remote: &dyn RemoteExec,
    expected_kernel: Option<&str>,
    timeout: Duration,
) -> BootResult {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if let Ok(output) = remote.run("uname -r", Some(PROBE_TIMEOUT)).await {
            if output.success() {
                let observed = output.stdout.trim().to_owned();
                debug!(host = %remote.host(), observed, "host answered boot probe");
                return match expected_kernel {
                    Some(expected) if expected != observed => BootResult::FellBack {
                        expected: expected.to_owned(),
                        observed,
                    },
                    _ => BootResult::BootedExpected {
                        observed: (!observed.is_empty()).then_some(observed),
                    },
                };
            }
        }

        if tokio::time::Instant::now() + backoff >= deadline {
            return BootResult::TimedOut;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}
