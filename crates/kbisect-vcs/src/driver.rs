use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use kbisect_core::IterationVerdict;

use crate::{CommandRunner, VcsError, VcsResult};

const SHA_LENGTH: usize = 40;

/// Result of marking a candidate: whether the search converged, and the
/// first bad commit when git could name one. A converged search without a
/// first bad commit means only skipped candidates remained — inconclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutcome {
    pub done: bool,
    pub first_bad: Option<String>,
}

/// Adapter over `git bisect` in one working copy.
pub struct GitBisectDriver {
    runner: Arc<dyn CommandRunner>,
    repo: PathBuf,
}

impl GitBisectDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, repo: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            repo: repo.into(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[&str]) -> VcsResult<std::process::Output> {
        let mut full_args = vec!["-C".to_owned(), self.repo.display().to_string()];
        full_args.extend(args.iter().map(|arg| (*arg).to_owned()));
        self.runner
            .run("git", &full_args)
            .await
            .map_err(|err| VcsError::Command(format!("failed to execute git: {err}")))
    }

    async fn git_ok(&self, args: &[&str]) -> VcsResult<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(VcsError::Command(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn resolve(&self, reference: &str) -> VcsResult<String> {
        let stdout = self
            .git_ok(&["rev-parse", &format!("{reference}^{{commit}}")])
            .await?;
        let sha = stdout.trim().to_owned();
        if !is_valid_sha(&sha) {
            return Err(VcsError::InvalidOutput(format!(
                "rev-parse returned '{sha}' for '{reference}'"
            )));
        }
        Ok(sha)
    }

    /// Begin bisection, or verify an in-flight one matches the requested
    /// endpoints. Idempotent by contract: `init` twice is a no-op.
    pub async fn start(&self, good_ref: &str, bad_ref: &str) -> VcsResult<()> {
        let good = self.resolve(good_ref).await?;
        let bad = self.resolve(bad_ref).await?;

        if let Some(log) = self.bisect_log().await? {
            let endpoints = parse_log_endpoints(&log);
            return match endpoints {
                Some((found_good, found_bad)) if found_good == good && found_bad == bad => {
                    debug!("bisection already started with matching endpoints");
                    Ok(())
                }
                Some((found_good, found_bad)) => Err(VcsError::EndpointMismatch {
                    expected_good: good,
                    expected_bad: bad,
                    found_good,
                    found_bad,
                }),
                None => Err(VcsError::InvalidOutput(
                    "bisect log present but endpoints unreadable".to_owned(),
                )),
            };
        }

        info!(good = %good, bad = %bad, "starting git bisect");
        self.git_ok(&["bisect", "start", &bad, &good]).await?;
        Ok(())
    }

    /// The candidate git checked out for testing, or `None` once the search
    /// has converged.
    pub async fn current(&self) -> VcsResult<Option<String>> {
        if let Some(log) = self.bisect_log().await? {
            if parse_first_bad_from_log(&log).is_some() {
                return Ok(None);
            }
        }
        let stdout = self.git_ok(&["rev-parse", "HEAD"]).await?;
        let sha = stdout.trim().to_owned();
        if !is_valid_sha(&sha) {
            return Err(VcsError::InvalidOutput(format!(
                "rev-parse HEAD returned '{sha}'"
            )));
        }
        Ok(Some(sha))
    }

    /// Mark the current candidate. A successful mark is durable (git writes
    /// its bisect log before returning).
    pub async fn mark(&self, verdict: IterationVerdict) -> VcsResult<MarkOutcome> {
        let subcommand = match verdict {
            IterationVerdict::Good => "good",
            IterationVerdict::Bad => "bad",
            IterationVerdict::Skip => "skip",
            IterationVerdict::Pending => {
                return Err(VcsError::MarkRejected(
                    "a pending iteration cannot be marked".to_owned(),
                ))
            }
        };

        let output = self.git(&["bisect", subcommand]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let combined = format!("{stdout}\n{stderr}");

        // "cannot bisect more" arrives with a nonzero exit when only skips
        // remain; it is convergence, not rejection.
        if is_inconclusive(&combined) {
            info!("bisection converged with only skipped candidates left");
            return Ok(MarkOutcome {
                done: true,
                first_bad: None,
            });
        }
        if !output.status.success() {
            return Err(VcsError::MarkRejected(format!(
                "git bisect {subcommand}: {}",
                stderr.trim()
            )));
        }

        if let Some(first_bad) = parse_first_bad(&combined) {
            info!(first_bad = %first_bad, "bisection converged");
            return Ok(MarkOutcome {
                done: true,
                first_bad: Some(first_bad),
            });
        }
        Ok(MarkOutcome {
            done: false,
            first_bad: None,
        })
    }

    /// The most recent mark recorded in the bisect log, for resume
    /// reconciliation. The VCS is authoritative over the store.
    pub async fn last_mark(&self) -> VcsResult<Option<(String, IterationVerdict)>> {
        match self.bisect_log().await? {
            Some(log) => Ok(parse_last_mark(&log)),
            None => Ok(None),
        }
    }

    pub async fn first_bad(&self) -> VcsResult<Option<String>> {
        match self.bisect_log().await? {
            Some(log) => Ok(parse_first_bad_from_log(&log)),
            None => Ok(None),
        }
    }

    pub async fn reset(&self) -> VcsResult<()> {
        self.git_ok(&["bisect", "reset"]).await?;
        Ok(())
    }

    pub async fn commit_message(&self, sha: &str) -> VcsResult<String> {
        let stdout = self.git_ok(&["log", "-1", "--format=%s", sha]).await?;
        Ok(stdout.trim().to_owned())
    }

    /// The bisect log, or `None` when no bisection is in progress.
    async fn bisect_log(&self) -> VcsResult<Option<String>> {
        let output = self.git(&["bisect", "log"]).await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(None)
        }
    }
}

pub(crate) fn is_valid_sha(candidate: &str) -> bool {
    candidate.len() == SHA_LENGTH && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_inconclusive(output: &str) -> bool {
    output.contains("cannot bisect more")
        || output.contains("only 'skip'ped commits left")
        || output.contains("only skipped commits left")
}

/// "<sha> is the first bad commit" from mark output.
fn parse_first_bad(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_suffix("is the first bad commit") {
            let sha = rest.trim();
            if is_valid_sha(sha) {
                return Some(sha.to_owned());
            }
        }
    }
    None
}

/// "# first bad commit: [<sha>] <subject>" from the bisect log.
fn parse_first_bad_from_log(log: &str) -> Option<String> {
    for line in log.lines() {
        if let Some(rest) = line.trim().strip_prefix("# first bad commit:") {
            let rest = rest.trim();
            if let Some(open) = rest.find('[') {
                if let Some(close) = rest[open..].find(']') {
                    let sha = &rest[open + 1..open + close];
                    if is_valid_sha(sha) {
                        return Some(sha.to_owned());
                    }
                }
            }
        }
    }
    None
}

/// Initial endpoints: the shas of the first `git bisect bad` and
/// `git bisect good` entries.
fn parse_log_endpoints(log: &str) -> Option<(String, String)> {
    let mut good = None;
    let mut bad = None;
    for line in log.lines() {
        let line = line.trim();
        if bad.is_none() {
            if let Some(sha) = line.strip_prefix("git bisect bad ") {
                if is_valid_sha(sha.trim()) {
                    bad = Some(sha.trim().to_owned());
                }
            }
        }
        if good.is_none() {
            if let Some(sha) = line.strip_prefix("git bisect good ") {
                if is_valid_sha(sha.trim()) {
                    good = Some(sha.trim().to_owned());
                }
            }
        }
        if good.is_some() && bad.is_some() {
            break;
        }
    }
    Some((good?, bad?))
}

/// Last `git bisect good|bad|skip <sha>` entry in the log.
fn parse_last_mark(log: &str) -> Option<(String, IterationVerdict)> {
    let mut last = None;
    for line in log.lines() {
        let line = line.trim();
        let parsed = if let Some(sha) = line.strip_prefix("git bisect good ") {
            Some((sha.trim(), IterationVerdict::Good))
        } else if let Some(sha) = line.strip_prefix("git bisect bad ") {
            Some((sha.trim(), IterationVerdict::Bad))
        } else if let Some(sha) = line.strip_prefix("git bisect skip ") {
            Some((sha.trim(), IterationVerdict::Skip))
        } else {
            None
        };
        if let Some((sha, verdict)) = parsed {
            if is_valid_sha(sha) {
                last = Some((sha.to_owned(), verdict));
            }
        }
    }
    last
}
