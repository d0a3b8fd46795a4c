//! Remote execution channel: run a command or a named operation from the
//! on-host shell library, streaming output incrementally, with the
//! transport-broke / clean-nonzero-exit distinction callers depend on.

mod ssh;

pub use ssh::SshRemote;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use kbisect_core::HostId;

/// How many bytes of trailing stdout a streaming call retains. Callers only
/// need the tail (the build operation prints the kernel version last); the
/// full stream goes to the sink.
pub const STREAM_TAIL_BYTES: usize = 8 * 1024;

/// Liveness probe timeout.
pub const ALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote channel lost: {0}")]
    ChannelLost(String),
    #[error("remote exec failed to start: {0}")]
    Spawn(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Fully buffered result of a short command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of a streaming command: the full output went to the sink; only a
/// bounded stdout tail is retained here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedOutput {
    pub exit_code: i32,
    pub stdout_tail: String,
}

impl StreamedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of the retained tail.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout_tail
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives output chunks as they arrive. Implementations must be cheap and
/// must not block the read loop; persistence failures are theirs to log.
pub trait ChunkSink: Send + Sync {
    fn chunk(&self, stream: OutputStream, bytes: &[u8]);
}

/// Sink that drops everything.
pub struct NullSink;

impl ChunkSink for NullSink {
    fn chunk(&self, _stream: OutputStream, _bytes: &[u8]) {}
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    fn host(&self) -> &HostId;

    async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecResult<ExecOutput>;

    async fn run_streaming(
        &self,
        command: &str,
        timeout: Option<Duration>,
        sink: &dyn ChunkSink,
    ) -> ExecResult<StreamedOutput>;

    /// Invoke a named operation from the on-host shell library.
    async fn call_op(
        &self,
        op: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> ExecResult<ExecOutput> {
        self.run(&op_command(self.library_file(), op, args), timeout)
            .await
    }

    async fn call_op_streaming(
        &self,
        op: &str,
        args: &[&str],
        timeout: Option<Duration>,
        sink: &dyn ChunkSink,
    ) -> ExecResult<StreamedOutput> {
        self.run_streaming(&op_command(self.library_file(), op, args), timeout, sink)
            .await
    }

    fn library_file(&self) -> &str;

    async fn is_alive(&self) -> bool {
        matches!(
            self.run("echo alive", Some(ALIVE_PROBE_TIMEOUT)).await,
            Ok(output) if output.success()
        )
    }

    async fn copy_file(&self, local: &str, remote: &str) -> ExecResult<()>;
}

/// Single-quote shell escaping; safe against embedded quotes and metachars.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return value.to_owned();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// `source <library> && <op> <quoted args...>`
pub fn op_command(library_file: &str, op: &str, args: &[&str]) -> String {
    let mut command = format!("source {} && {op}", shell_quote(library_file));
    for arg in args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::{op_command, shell_quote, StreamedOutput};

    #[test]
    fn plain_tokens_are_not_quoted() {
        assert_eq!(shell_quote("abc123"), "abc123");
        assert_eq!(shell_quote("/root/kernel"), "/root/kernel");
        assert_eq!(shell_quote("v6.6-rc1"), "v6.6-rc1");
    }

    #[test]
    fn metacharacters_are_single_quoted() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn embedded_single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn op_command_sources_library_and_quotes_args() {
        let command = op_command(
            "/root/kernel-bisect/lib/bisect-functions.sh",
            "build_kernel",
            &["abc123", "/root/kernel", "my config"],
        );
        assert_eq!(
            command,
            "source /root/kernel-bisect/lib/bisect-functions.sh && build_kernel abc123 /root/kernel 'my config'"
        );
    }

    #[test]
    fn last_line_skips_trailing_whitespace() {
        let output = StreamedOutput {
            exit_code: 0,
            stdout_tail: "CC fork.o\n6.6.0-rc1-00042-gabc123\n  \n".to_owned(),
        };
        assert_eq!(output.last_line(), Some("6.6.0-rc1-00042-gabc123"));
    }
}
