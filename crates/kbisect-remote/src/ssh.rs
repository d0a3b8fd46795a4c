use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use kbisect_core::HostId;

use crate::{
    ChunkSink, ExecError, ExecOutput, ExecResult, OutputStream, RemoteExec, StreamedOutput,
    STREAM_TAIL_BYTES,
};

/// ssh exits 255 when the transport itself failed (connection refused, auth
/// rejected, connection dropped); anything else is the remote command's own
/// exit code.
const SSH_TRANSPORT_EXIT: i32 = 255;

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Remote execution over the system `ssh`/`scp` binaries.
#[derive(Debug, Clone)]
pub struct SshRemote {
    host: HostId,
    user: String,
    library_file: String,
    connect_timeout: Duration,
}

impl SshRemote {
    pub fn new(
        host: HostId,
        user: impl Into<String>,
        library_file: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host,
            user: user.into(),
            library_file: library_file.into(),
            connect_timeout,
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg(self.target())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn classify_exit(&self, code: Option<i32>, stderr: &str) -> Result<i32, ExecError> {
        match code {
            Some(SSH_TRANSPORT_EXIT) => Err(ExecError::ChannelLost(format!(
                "ssh transport to {} failed: {}",
                self.host,
                stderr.trim()
            ))),
            Some(code) => Ok(code),
            None => Err(ExecError::ChannelLost(format!(
                "ssh to {} was killed by a signal",
                self.host
            ))),
        }
    }
}

#[async_trait]
impl RemoteExec for SshRemote {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn library_file(&self) -> &str {
        &self.library_file
    }

    async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecResult<ExecOutput> {
        debug!(host = %self.host, command, "remote exec");
        let future = self.ssh_command(command).output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| ExecError::Timeout(limit))?,
            None => future.await,
        }
        .map_err(|err| ExecError::Spawn(err.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = self.classify_exit(output.status.code(), &stderr)?;
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn run_streaming(
        &self,
        command: &str,
        timeout: Option<Duration>,
        sink: &dyn ChunkSink,
    ) -> ExecResult<StreamedOutput> {
        debug!(host = %self.host, command, "remote exec (streaming)");
        let mut child = self
            .ssh_command(command)
            .spawn()
            .map_err(|err| ExecError::Spawn(err.to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Spawn("child stdout not captured".to_owned()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Spawn("child stderr not captured".to_owned()))?;

        let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);
        let mut stdout_tail: Vec<u8> = Vec::new();
        let mut stderr_tail: Vec<u8> = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut stdout_buf = vec![0u8; READ_CHUNK_BYTES];
        let mut stderr_buf = vec![0u8; READ_CHUNK_BYTES];

        // Drain both pipes until they close; the child's exit status is
        // collected afterwards. On deadline the child is killed and the
        // caller sees a timeout, mirroring a non-streaming run.
        while stdout_open || stderr_open {
            let sleep_until = async {
                match deadline {
                    Some(instant) => tokio::time::sleep_until(instant).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                read = stdout.read(&mut stdout_buf), if stdout_open => {
                    match read {
                        Ok(0) => stdout_open = false,
                        Ok(n) => {
                            sink.chunk(OutputStream::Stdout, &stdout_buf[..n]);
                            append_tail(&mut stdout_tail, &stdout_buf[..n]);
                        }
                        Err(err) => {
                            warn!(host = %self.host, "stdout read failed: {err}");
                            stdout_open = false;
                        }
                    }
                }
                read = stderr.read(&mut stderr_buf), if stderr_open => {
                    match read {
                        Ok(0) => stderr_open = false,
                        Ok(n) => {
                            sink.chunk(OutputStream::Stderr, &stderr_buf[..n]);
                            append_tail(&mut stderr_tail, &stderr_buf[..n]);
                        }
                        Err(err) => {
                            warn!(host = %self.host, "stderr read failed: {err}");
                            stderr_open = false;
                        }
                    }
                }
                _ = sleep_until => {
                    let _ = child.kill().await;
                    return Err(ExecError::Timeout(
                        timeout.unwrap_or_default(),
                    ));
                }
            }
        }

        let wait = async { child.wait().await };
        let status = match deadline {
            Some(instant) => tokio::time::timeout_at(instant, wait)
                .await
                .map_err(|_| ExecError::Timeout(timeout.unwrap_or_default()))?,
            None => wait.await,
        }
        .map_err(|err| ExecError::ChannelLost(err.to_string()))?;

        let stderr_text = String::from_utf8_lossy(&stderr_tail).into_owned();
        let exit_code = self.classify_exit(status.code(), &stderr_text)?;
        Ok(StreamedOutput {
            exit_code,
            stdout_tail: String::from_utf8_lossy(&stdout_tail).into_owned(),
        })
    }

    async fn copy_file(&self, local: &str, remote: &str) -> ExecResult<()> {
        let output = Command::new("scp")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(local)
            .arg(format!("{}:{remote}", self.target()))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ExecError::Spawn(err.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ExecError::ChannelLost(format!(
                "scp {local} to {}:{remote} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn append_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    if tail.len() > STREAM_TAIL_BYTES {
        let excess = tail.len() - STREAM_TAIL_BYTES;
        tail.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kbisect_core::HostId;

    use super::{append_tail, SshRemote};
    use crate::ExecError;

    fn remote() -> SshRemote {
        SshRemote::new(
            HostId::new("h1"),
            "root",
            "/root/kernel-bisect/lib/bisect-functions.sh",
            Duration::from_secs(15),
        )
    }

    #[test]
    fn transport_exit_maps_to_channel_lost() {
        let remote = remote();
        let error = remote
            .classify_exit(Some(255), "Connection refused")
            .expect_err("255 is a transport failure");
        assert!(matches!(error, ExecError::ChannelLost(_)));
        assert!(error.to_string().contains("Connection refused"));
    }

    #[test]
    fn ordinary_exit_codes_pass_through() {
        let remote = remote();
        assert_eq!(remote.classify_exit(Some(0), "").expect("clean exit"), 0);
        assert_eq!(remote.classify_exit(Some(2), "").expect("nonzero exit"), 2);
    }

    #[test]
    fn signal_death_is_channel_lost() {
        let remote = remote();
        let error = remote
            .classify_exit(None, "")
            .expect_err("signal death is a transport failure");
        assert!(matches!(error, ExecError::ChannelLost(_)));
    }

    #[test]
    fn tail_is_bounded() {
        let mut tail = Vec::new();
        append_tail(&mut tail, &[b'a'; 6000]);
        append_tail(&mut tail, &[b'b'; 6000]);
        assert_eq!(tail.len(), crate::STREAM_TAIL_BYTES);
        assert_eq!(tail[tail.len() - 1], b'b');
    }
}
