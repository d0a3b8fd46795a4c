pub mod conserver;
pub mod ipmi_sol;

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::CaptureBuffer;
use crate::{ConsoleCollectorKind, ConsoleError, ConsoleResult};

const READ_CHUNK_BYTES: usize = 4 * 1024;

/// A capture child process plus the background task draining its stdout.
pub(crate) struct RunningCapture {
    pub(crate) kind: ConsoleCollectorKind,
    child: Child,
    reader: JoinHandle<()>,
    buffer: Arc<Mutex<CaptureBuffer>>,
    /// Extra command to run after the capture child dies (`sol deactivate`).
    teardown: Option<(String, Vec<String>)>,
    /// Keeps the credential file alive for the capture's lifetime; removed
    /// when the capture stops, on every exit path.
    _password_file: Option<tempfile::NamedTempFile>,
}

pub(crate) fn spawn_capture(
    kind: ConsoleCollectorKind,
    mut command: Command,
    teardown: Option<(String, Vec<String>)>,
    password_file: Option<tempfile::NamedTempFile>,
) -> ConsoleResult<RunningCapture> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ConsoleError::Start(err.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ConsoleError::Start("capture stdout not piped".to_owned()))?;

    let buffer = Arc::new(Mutex::new(CaptureBuffer::new()));
    let reader_buffer = Arc::clone(&buffer);
    let reader = tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut guard = match reader_buffer.lock() {
                        Ok(guard) => guard,
                        Err(_) => break,
                    };
                    if let Err(err) = guard.write(&chunk[..n]) {
                        warn!("console capture buffer write failed: {err}");
                        break;
                    }
                }
                Err(err) => {
                    debug!("console capture stream ended: {err}");
                    break;
                }
            }
        }
    });

    Ok(RunningCapture {
        kind,
        child,
        reader,
        buffer,
        teardown,
        _password_file: password_file,
    })
}

impl RunningCapture {
    pub(crate) async fn stop(mut self) -> Vec<u8> {
        let _ = self.child.kill().await;
        let _ = self.reader.await;

        if let Some((program, args)) = self.teardown.take() {
            let result = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(err) = result {
                warn!("console capture teardown `{program}` failed: {err}");
            }
        }

        let captured = self
            .buffer
            .lock()
            .map_err(|_| ConsoleError::Io("capture buffer mutex poisoned".to_owned()))
            .and_then(|mut guard| guard.take());
        match captured {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("console capture lost: {err}");
                Vec::new()
            }
        }
    }
}
