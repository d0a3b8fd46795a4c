use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::providers::spawn_capture;
use crate::{CaptureHandle, ConsoleCollector, ConsoleCollectorKind, ConsoleResult};

/// Reads a host's serial console from a conserver concentrator via the
/// `console` client in force-read-only mode.
pub struct ConserverCollector {
    console_name: String,
}

impl ConserverCollector {
    pub fn new(console_name: impl Into<String>) -> Self {
        Self {
            console_name: console_name.into(),
        }
    }
}

#[async_trait]
impl ConsoleCollector for ConserverCollector {
    fn kind(&self) -> ConsoleCollectorKind {
        ConsoleCollectorKind::Conserver
    }

    async fn start(&self) -> ConsoleResult<CaptureHandle> {
        debug!(console = %self.console_name, "starting conserver capture");
        let mut command = Command::new("console");
        command.arg("-f").arg(&self.console_name);
        let capture = spawn_capture(self.kind(), command, None, None)?;
        Ok(CaptureHandle::new(capture))
    }
}
