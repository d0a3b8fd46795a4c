use std::io::Write;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::providers::spawn_capture;
use crate::{CaptureHandle, ConsoleCollector, ConsoleCollectorKind, ConsoleError, ConsoleResult};

/// Serial-over-LAN capture through the host's BMC. `sol deactivate` runs on
/// stop so a dangling SOL session does not block the next capture.
pub struct IpmiSolCollector {
    bmc_host: String,
    user: String,
    password: String,
}

impl IpmiSolCollector {
    pub fn new(
        bmc_host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            bmc_host: bmc_host.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    fn base_args(&self, password_file: &str) -> Vec<String> {
        vec![
            "-I".to_owned(),
            "lanplus".to_owned(),
            "-H".to_owned(),
            self.bmc_host.clone(),
            "-U".to_owned(),
            self.user.clone(),
            "-f".to_owned(),
            password_file.to_owned(),
        ]
    }
}

#[async_trait]
impl ConsoleCollector for IpmiSolCollector {
    fn kind(&self) -> ConsoleCollectorKind {
        ConsoleCollectorKind::IpmiSol
    }

    async fn start(&self) -> ConsoleResult<CaptureHandle> {
        debug!(bmc = %self.bmc_host, "starting ipmi sol capture");

        let mut password_file = tempfile::Builder::new()
            .prefix("kbisect-sol-")
            .tempfile()
            .map_err(|err| ConsoleError::Start(format!("password file: {err}")))?;
        password_file
            .write_all(self.password.as_bytes())
            .and_then(|_| password_file.flush())
            .map_err(|err| ConsoleError::Start(format!("password file: {err}")))?;
        let path = password_file
            .path()
            .to_str()
            .ok_or_else(|| ConsoleError::Start("password file path not UTF-8".to_owned()))?
            .to_owned();

        let mut args = self.base_args(&path);
        args.push("sol".to_owned());
        args.push("activate".to_owned());
        let mut command = Command::new("ipmitool");
        command.args(&args);

        let mut teardown_args = self.base_args(&path);
        teardown_args.push("sol".to_owned());
        teardown_args.push("deactivate".to_owned());

        let capture = spawn_capture(
            self.kind(),
            command,
            Some(("ipmitool".to_owned(), teardown_args)),
            Some(password_file),
        )?;
        Ok(CaptureHandle::new(capture))
    }
}
