use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::interface::{
    with_retry, CommandRunner, PowerControlKind, PowerController, PowerError, PowerResult,
    PowerState,
};

const CYCLE_WAIT: Duration = Duration::from_secs(10);

/// Out-of-band power control through a BMC, via the `ipmitool` CLI.
///
/// The password is handed to ipmitool through a 0600 temp file created per
/// invocation and removed when the call returns, on every exit path; it is
/// never put on the command line or in a log record.
pub struct IpmiController {
    runner: Arc<dyn CommandRunner>,
    bmc_host: String,
    user: String,
    password: String,
}

impl std::fmt::Debug for IpmiController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpmiController")
            .field("bmc_host", &self.bmc_host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl IpmiController {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bmc_host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            bmc_host: bmc_host.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    fn power_args(&self, password_file: &str, action: &str) -> Vec<String> {
        vec![
            "-I".to_owned(),
            "lanplus".to_owned(),
            "-H".to_owned(),
            self.bmc_host.clone(),
            "-U".to_owned(),
            self.user.clone(),
            "-f".to_owned(),
            password_file.to_owned(),
            "power".to_owned(),
            action.to_owned(),
        ]
    }

    async fn power_command(&self, action: &str) -> PowerResult<String> {
        // NamedTempFile is created 0600 and unlinked when the guard drops.
        let password_file = write_password_file(&self.password)?;
        let path = password_file
            .path()
            .to_str()
            .ok_or_else(|| {
                PowerError::Configuration("password file path is not valid UTF-8".to_owned())
            })?
            .to_owned();

        let args = self.power_args(&path, action);
        let output = self
            .runner
            .run("ipmitool", &args)
            .await
            .map_err(|err| PowerError::BackendFailure(format!("ipmitool failed to run: {err}")))?;
        drop(password_file);

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            debug!(bmc = %self.bmc_host, action, "ipmi power command accepted");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PowerError::BackendFailure(format!(
                "ipmitool power {action} against {} failed: {}",
                self.bmc_host,
                stderr.trim()
            )))
        }
    }
}

fn write_password_file(password: &str) -> PowerResult<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("kbisect-ipmi-")
        .tempfile()
        .map_err(|err| {
            PowerError::Configuration(format!("failed to create password file: {err}"))
        })?;
    file.write_all(password.as_bytes()).map_err(|err| {
        PowerError::Configuration(format!("failed to write password file: {err}"))
    })?;
    file.flush()
        .map_err(|err| PowerError::Configuration(format!("failed to flush password file: {err}")))?;
    Ok(file)
}

pub(crate) fn parse_power_status(stdout: &str) -> PowerState {
    let lowered = stdout.to_ascii_lowercase();
    if lowered.contains("power is on") {
        PowerState::On
    } else if lowered.contains("power is off") {
        PowerState::Off
    } else {
        PowerState::Unknown
    }
}

#[async_trait]
impl PowerController for IpmiController {
    fn kind(&self) -> PowerControlKind {
        PowerControlKind::Ipmi
    }

    async fn status(&self) -> PowerResult<PowerState> {
        let stdout = self.power_command("status").await?;
        Ok(parse_power_status(&stdout))
    }

    async fn on(&self) -> PowerResult<()> {
        with_retry("ipmi power on", || async {
            self.power_command("on").await.map(|_| ())
        })
        .await
    }

    async fn off(&self) -> PowerResult<()> {
        with_retry("ipmi power off", || async {
            self.power_command("off").await.map(|_| ())
        })
        .await
    }

    async fn reset(&self) -> PowerResult<()> {
        with_retry("ipmi power reset", || async {
            self.power_command("reset").await.map(|_| ())
        })
        .await
    }

    async fn cycle(&self) -> PowerResult<()> {
        info!(bmc = %self.bmc_host, "ipmi hard power cycle");
        self.off().await?;
        tokio::time::sleep(CYCLE_WAIT).await;
        self.on().await
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{parse_power_status, IpmiController};
    use crate::interface::{CommandRunner, PowerController, PowerState};

    #[derive(Default)]
    struct RecordingRunner {
        invocations: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> std::io::Result<std::process::Output> {
            self.invocations
                .lock()
                .expect("lock invocations")
                .push((program.to_owned(), args.to_vec()));
            Ok(std::process::Output {
                status: std::process::ExitStatus::from_raw(0),
                stdout: b"Chassis Power is on\n".to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    #[test]
    fn status_output_parses_on_off_and_unknown() {
        assert_eq!(parse_power_status("Chassis Power is on"), PowerState::On);
        assert_eq!(parse_power_status("Chassis Power is off"), PowerState::Off);
        assert_eq!(parse_power_status("garbled"), PowerState::Unknown);
    }

    #[tokio::test]
    async fn password_never_appears_in_argv() {
        let runner = Arc::new(RecordingRunner::default());
        let controller = IpmiController::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "bmc.example.com",
            "admin",
            "hunter2",
        );

        let state = controller.status().await.expect("status");
        assert_eq!(state, PowerState::On);

        let invocations = runner.invocations.lock().expect("lock invocations");
        let (program, args) = &invocations[0];
        assert_eq!(program, "ipmitool");
        assert!(args.iter().all(|arg| !arg.contains("hunter2")));
        assert!(args.contains(&"-f".to_owned()));
        assert!(args.contains(&"lanplus".to_owned()));
        assert_eq!(args[args.len() - 2..], ["power", "status"]);
    }
}
