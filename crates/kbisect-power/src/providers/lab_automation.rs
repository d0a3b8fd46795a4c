use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::interface::{
    with_retry, CommandRunner, PowerControlKind, PowerController, PowerError, PowerResult,
    PowerState,
};

const CYCLE_WAIT: Duration = Duration::from_secs(10);

/// Power control through the lab-automation `bkr system-power` command.
/// Authentication is external (Kerberos ticket of the invoking user); the
/// back end cannot report power status.
pub struct LabAutomationController {
    runner: Arc<dyn CommandRunner>,
    fqdn: String,
}

impl std::fmt::Debug for LabAutomationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabAutomationController")
            .field("fqdn", &self.fqdn)
            .finish()
    }
}

impl LabAutomationController {
    pub fn new(runner: Arc<dyn CommandRunner>, fqdn: impl Into<String>) -> Self {
        Self {
            runner,
            fqdn: fqdn.into(),
        }
    }

    fn action_args(&self, action: &str) -> Vec<String> {
        vec![
            "system-power".to_owned(),
            "--action".to_owned(),
            action.to_owned(),
            "--force".to_owned(),
            "--clear-netboot".to_owned(),
            self.fqdn.clone(),
        ]
    }

    async fn action(&self, action: &str) -> PowerResult<()> {
        let args = self.action_args(action);
        let output = self
            .runner
            .run("bkr", &args)
            .await
            .map_err(|err| PowerError::BackendFailure(format!("bkr failed to run: {err}")))?;

        if output.status.success() {
            debug!(fqdn = %self.fqdn, action, "lab automation power command accepted");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PowerError::BackendFailure(format!(
                "bkr system-power --action {action} {} failed: {}",
                self.fqdn,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl PowerController for LabAutomationController {
    fn kind(&self) -> PowerControlKind {
        PowerControlKind::LabAutomation
    }

    async fn status(&self) -> PowerResult<PowerState> {
        // The back end has no status query.
        Ok(PowerState::Unknown)
    }

    async fn on(&self) -> PowerResult<()> {
        with_retry("lab automation power on", || self.action("on")).await
    }

    async fn off(&self) -> PowerResult<()> {
        with_retry("lab automation power off", || self.action("off")).await
    }

    async fn reset(&self) -> PowerResult<()> {
        with_retry("lab automation reboot", || self.action("reboot")).await
    }

    async fn cycle(&self) -> PowerResult<()> {
        info!(fqdn = %self.fqdn, "lab automation power cycle");
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

    use super::LabAutomationController;
    use crate::interface::{CommandRunner, PowerController, PowerState};

    struct ScriptedRunner {
        exit_codes: Mutex<Vec<i32>>,
        invocations: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(exit_codes: Vec<i32>) -> Self {
            Self {
                exit_codes: Mutex::new(exit_codes),
                invocations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _program: &str,
            args: &[String],
        ) -> std::io::Result<std::process::Output> {
            self.invocations
                .lock()
                .expect("lock invocations")
                .push(args.to_vec());
            let code = {
                let mut codes = self.exit_codes.lock().expect("lock exit codes");
                if codes.is_empty() {
                    0
                } else {
                    codes.remove(0)
                }
            };
            Ok(std::process::Output {
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: Vec::new(),
                stderr: b"ticket rejected".to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn reboot_uses_force_and_clear_netboot() {
        let runner = Arc::new(ScriptedRunner::new(vec![0]));
        let controller = LabAutomationController::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "box1.lab.example.com",
        );
        controller.reset().await.expect("reset");

        let invocations = runner.invocations.lock().expect("lock invocations");
        assert_eq!(
            invocations[0],
            vec![
                "system-power",
                "--action",
                "reboot",
                "--force",
                "--clear-netboot",
                "box1.lab.example.com",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_backend_failure_is_retried() {
        let runner = Arc::new(ScriptedRunner::new(vec![1, 0]));
        let controller = LabAutomationController::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "box1.lab.example.com",
        );
        controller.on().await.expect("second attempt succeeds");
        assert_eq!(runner.invocations.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn status_is_always_unknown() {
        let runner = Arc::new(ScriptedRunner::new(Vec::new()));
        let controller = LabAutomationController::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "box1.lab.example.com",
        );
        assert_eq!(controller.status().await.expect("status"), PowerState::Unknown);
        assert!(runner.invocations.lock().expect("lock").is_empty());
    }
}
