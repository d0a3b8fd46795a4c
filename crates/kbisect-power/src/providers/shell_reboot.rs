use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use kbisect_remote::RemoteExec;

use crate::interface::{PowerControlKind, PowerController, PowerError, PowerResult, PowerState};

const REBOOT_TIMEOUT: Duration = Duration::from_secs(5);

/// The null power variant: a `reboot` command over the host's own remote
/// shell. It can restart a healthy host, but a host whose OS stopped
/// responding is beyond it — that surfaces as `Unreachable`, and declaring
/// the host lost stays the coordinator's call.
pub struct ShellRebootController {
    remote: Arc<dyn RemoteExec>,
}

impl std::fmt::Debug for ShellRebootController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellRebootController")
            .field("remote_host", self.remote.host())
            .finish()
    }
}

impl ShellRebootController {
    pub fn new(remote: Arc<dyn RemoteExec>) -> Self {
        Self { remote }
    }

    async fn reboot(&self) -> PowerResult<()> {
        if !self.remote.is_alive().await {
            return Err(PowerError::Unreachable(format!(
                "host {} does not answer; shell reboot cannot reach it",
                self.remote.host()
            )));
        }

        info!(host = %self.remote.host(), "rebooting over remote shell");
        // The connection drops as the host goes down; any exit code or a
        // lost channel here means the command was delivered.
        match self.remote.run("reboot", Some(REBOOT_TIMEOUT)).await {
            Ok(_) => Ok(()),
            Err(kbisect_remote::ExecError::Timeout(_))
            | Err(kbisect_remote::ExecError::ChannelLost(_)) => Ok(()),
            Err(err) => Err(PowerError::BackendFailure(err.to_string())),
        }
    }
}

#[async_trait]
impl PowerController for ShellRebootController {
    fn kind(&self) -> PowerControlKind {
        PowerControlKind::ShellReboot
    }

    async fn status(&self) -> PowerResult<PowerState> {
        if self.remote.is_alive().await {
            Ok(PowerState::On)
        } else {
            Ok(PowerState::Unknown)
        }
    }

    async fn on(&self) -> PowerResult<()> {
        Err(PowerError::Unsupported("power on over remote shell"))
    }

    async fn off(&self) -> PowerResult<()> {
        Err(PowerError::Unsupported("power off over remote shell"))
    }

    async fn reset(&self) -> PowerResult<()> {
        self.reboot().await
    }

    async fn cycle(&self) -> PowerResult<()> {
        self.reboot().await
    }

    fn can_recover_unreachable(&self) -> bool {
        false
    }
}
