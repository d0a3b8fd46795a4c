use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kbisect_config::{BisectConfig, HostConfig, PowerControlSelection};
use kbisect_console::{ConserverCollector, ConsoleChain, ConsoleCollector, IpmiSolCollector};
use kbisect_core::HostId;
use kbisect_power::{build_controller, PowerControlKind, PowerSettings};
use kbisect_remote::{shell_quote, RemoteExec, SshRemote};
use kbisect_runner::{HostRunner, HostRunnerSpec, RecoveryPolicy, RunnerTimeouts};
use kbisect_store::Store;
use kbisect_vcs::GitBisectDriver;

use crate::agent::{AgentDescriptor, HostAgent, LiveHostAgent};
use crate::coordinator::{Coordinator, EngineSettings};
use crate::{EngineError, EngineResult};

/// Timeout for individual git invocations on the primary host; bisect
/// checkouts of a kernel tree can take a while.
const GIT_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs the bisect driver's git commands on the primary host's kernel tree
/// over its remote channel. The working copy lives with the sources being
/// built; the control node only drives it.
pub struct SshCommandRunner {
    remote: Arc<dyn RemoteExec>,
    timeout: Duration,
}

impl SshCommandRunner {
    pub fn new(remote: Arc<dyn RemoteExec>) -> Self {
        Self {
            remote,
            timeout: GIT_OP_TIMEOUT,
        }
    }
}

#[async_trait]
impl kbisect_vcs::CommandRunner for SshCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<std::process::Output> {
        let mut command = shell_quote(program);
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }

        match self.remote.run(&command, Some(self.timeout)).await {
            Ok(output) => Ok(std::process::Output {
                status: std::process::ExitStatus::from_raw(output.exit_code << 8),
                stdout: output.stdout.into_bytes(),
                stderr: output.stderr.into_bytes(),
            }),
            Err(err) => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                err.to_string(),
            )),
        }
    }
}

pub fn power_settings(host: &HostConfig) -> PowerSettings {
    let kind = match host.power_control {
        PowerControlSelection::Ipmi => PowerControlKind::Ipmi,
        PowerControlSelection::LabAutomation => PowerControlKind::LabAutomation,
        PowerControlSelection::ShellReboot => PowerControlKind::ShellReboot,
    };
    PowerSettings {
        kind,
        host_fqdn: host.hostname.clone(),
        ipmi_host: host.ipmi_host.clone(),
        ipmi_user: host.ipmi_user.clone(),
        ipmi_password: host.ipmi_password.clone(),
    }
}

pub fn build_remote(config: &BisectConfig, host: &HostConfig) -> Arc<dyn RemoteExec> {
    Arc::new(SshRemote::new(
        HostId::new(host.hostname.clone()),
        host.ssh_user.clone(),
        host.library_file(),
        Duration::from_secs(config.bisect.ssh_connect_timeout_secs),
    ))
}

fn console_chain(config: &BisectConfig, host: &HostConfig) -> ConsoleChain {
    if !config.bisect.collect_console_logs {
        return ConsoleChain::empty();
    }
    let console_host = config
        .console
        .hostname_override
        .clone()
        .unwrap_or_else(|| host.hostname.clone());

    let mut collectors: Vec<Arc<dyn ConsoleCollector>> = Vec::new();
    for key in &config.console.collectors {
        match key.as_str() {
            "conserver" => {
                collectors.push(Arc::new(ConserverCollector::new(console_host.clone())));
            }
            "ipmi_sol" => {
                if let (Some(bmc), Some(user), Some(password)) = (
                    host.ipmi_host.as_deref(),
                    host.ipmi_user.as_deref(),
                    host.ipmi_password.as_deref(),
                ) {
                    collectors.push(Arc::new(IpmiSolCollector::new(bmc, user, password)));
                }
            }
            _ => {}
        }
    }
    ConsoleChain::new(collectors)
}

/// Where a host's test script runs from, and whether it must be deployed
/// there first. A script present on the control node is pushed into the
/// on-host library's `test-scripts/` directory at init.
fn resolve_test_script(host: &HostConfig) -> (Option<String>, Option<(PathBuf, String)>) {
    let Some(script) = host.test_script.as_deref() else {
        return (None, None);
    };
    let local = Path::new(script);
    if !local.exists() {
        // Assumed to be a path on the host itself.
        return (Some(script.to_owned()), None);
    }
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "test.sh".to_owned());
    let base = Path::new(&host.library_path)
        .parent()
        .map(|parent| parent.display().to_string())
        .unwrap_or_else(|| "/root".to_owned());
    let remote_path = format!("{base}/test-scripts/{name}");
    (
        Some(remote_path.clone()),
        Some((local.to_path_buf(), remote_path)),
    )
}

/// Assemble the full production coordinator from a validated configuration:
/// one agent per host (remote channel, power controller, console chain, host
/// runner) and a bisect driver bound to the primary host's kernel tree.
pub fn build_coordinator(config: &BisectConfig, store: Arc<Store>) -> EngineResult<Coordinator> {
    let timeouts = RunnerTimeouts {
        build: Duration::from_secs(config.bisect.build_timeout_secs),
        boot: Duration::from_secs(config.bisect.boot_timeout_secs),
        test: Duration::from_secs(config.bisect.test_timeout_secs),
    };
    let recovery = RecoveryPolicy {
        attempts: config.bisect.recovery_attempts,
        delay: Duration::from_secs(config.bisect.recovery_delay_secs),
    };

    let mut agents: Vec<Arc<dyn HostAgent>> = Vec::with_capacity(config.hosts.len());
    let mut primary: Option<(Arc<dyn RemoteExec>, String)> = None;

    for host in &config.hosts {
        let remote = build_remote(config, host);
        if primary.is_none() {
            primary = Some((Arc::clone(&remote), host.kernel_path.clone()));
        }

        let power = build_controller(&power_settings(host), Arc::clone(&remote))
            .map_err(|err| EngineError::Config(err.to_string()))?;
        let console = console_chain(config, host);
        let (test_script, deploy_script) = resolve_test_script(host);

        let spec = HostRunnerSpec {
            host: HostId::new(host.hostname.clone()),
            kernel_path: host.kernel_path.clone(),
            test_mode: config.test_mode(),
            test_script: test_script.clone(),
            base_config: host.base_config.clone(),
            timeouts,
            recovery,
        };
        let runner = HostRunner::new(
            spec,
            Arc::clone(&remote),
            power,
            console,
            Arc::clone(&store),
        );
        let descriptor = AgentDescriptor {
            ssh_user: host.ssh_user.clone(),
            kernel_path: host.kernel_path.clone(),
            power_control: power_settings(host).kind.as_key().to_owned(),
            test_script,
        };
        agents.push(Arc::new(LiveHostAgent::new(
            remote,
            runner,
            descriptor,
            deploy_script,
        )));
    }

    let (primary_remote, kernel_path) = primary
        .ok_or_else(|| EngineError::Config("no hosts configured".to_owned()))?;
    let driver = Arc::new(GitBisectDriver::new(
        Arc::new(SshCommandRunner::new(primary_remote)),
        kernel_path,
    ));

    let settings = EngineSettings {
        test_mode: config.test_mode(),
        config_snapshot: config
            .snapshot_json()
            .map_err(|err| EngineError::Config(err.to_string()))?
            .to_string(),
        collect_baseline: config.bisect.collect_baseline,
        collect_per_iteration: config.bisect.collect_per_iteration,
        cleanup_keep_kernels: config.bisect.cleanup_keep_kernels,
    };

    Ok(Coordinator::new(store, driver, agents, settings))
}
