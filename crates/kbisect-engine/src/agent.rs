use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use kbisect_core::{HostId, HostOutcome, IterationId};
use kbisect_remote::RemoteExec;
use kbisect_runner::{HostRunner, RunnerResult};

use crate::{EngineError, EngineResult};

const OP_TIMEOUT: Duration = Duration::from_secs(60);
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Host fields the store records at session creation.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub ssh_user: String,
    pub kernel_path: String,
    pub power_control: String,
    pub test_script: Option<String>,
}

/// Everything the coordinator needs from one host: iteration execution plus
/// the handful of maintenance operations around it. Production hosts are
/// `LiveHostAgent`; tests script this trait directly.
#[async_trait]
pub trait HostAgent: Send + Sync {
    fn host(&self) -> &HostId;

    fn descriptor(&self) -> AgentDescriptor;

    /// Cheap liveness probe over the remote channel.
    async fn probe(&self) -> bool;

    /// One-time host preparation: lock the running kernel as protected and
    /// deploy the test script when it lives on the control node.
    async fn prepare(&self) -> EngineResult<()>;

    async fn collect_metadata(&self, kind: &str) -> Option<serde_json::Value>;

    async fn run_iteration(&self, iteration: IterationId, sha: &str) -> RunnerResult<HostOutcome>;

    async fn build_only(&self, iteration: IterationId, sha: &str) -> RunnerResult<HostOutcome>;

    async fn cleanup_old_kernels(&self, keep: u32);

    async fn verify_protection(&self) -> bool;
}

/// Production agent: a host runner plus the remote channel it shares.
pub struct LiveHostAgent {
    remote: Arc<dyn RemoteExec>,
    runner: HostRunner,
    descriptor: AgentDescriptor,
    /// Local test script to deploy at prepare time: (local path, remote
    /// destination). The runner spec already carries the remote path.
    deploy_script: Option<(PathBuf, String)>,
}

impl LiveHostAgent {
    pub fn new(
        remote: Arc<dyn RemoteExec>,
        runner: HostRunner,
        descriptor: AgentDescriptor,
        deploy_script: Option<(PathBuf, String)>,
    ) -> Self {
        Self {
            remote,
            runner,
            descriptor,
            deploy_script,
        }
    }
}

#[async_trait]
impl HostAgent for LiveHostAgent {
    fn host(&self) -> &HostId {
        self.runner.host()
    }

    fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    async fn probe(&self) -> bool {
        self.remote.is_alive().await
    }

    async fn prepare(&self) -> EngineResult<()> {
        let output = self
            .remote
            .call_op("init_protection", &[], Some(OP_TIMEOUT))
            .await
            .map_err(|err| EngineError::Remote(format!("{}: {err}", self.host())))?;
        if !output.success() {
            return Err(EngineError::Remote(format!(
                "{}: init_protection exited {}: {}",
                self.host(),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        info!(host = %self.host(), "kernel protection initialized");

        if let Some((local, remote_path)) = &self.deploy_script {
            let remote_dir = remote_path
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .unwrap_or(".");
            let mkdir = format!("mkdir -p {}", kbisect_remote::shell_quote(remote_dir));
            self.remote
                .run(&mkdir, Some(OP_TIMEOUT))
                .await
                .map_err(|err| EngineError::Remote(format!("{}: {err}", self.host())))?;
            self.remote
                .copy_file(&local.display().to_string(), remote_path)
                .await
                .map_err(|err| EngineError::Remote(format!("{}: {err}", self.host())))?;
            let chmod = format!("chmod +x {}", kbisect_remote::shell_quote(remote_path));
            self.remote
                .run(&chmod, Some(OP_TIMEOUT))
                .await
                .map_err(|err| EngineError::Remote(format!("{}: {err}", self.host())))?;
            info!(host = %self.host(), script = %remote_path, "test script deployed");
        }
        Ok(())
    }

    async fn collect_metadata(&self, kind: &str) -> Option<serde_json::Value> {
        let output = match self
            .remote
            .call_op("collect_metadata", &[kind], Some(METADATA_TIMEOUT))
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(
                    host = %self.host(),
                    kind, "metadata collection exited {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                return None;
            }
            Err(err) => {
                warn!(host = %self.host(), kind, "metadata collection failed: {err}");
                return None;
            }
        };
        match serde_json::from_str(&output.stdout) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(host = %self.host(), kind, "metadata is not valid JSON: {err}");
                None
            }
        }
    }

    async fn run_iteration(&self, iteration: IterationId, sha: &str) -> RunnerResult<HostOutcome> {
        self.runner.run(iteration, sha).await
    }

    async fn build_only(&self, iteration: IterationId, sha: &str) -> RunnerResult<HostOutcome> {
        self.runner.build_only(iteration, sha).await
    }

    async fn cleanup_old_kernels(&self, keep: u32) {
        let keep_arg = keep.to_string();
        match self
            .remote
            .call_op("cleanup_old_kernels", &[&keep_arg], Some(OP_TIMEOUT))
            .await
        {
            Ok(output) if output.success() => {
                info!(host = %self.host(), keep, "old bisect kernels cleaned up");
            }
            Ok(output) => {
                warn!(
                    host = %self.host(),
                    "cleanup_old_kernels exited {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                );
            }
            Err(err) => warn!(host = %self.host(), "cleanup_old_kernels failed: {err}"),
        }
    }

    async fn verify_protection(&self) -> bool {
        matches!(
            self.remote
                .call_op("verify_protection", &[], Some(OP_TIMEOUT))
                .await,
            Ok(output) if output.success()
        )
    }
}
