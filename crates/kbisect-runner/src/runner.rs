use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use kbisect_console::{CaptureHandle, ConsoleChain};
use kbisect_core::{
    verdict_for_phase_failure, BlobId, ErrorKind, HostId, HostOutcome, HostVerdict, IterationId,
    Phase, PhaseFailure, TestMode,
};
use kbisect_power::{PowerController, PowerError};
use kbisect_remote::{ChunkSink, ExecError, OutputStream, RemoteExec};
use kbisect_store::{LogBlobWriter, LogKind, Store};

use crate::monitor::{wait_for_boot, BootResult};
use crate::RunnerResult;

/// Wait after delivering a reboot before the first boot probe; the host
/// needs a moment to actually go down.
const REBOOT_SETTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct RunnerTimeouts {
    pub build: Duration,
    pub boot: Duration,
    pub test: Duration,
}

impl Default for RunnerTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(1800),
            boot: Duration::from_secs(300),
            test: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(30),
        }
    }
}

/// Static per-host inputs for one runner.
#[derive(Debug, Clone)]
pub struct HostRunnerSpec {
    pub host: HostId,
    pub kernel_path: String,
    pub test_mode: TestMode,
    pub test_script: Option<String>,
    pub base_config: Option<String>,
    pub timeouts: RunnerTimeouts,
    pub recovery: RecoveryPolicy,
}

/// Drives one host through one iteration. Owns the host's power controller
/// and console collector for the duration; everything the host can do wrong
/// folds into the returned `HostOutcome`, and only store failures escape.
pub struct HostRunner {
    spec: HostRunnerSpec,
    remote: Arc<dyn RemoteExec>,
    power: Arc<dyn PowerController>,
    console: ConsoleChain,
    store: Arc<Store>,
}

enum BuildPhase {
    Failed(HostOutcome),
    Built {
        expected_kernel: Option<String>,
        build_log: BlobId,
    },
}

/// Streams remote output chunks straight into a log blob.
struct BlobSink<'a> {
    writer: &'a LogBlobWriter,
}

impl ChunkSink for BlobSink<'_> {
    fn chunk(&self, _stream: OutputStream, bytes: &[u8]) {
        if let Err(err) = self.writer.append(bytes) {
            warn!("dropping log chunk: {err}");
        }
    }
}

impl HostRunner {
    pub fn new(
        spec: HostRunnerSpec,
        remote: Arc<dyn RemoteExec>,
        power: Arc<dyn PowerController>,
        console: ConsoleChain,
        store: Arc<Store>,
    ) -> Self {
        Self {
            spec,
            remote,
            power,
            console,
            store,
        }
    }

    pub fn host(&self) -> &HostId {
        &self.spec.host
    }

    /// Run the full BUILD → INSTALL+REBOOT → WAIT_BOOT → TEST machine for
    /// one candidate.
    pub async fn run(&self, iteration: IterationId, sha: &str) -> RunnerResult<HostOutcome> {
        let (expected_kernel, build_log) = match self.build_phase(iteration, sha).await? {
            BuildPhase::Failed(outcome) => return Ok(outcome),
            BuildPhase::Built {
                expected_kernel,
                build_log,
            } => (expected_kernel, build_log),
        };

        // Console capture spans INSTALL+REBOOT through TEST and is stopped
        // on every exit path below.
        let capture = self.console.start().await;
        let mut outcome = self.boot_and_test(iteration, expected_kernel.as_deref()).await?;
        outcome.build_log = Some(build_log);
        outcome.console_log = self.persist_console(iteration, capture).await?;
        Ok(outcome)
    }

    /// BUILD phase only: compile and stash the log, no one-shot boot, no
    /// test. Used by the build-only command.
    pub async fn build_only(&self, iteration: IterationId, sha: &str) -> RunnerResult<HostOutcome> {
        match self.build_phase(iteration, sha).await? {
            BuildPhase::Failed(outcome) => Ok(outcome),
            BuildPhase::Built {
                expected_kernel,
                build_log,
            } => {
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Build, HostVerdict::Pass);
                outcome.observed_kernel = expected_kernel;
                outcome.build_log = Some(build_log);
                Ok(outcome)
            }
        }
    }

    async fn build_phase(&self, iteration: IterationId, sha: &str) -> RunnerResult<BuildPhase> {
        info!(host = %self.spec.host, sha = &sha[..sha.len().min(12)], "building kernel");
        let writer = LogBlobWriter::open(
            Arc::clone(&self.store),
            iteration,
            &self.spec.host,
            LogKind::Build,
        )?;
        let sink = BlobSink { writer: &writer };

        let base_config = self.spec.base_config.as_deref().unwrap_or("");
        let args = [sha, self.spec.kernel_path.as_str(), base_config];
        let result = self
            .remote
            .call_op_streaming("build_kernel", &args, Some(self.spec.timeouts.build), &sink)
            .await;

        match result {
            Ok(streamed) if streamed.success() => {
                let expected_kernel = streamed.last_line().map(str::to_owned);
                if expected_kernel.is_none() {
                    warn!(host = %self.spec.host, "build output carried no kernel version");
                }
                let build_log = writer.finalize(Some(i64::from(streamed.exit_code)))?;
                Ok(BuildPhase::Built {
                    expected_kernel,
                    build_log,
                })
            }
            Ok(streamed) => {
                error!(host = %self.spec.host, exit = streamed.exit_code, "kernel build failed");
                let build_log = writer.finalize(Some(i64::from(streamed.exit_code)))?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Build, HostVerdict::Skip)
                        .with_error(
                            ErrorKind::BuildFailed,
                            format!("build exited {}", streamed.exit_code),
                        );
                outcome.build_log = Some(build_log);
                Ok(BuildPhase::Failed(outcome))
            }
            Err(ExecError::Timeout(limit)) => {
                error!(host = %self.spec.host, "kernel build timed out after {limit:?}");
                let build_log = writer.finalize(None)?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Build, HostVerdict::Skip)
                        .with_error(
                            ErrorKind::BuildFailed,
                            format!("build timed out after {limit:?}"),
                        );
                outcome.build_log = Some(build_log);
                Ok(BuildPhase::Failed(outcome))
            }
            Err(err) => {
                error!(host = %self.spec.host, "build channel lost: {err}");
                let build_log = writer.finalize(None)?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Build, HostVerdict::Skip)
                        .with_error(ErrorKind::RemoteChannelLost, err.to_string());
                outcome.build_log = Some(build_log);
                Ok(BuildPhase::Failed(outcome))
            }
        }
    }

    async fn boot_and_test(
        &self,
        iteration: IterationId,
        expected_kernel: Option<&str>,
    ) -> RunnerResult<HostOutcome> {
        // INSTALL+REBOOT: the build op armed a one-shot boot entry for the
        // new kernel; a power cycle fires it.
        info!(host = %self.spec.host, "rebooting into one-shot kernel");
        if let Err(err) = self.power.cycle().await {
            warn!(host = %self.spec.host, "power cycle failed: {err}");
            match err {
                PowerError::Unreachable(detail) => {
                    return Ok(HostOutcome::new(
                        self.spec.host.clone(),
                        Phase::Install,
                        HostVerdict::Unreachable,
                    )
                    .with_error(ErrorKind::RemoteUnreachable, detail));
                }
                other => {
                    if !self.power.can_recover_unreachable() {
                        return Ok(HostOutcome::new(
                            self.spec.host.clone(),
                            Phase::Install,
                            HostVerdict::Unreachable,
                        )
                        .with_error(ErrorKind::PowerBackendFailure, other.to_string()));
                    }
                    return self.recover(ErrorKind::PowerBackendFailure).await;
                }
            }
        }

        tokio::time::sleep(REBOOT_SETTLE).await;

        // WAIT_BOOT
        match wait_for_boot(self.remote.as_ref(), expected_kernel, self.spec.timeouts.boot).await {
            BootResult::BootedExpected { observed } => self.test_phase(iteration, observed).await,
            BootResult::FellBack { expected, observed } => {
                error!(
                    host = %self.spec.host,
                    expected, observed,
                    "one-shot kernel failed to boot; firmware fell back to the protected kernel"
                );
                let verdict =
                    verdict_for_phase_failure(PhaseFailure::BootFallback, self.spec.test_mode);
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Boot, verdict).with_error(
                        ErrorKind::BootFallback,
                        format!("expected kernel {expected}, host booted {observed}"),
                    );
                outcome.observed_kernel = Some(observed);
                Ok(outcome)
            }
            BootResult::TimedOut => {
                error!(host = %self.spec.host, "boot timed out");
                self.recover(ErrorKind::BootTimeout).await
            }
        }
    }

    /// RECOVER: bring the host back on the protected kernel with hard power
    /// cycles. Reaching the host again proves the one-shot entry was
    /// consumed without booting; the candidate never came up.
    async fn recover(&self, kind: ErrorKind) -> RunnerResult<HostOutcome> {
        if !self.power.can_recover_unreachable() {
            error!(
                host = %self.spec.host,
                "no out-of-band power control; host cannot be recovered automatically"
            );
            return Ok(HostOutcome::new(
                self.spec.host.clone(),
                Phase::Boot,
                HostVerdict::Unreachable,
            )
            .with_error(
                kind,
                "host did not boot and the configured power control cannot recover it",
            ));
        }

        let attempts = self.spec.recovery.attempts;
        for attempt in 1..=attempts {
            warn!(host = %self.spec.host, attempt, attempts, "power-cycle recovery attempt");
            if let Err(err) = self.power.cycle().await {
                warn!(host = %self.spec.host, "recovery power cycle failed: {err}");
            }
            match wait_for_boot(self.remote.as_ref(), None, self.spec.timeouts.boot).await {
                BootResult::BootedExpected { observed } => {
                    info!(
                        host = %self.spec.host,
                        kernel = observed.as_deref().unwrap_or("unknown"),
                        "host recovered on the protected kernel"
                    );
                    let verdict = verdict_for_phase_failure(
                        PhaseFailure::BootTimeoutRecovered,
                        self.spec.test_mode,
                    );
                    let mut outcome =
                        HostOutcome::new(self.spec.host.clone(), Phase::Boot, verdict).with_error(
                            kind,
                            format!("candidate kernel never booted; host recovered after {attempt} power cycle(s)"),
                        );
                    outcome.observed_kernel = observed;
                    return Ok(outcome);
                }
                BootResult::FellBack { .. } | BootResult::TimedOut => {}
            }
            if attempt < attempts {
                tokio::time::sleep(self.spec.recovery.delay).await;
            }
        }

        error!(host = %self.spec.host, "recovery exhausted; host is unreachable");
        Ok(HostOutcome::new(
            self.spec.host.clone(),
            Phase::Boot,
            HostVerdict::Unreachable,
        )
        .with_error(
            kind,
            format!("host did not answer after {attempts} recovery power cycles"),
        ))
    }

    async fn test_phase(
        &self,
        iteration: IterationId,
        observed_kernel: Option<String>,
    ) -> RunnerResult<HostOutcome> {
        info!(host = %self.spec.host, mode = self.spec.test_mode.as_key(), "running test");
        let writer = LogBlobWriter::open(
            Arc::clone(&self.store),
            iteration,
            &self.spec.host,
            LogKind::Test,
        )?;
        let sink = BlobSink { writer: &writer };

        let mut args = vec![self.spec.test_mode.as_key()];
        if let Some(script) = self.spec.test_script.as_deref() {
            args.push(script);
        }
        let result = self
            .remote
            .call_op_streaming("run_test", &args, Some(self.spec.timeouts.test), &sink)
            .await;

        let mut outcome = match result {
            Ok(streamed) if streamed.success() => {
                info!(host = %self.spec.host, "test passed");
                let test_log = writer.finalize(Some(i64::from(streamed.exit_code)))?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Done, HostVerdict::Pass);
                outcome.test_log = Some(test_log);
                outcome
            }
            Ok(streamed) => {
                error!(host = %self.spec.host, exit = streamed.exit_code, "test failed");
                let test_log = writer.finalize(Some(i64::from(streamed.exit_code)))?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Test, HostVerdict::Fail)
                        .with_error(
                            ErrorKind::TestFailed,
                            format!("test exited {}", streamed.exit_code),
                        );
                outcome.test_log = Some(test_log);
                outcome
            }
            Err(ExecError::Timeout(limit)) => {
                warn!(host = %self.spec.host, "test timed out after {limit:?}");
                let test_log = writer.finalize(None)?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Test, HostVerdict::Skip)
                        .with_error(
                            ErrorKind::TestTimeout,
                            format!("test timed out after {limit:?}"),
                        );
                outcome.test_log = Some(test_log);
                outcome
            }
            Err(err) => {
                warn!(host = %self.spec.host, "test channel lost: {err}");
                let test_log = writer.finalize(None)?;
                let mut outcome =
                    HostOutcome::new(self.spec.host.clone(), Phase::Test, HostVerdict::Skip)
                        .with_error(ErrorKind::RemoteChannelLost, err.to_string());
                outcome.test_log = Some(test_log);
                outcome
            }
        };
        outcome.observed_kernel = observed_kernel;
        Ok(outcome)
    }

    async fn persist_console(
        &self,
        iteration: IterationId,
        capture: Option<CaptureHandle>,
    ) -> RunnerResult<Option<BlobId>> {
        let Some(handle) = capture else {
            return Ok(None);
        };
        let captured = handle.stop().await;
        if captured.is_empty() {
            return Ok(None);
        }
        let writer = LogBlobWriter::open(
            Arc::clone(&self.store),
            iteration,
            &self.spec.host,
            LogKind::Console,
        )?;
        writer.append(&captured)?;
        let blob = writer.finalize(None)?;
        Ok(Some(blob))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use kbisect_console::ConsoleChain;
    use kbisect_core::{ErrorKind, HostId, HostVerdict, IterationId, Phase, TestMode};
    use kbisect_power::{PowerControlKind, PowerController, PowerResult, PowerState};
    use kbisect_remote::{
        ChunkSink, ExecError, ExecOutput, ExecResult, OutputStream, RemoteExec, StreamedOutput,
    };
    use kbisect_store::{LogKind, Store};

    use super::{HostRunner, HostRunnerSpec, RecoveryPolicy, RunnerTimeouts};

    const EXPECTED_KERNEL: &str = "6.6.0-rc1-00042-gabc";
    const PROTECTED_KERNEL: &str = "6.1.0-protected";

    #[derive(Clone, Copy)]
    enum BuildPlan {
        Exit(i32),
        Timeout,
    }

    #[derive(Clone, Copy)]
    enum TestPlan {
        Exit(i32),
        Timeout,
        ChannelLost,
    }

    #[derive(Clone)]
    enum UnamePlan {
        /// Answer with the expected kernel.
        ExpectedKernel,
        /// Answer with the protected kernel (one-shot never booted).
        ProtectedKernel,
        /// Dark until the shared power-cycle counter reaches the threshold,
        /// then answer with the protected kernel.
        DarkUntilCycles(u32),
        /// Never answers.
        Dark,
    }

    struct ScriptedRemote {
        host: HostId,
        build: BuildPlan,
        uname: UnamePlan,
        test: TestPlan,
        cycles: Arc<AtomicU32>,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteExec for ScriptedRemote {
        fn host(&self) -> &HostId {
            &self.host
        }

        fn library_file(&self) -> &str {
            "/root/kernel-bisect/lib/bisect-functions.sh"
        }

        async fn run(&self, command: &str, _timeout: Option<Duration>) -> ExecResult<ExecOutput> {
            self.commands
                .lock()
                .expect("lock commands")
                .push(command.to_owned());
            if command != "uname -r" {
                return Ok(ExecOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            let answer = match &self.uname {
                UnamePlan::ExpectedKernel => Some(EXPECTED_KERNEL),
                UnamePlan::ProtectedKernel => Some(PROTECTED_KERNEL),
                UnamePlan::DarkUntilCycles(threshold) => {
                    if self.cycles.load(Ordering::SeqCst) >= *threshold {
                        Some(PROTECTED_KERNEL)
                    } else {
                        None
                    }
                }
                UnamePlan::Dark => None,
            };
            match answer {
                Some(kernel) => Ok(ExecOutput {
                    exit_code: 0,
                    stdout: format!("{kernel}\n"),
                    stderr: String::new(),
                }),
                None => Err(ExecError::ChannelLost("no route to host".to_owned())),
            }
        }

        async fn run_streaming(
            &self,
            command: &str,
            _timeout: Option<Duration>,
            sink: &dyn ChunkSink,
        ) -> ExecResult<StreamedOutput> {
            self.commands
                .lock()
                .expect("lock commands")
                .push(command.to_owned());
            if command.contains("build_kernel") {
                sink.chunk(OutputStream::Stdout, b"  CC      kernel/fork.o\n");
                return match self.build {
                    BuildPlan::Exit(0) => Ok(StreamedOutput {
                        exit_code: 0,
                        stdout_tail: format!("  LD vmlinux\n{EXPECTED_KERNEL}\n"),
                    }),
                    BuildPlan::Exit(code) => Ok(StreamedOutput {
                        exit_code: code,
                        stdout_tail: "error: implicit declaration\n".to_owned(),
                    }),
                    BuildPlan::Timeout => Err(ExecError::Timeout(Duration::from_secs(1800))),
                };
            }
            if command.contains("run_test") {
                sink.chunk(OutputStream::Stdout, b"running test\n");
                return match self.test {
                    TestPlan::Exit(code) => Ok(StreamedOutput {
                        exit_code: code,
                        stdout_tail: "test done\n".to_owned(),
                    }),
                    TestPlan::Timeout => Err(ExecError::Timeout(Duration::from_secs(600))),
                    TestPlan::ChannelLost => {
                        Err(ExecError::ChannelLost("connection reset".to_owned()))
                    }
                };
            }
            unreachable!("unexpected streaming command: {command}");
        }

        async fn copy_file(&self, _local: &str, _remote: &str) -> ExecResult<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FakePower {
        cycles: Arc<AtomicU32>,
        can_recover: bool,
    }

    #[async_trait]
    impl PowerController for FakePower {
        fn kind(&self) -> PowerControlKind {
            PowerControlKind::Ipmi
        }

        async fn status(&self) -> PowerResult<PowerState> {
            Ok(PowerState::On)
        }

        async fn on(&self) -> PowerResult<()> {
            Ok(())
        }

        async fn off(&self) -> PowerResult<()> {
            Ok(())
        }

        async fn reset(&self) -> PowerResult<()> {
            Ok(())
        }

        async fn cycle(&self) -> PowerResult<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn can_recover_unreachable(&self) -> bool {
            self.can_recover
        }
    }

    struct Fixture {
        runner: HostRunner,
        store: Arc<Store>,
        cycles: Arc<AtomicU32>,
        iteration: IterationId,
    }

    fn fixture(
        mode: TestMode,
        build: BuildPlan,
        uname: UnamePlan,
        test: TestPlan,
        can_recover: bool,
    ) -> Fixture {
        let store = Arc::new(Store::in_memory().expect("open store"));
        let (session, _) = store
            .get_or_create_session("good", "bad", "{}")
            .expect("create session");
        let iteration = store
            .create_iteration(session, 1, &"3".repeat(40), "candidate")
            .expect("create iteration");

        let cycles = Arc::new(AtomicU32::new(0));
        let remote = Arc::new(ScriptedRemote {
            host: HostId::new("h1"),
            build,
            uname,
            test,
            cycles: Arc::clone(&cycles),
            commands: Mutex::new(Vec::new()),
        });
        let power = Arc::new(FakePower {
            cycles: Arc::clone(&cycles),
            can_recover,
        });

        let spec = HostRunnerSpec {
            host: HostId::new("h1"),
            kernel_path: "/root/kernel".to_owned(),
            test_mode: mode,
            test_script: match mode {
                TestMode::Boot => None,
                TestMode::Custom => Some("/root/test.sh".to_owned()),
            },
            base_config: None,
            timeouts: RunnerTimeouts::default(),
            recovery: RecoveryPolicy::default(),
        };
        let runner = HostRunner::new(spec, remote, power, ConsoleChain::empty(), Arc::clone(&store));
        Fixture {
            runner,
            store,
            cycles,
            iteration,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn passing_test_yields_pass_with_logs() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Exit(0),
            UnamePlan::ExpectedKernel,
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");

        assert_eq!(outcome.verdict, HostVerdict::Pass);
        assert_eq!(outcome.phase, Phase::Done);
        assert_eq!(outcome.observed_kernel.as_deref(), Some(EXPECTED_KERNEL));
        assert_eq!(fx.cycles.load(Ordering::SeqCst), 1);

        let (build_record, build_content) = fx
            .store
            .log_blob(outcome.build_log.expect("build log stored"))
            .expect("read build log");
        assert_eq!(build_record.kind, LogKind::Build);
        assert_eq!(build_record.exit_code, Some(0));
        assert!(String::from_utf8_lossy(&build_content).contains("CC      kernel/fork.o"));

        let (test_record, _) = fx
            .store
            .log_blob(outcome.test_log.expect("test log stored"))
            .expect("read test log");
        assert_eq!(test_record.kind, LogKind::Test);
    }

    #[tokio::test(start_paused = true)]
    async fn build_failure_skips_without_rebooting() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Exit(2),
            UnamePlan::ExpectedKernel,
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");

        assert_eq!(outcome.verdict, HostVerdict::Skip);
        assert_eq!(outcome.phase, Phase::Build);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BuildFailed));
        assert_eq!(fx.cycles.load(Ordering::SeqCst), 0, "no reboot after build failure");

        // The build log is stored even on failure.
        let (record, _) = fx
            .store
            .log_blob(outcome.build_log.expect("build log stored"))
            .expect("read build log");
        assert_eq!(record.exit_code, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn build_timeout_is_a_build_failure() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Timeout,
            UnamePlan::ExpectedKernel,
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");
        assert_eq!(outcome.verdict, HostVerdict::Skip);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BuildFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_fails_in_boot_mode() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Exit(0),
            UnamePlan::ProtectedKernel,
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");

        assert_eq!(outcome.verdict, HostVerdict::Fail);
        assert_eq!(outcome.phase, Phase::Boot);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BootFallback));
        assert_eq!(outcome.observed_kernel.as_deref(), Some(PROTECTED_KERNEL));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_skips_in_custom_mode() {
        let fx = fixture(
            TestMode::Custom,
            BuildPlan::Exit(0),
            UnamePlan::ProtectedKernel,
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");
        assert_eq!(outcome.verdict, HostVerdict::Skip);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BootFallback));
    }

    #[tokio::test(start_paused = true)]
    async fn boot_timeout_recovered_by_power_cycle_fails_in_boot_mode() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Exit(0),
            UnamePlan::DarkUntilCycles(2),
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");

        assert_eq!(outcome.verdict, HostVerdict::Fail);
        assert_eq!(outcome.phase, Phase::Boot);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BootTimeout));
        assert_eq!(outcome.observed_kernel.as_deref(), Some(PROTECTED_KERNEL));
        // One install cycle plus one recovery cycle.
        assert_eq!(fx.cycles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_recovery_declares_the_host_unreachable() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Exit(0),
            UnamePlan::Dark,
            TestPlan::Exit(0),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");

        assert_eq!(outcome.verdict, HostVerdict::Unreachable);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BootTimeout));
        // One install cycle plus three recovery attempts.
        assert_eq!(fx.cycles.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_timeout_without_recovery_capable_power_is_immediately_unreachable() {
        let fx = fixture(
            TestMode::Boot,
            BuildPlan::Exit(0),
            UnamePlan::Dark,
            TestPlan::Exit(0),
            false,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");

        assert_eq!(outcome.verdict, HostVerdict::Unreachable);
        assert_eq!(fx.cycles.load(Ordering::SeqCst), 1, "no recovery cycles");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_test_fails_the_host() {
        let fx = fixture(
            TestMode::Custom,
            BuildPlan::Exit(0),
            UnamePlan::ExpectedKernel,
            TestPlan::Exit(1),
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");
        assert_eq!(outcome.verdict, HostVerdict::Fail);
        assert_eq!(outcome.phase, Phase::Test);
        assert_eq!(outcome.error_kind, Some(ErrorKind::TestFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_skips_the_host() {
        let fx = fixture(
            TestMode::Custom,
            BuildPlan::Exit(0),
            UnamePlan::ExpectedKernel,
            TestPlan::Timeout,
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");
        assert_eq!(outcome.verdict, HostVerdict::Skip);
        assert_eq!(outcome.error_kind, Some(ErrorKind::TestTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_test_channel_skips_the_host() {
        let fx = fixture(
            TestMode::Custom,
            BuildPlan::Exit(0),
            UnamePlan::ExpectedKernel,
            TestPlan::ChannelLost,
            true,
        );
        let outcome = fx
            .runner
            .run(fx.iteration, &"3".repeat(40))
            .await
            .expect("runner completes");
        assert_eq!(outcome.verdict, HostVerdict::Skip);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RemoteChannelLost));
    }
}
