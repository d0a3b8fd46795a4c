use std::sync::Arc;

use tracing::{error, info, warn};

use kbisect_core::{
    aggregate_outcomes, ErrorKind, HostOutcome, HostVerdict, IterationId, IterationVerdict,
    MarkState, SessionId, SessionStatus, TestMode,
};
use kbisect_store::{NewHost, SessionRecord, Store, StoredHostOutcome};
use kbisect_vcs::BisectDriver;

use crate::agent::HostAgent;
use crate::{EngineError, EngineResult};

/// Hard cap on iterations per session; a correct bisection over any real
/// range converges orders of magnitude sooner.
const ITERATION_LIMIT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub test_mode: TestMode,
    pub config_snapshot: String,
    pub collect_baseline: bool,
    pub collect_per_iteration: bool,
    pub cleanup_keep_kernels: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            test_mode: TestMode::Boot,
            config_snapshot: "{}".to_owned(),
            collect_baseline: true,
            collect_per_iteration: true,
            cleanup_keep_kernels: 0,
        }
    }
}

/// How a coordinator run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The search converged. `first_bad` is `None` when only skipped
    /// candidates remained and the culprit could not be narrowed down.
    Completed { first_bad: Option<String> },
    /// A host was lost and the session halted durably before any mark.
    Halted(HaltReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltReport {
    pub session_id: i64,
    pub iteration_index: u32,
    pub commit_sha: String,
    pub unreachable_hosts: Vec<String>,
    pub power_failures: Vec<String>,
}

impl std::fmt::Display for HaltReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "bisection halted: host(s) unreachable")?;
        writeln!(f, "  session:   {}", self.session_id)?;
        writeln!(
            f,
            "  iteration: {} (commit {})",
            self.iteration_index,
            &self.commit_sha[..self.commit_sha.len().min(12)]
        )?;
        writeln!(
            f,
            "  unreachable hosts: {}",
            self.unreachable_hosts.join(", ")
        )?;
        if !self.power_failures.is_empty() {
            writeln!(
                f,
                "  power backend failures: {}",
                self.power_failures.join(", ")
            )?;
        }
        writeln!(f, "recovery steps:")?;
        writeln!(f, "  1. restore power and network to the hosts above")?;
        writeln!(f, "  2. confirm ssh connectivity (`kbisect check`)")?;
        writeln!(
            f,
            "  3. rerun `kbisect start`; the pending iteration will be \
             classified and marked, then the search continues"
        )?;
        write!(
            f,
            "the commit has NOT been marked in git bisect; no state was lost"
        )
    }
}

/// The top-level control loop. Owns the bisect driver exclusively; shares
/// the store with the host runners it fans out.
pub struct Coordinator {
    store: Arc<Store>,
    driver: Arc<dyn BisectDriver>,
    agents: Vec<Arc<dyn HostAgent>>,
    settings: EngineSettings,
}

impl Coordinator {
    pub fn new(
        store: Arc<Store>,
        driver: Arc<dyn BisectDriver>,
        agents: Vec<Arc<dyn HostAgent>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            driver,
            agents,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn agents(&self) -> &[Arc<dyn HostAgent>] {
        &self.agents
    }

    /// Create (or re-open) the session, start the VCS bisection, prepare the
    /// hosts, and collect baseline metadata. Idempotent: a second `init`
    /// against an open session with the same endpoints is a no-op.
    pub async fn init(&self, good_ref: &str, bad_ref: &str) -> EngineResult<SessionId> {
        let good = self.driver.resolve(good_ref).await?;
        let bad = self.driver.resolve(bad_ref).await?;

        let (session, created) =
            self.store
                .get_or_create_session(&good, &bad, &self.settings.config_snapshot)?;

        if !created {
            let record = self.store.session(session)?;
            if record.good_ref != good || record.bad_ref != bad {
                return Err(EngineError::SessionMismatch(format!(
                    "session {session} bisects {}..{}, requested {good}..{bad}",
                    record.good_ref, record.bad_ref
                )));
            }
            info!(%session, "open session matches requested endpoints; init is a no-op");
            self.driver.start(&good, &bad).await?;
            return Ok(session);
        }

        info!(%session, good = %good, bad = %bad, "session created");
        self.driver.start(&good, &bad).await?;

        for agent in &self.agents {
            let descriptor = agent.descriptor();
            self.store.create_host(
                session,
                NewHost {
                    host: agent.host(),
                    ssh_user: &descriptor.ssh_user,
                    kernel_path: &descriptor.kernel_path,
                    power_control: &descriptor.power_control,
                    test_script: descriptor.test_script.as_deref(),
                },
            )?;
            agent.prepare().await?;
        }

        if self.settings.collect_baseline {
            for agent in &self.agents {
                if let Some(payload) = agent.collect_metadata("baseline").await {
                    self.store.put_metadata(session, None, &payload)?;
                } else {
                    warn!(host = %agent.host(), "baseline metadata unavailable");
                }
            }
        }

        Ok(session)
    }

    /// Enter the bisection loop, resuming a halted or interrupted session
    /// first when one exists.
    pub async fn run(&self) -> EngineResult<RunOutcome> {
        let session = self
            .store
            .latest_open_session()?
            .ok_or(EngineError::NoSession)?;

        match session.status {
            SessionStatus::Halted => {
                if let Some(outcome) = self.resume_halted(&session).await? {
                    return Ok(outcome);
                }
            }
            SessionStatus::Running => self.reconcile_running(&session).await?,
            _ => return Err(EngineError::NoSession),
        }

        self.bisect_loop(session.session_id).await
    }

    /// Resume after a halt: every host must answer again, then the pending
    /// iteration's unreachable outcomes are classified by test mode and the
    /// iteration is closed like any other.
    async fn resume_halted(&self, session: &SessionRecord) -> EngineResult<Option<RunOutcome>> {
        info!(session = %session.session_id, "resuming halted session");

        let mut dark = Vec::new();
        for agent in &self.agents {
            if !agent.probe().await {
                dark.push(agent.host().to_string());
            }
        }
        if !dark.is_empty() {
            return Err(EngineError::HostsUnreachable(dark));
        }

        let session_id = session.session_id;
        self.store
            .update_session_status(session_id, SessionStatus::Running, None)?;

        let Some(iteration) = self.store.latest_iteration(session_id)? else {
            return Ok(None);
        };
        if iteration.verdict != IterationVerdict::Pending {
            return Ok(None);
        }

        let stored = self.store.host_outcomes(iteration.iteration_id)?;
        let mut outcomes = Vec::with_capacity(stored.len());
        for record in stored {
            let mut outcome = stored_to_outcome(record);
            if outcome.verdict == HostVerdict::Unreachable {
                let reclassified = match self.settings.test_mode {
                    TestMode::Boot => HostVerdict::Fail,
                    TestMode::Custom => HostVerdict::Skip,
                };
                info!(
                    host = %outcome.host,
                    from = outcome.verdict.as_key(),
                    to = reclassified.as_key(),
                    "re-classifying unreachable outcome on resume"
                );
                outcome.verdict = reclassified;
                self.store
                    .put_host_outcome(iteration.iteration_id, &outcome)?;
            }
            outcomes.push(outcome);
        }

        let verdict = aggregate_outcomes(&outcomes);
        if verdict == IterationVerdict::Pending {
            // Nothing was recorded for this iteration; drop it and let the
            // loop retake the candidate.
            self.store
                .discard_dangling_iteration(iteration.iteration_id)?;
            return Ok(None);
        }

        let mark = self
            .close_iteration(iteration.iteration_id, verdict, None)
            .await?;
        if mark.done {
            return Ok(Some(self.complete(session_id, mark.first_bad).await?));
        }
        Ok(None)
    }

    /// After a clean interrupt, detect whether the last iteration was fully
    /// closed. The VCS bisect log is authoritative when the two disagree.
    async fn reconcile_running(&self, session: &SessionRecord) -> EngineResult<()> {
        let Some(iteration) = self.store.latest_iteration(session.session_id)? else {
            return Ok(());
        };

        match iteration.mark_state {
            MarkState::Marked => Ok(()),
            MarkState::Marking => {
                let last = self.driver.last_mark().await?;
                let landed = matches!(&last, Some((sha, _)) if *sha == iteration.commit_sha);
                if landed {
                    info!(
                        index = iteration.index,
                        "VCS mark landed before the interrupt; completing the close"
                    );
                } else {
                    warn!(
                        index = iteration.index,
                        verdict = iteration.verdict.as_key(),
                        "re-marking iteration from the stored verdict"
                    );
                    self.driver.mark(iteration.verdict).await?;
                }
                self.store.finish_iteration_close(iteration.iteration_id)?;
                Ok(())
            }
            MarkState::None => {
                match self.driver.last_mark().await? {
                    Some((sha, verdict)) if sha == iteration.commit_sha => {
                        // The VCS is ahead of the store; adopt its verdict.
                        info!(
                            index = iteration.index,
                            verdict = verdict.as_key(),
                            "adopting VCS mark recorded before the interrupt"
                        );
                        self.store.begin_iteration_close(
                            iteration.iteration_id,
                            verdict,
                            Some("verdict adopted from the VCS bisect log on resume"),
                        )?;
                        self.store.finish_iteration_close(iteration.iteration_id)?;
                    }
                    _ => {
                        info!(
                            index = iteration.index,
                            "discarding iteration interrupted before any verdict"
                        );
                        self.store
                            .discard_dangling_iteration(iteration.iteration_id)?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn bisect_loop(&self, session: SessionId) -> EngineResult<RunOutcome> {
        loop {
            let iterations = self.store.iterations(session)?;
            if iterations.len() as u32 >= ITERATION_LIMIT {
                error!("iteration safety limit reached; aborting session");
                self.store
                    .update_session_status(session, SessionStatus::Aborted, None)?;
                return Err(EngineError::IterationLimit(ITERATION_LIMIT));
            }

            let Some(sha) = self.driver.current().await? else {
                let first_bad = self.driver.first_bad().await?;
                return self.complete(session, first_bad).await;
            };

            let index = iterations.last().map(|it| it.index + 1).unwrap_or(1);
            let message = self
                .driver
                .commit_message(&sha)
                .await
                .unwrap_or_else(|_| String::new());
            info!(index, sha = &sha[..sha.len().min(12)], subject = %message, "testing candidate");

            let iteration = self.store.create_iteration(session, index, &sha, &message)?;
            let outcomes = self.fan_out(iteration, &sha).await?;
            for outcome in &outcomes {
                self.store.put_host_outcome(iteration, outcome)?;
            }

            let verdict = aggregate_outcomes(&outcomes);
            info!(index, verdict = verdict.as_key(), "iteration aggregated");

            if verdict == IterationVerdict::Pending {
                let report = self.halt(session, index, &sha, &outcomes)?;
                return Ok(RunOutcome::Halted(report));
            }

            let mark = self.close_iteration(iteration, verdict, None).await?;
            self.post_iteration(session, iteration).await;

            if mark.done {
                return self.complete(session, mark.first_bad).await;
            }
        }
    }

    async fn fan_out(
        &self,
        iteration: IterationId,
        sha: &str,
    ) -> EngineResult<Vec<HostOutcome>> {
        let mut handles = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let agent = Arc::clone(agent);
            let sha = sha.to_owned();
            handles.push(tokio::spawn(async move {
                agent.run_iteration(iteration, &sha).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|err| EngineError::Join(err.to_string()))??;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// The write-ahead close pairing: verdict lands in the store as
    /// `marking`, then the VCS mark, then the store finalizes. A crash
    /// between the halves is reconciled by `reconcile_running`.
    async fn close_iteration(
        &self,
        iteration: IterationId,
        verdict: IterationVerdict,
        error_summary: Option<&str>,
    ) -> EngineResult<kbisect_vcs::MarkOutcome> {
        self.store
            .begin_iteration_close(iteration, verdict, error_summary)?;
        let mark = self.driver.mark(verdict).await?;
        self.store.finish_iteration_close(iteration)?;
        Ok(mark)
    }

    fn halt(
        &self,
        session: SessionId,
        index: u32,
        sha: &str,
        outcomes: &[HostOutcome],
    ) -> EngineResult<HaltReport> {
        self.store
            .update_session_status(session, SessionStatus::Halted, None)?;

        let unreachable_hosts = outcomes
            .iter()
            .filter(|outcome| outcome.verdict == HostVerdict::Unreachable)
            .map(|outcome| outcome.host.to_string())
            .collect::<Vec<_>>();
        let power_failures = outcomes
            .iter()
            .filter(|outcome| outcome.error_kind == Some(ErrorKind::PowerBackendFailure))
            .map(|outcome| outcome.host.to_string())
            .collect::<Vec<_>>();

        error!(
            session = %session,
            hosts = %unreachable_hosts.join(", "),
            "session halted pending manual host recovery"
        );
        Ok(HaltReport {
            session_id: session.value(),
            iteration_index: index,
            commit_sha: sha.to_owned(),
            unreachable_hosts,
            power_failures,
        })
    }

    async fn post_iteration(&self, session: SessionId, iteration: IterationId) {
        if self.settings.collect_per_iteration {
            for agent in &self.agents {
                if let Some(payload) = agent.collect_metadata("iteration").await {
                    if let Err(err) = self.store.put_metadata(session, Some(iteration), &payload) {
                        warn!(host = %agent.host(), "failed to store iteration metadata: {err}");
                    }
                }
            }
        }
        if self.settings.cleanup_keep_kernels > 0 {
            for agent in &self.agents {
                agent
                    .cleanup_old_kernels(self.settings.cleanup_keep_kernels)
                    .await;
            }
        }
    }

    async fn complete(
        &self,
        session: SessionId,
        first_bad: Option<String>,
    ) -> EngineResult<RunOutcome> {
        self.store.update_session_status(
            session,
            SessionStatus::Completed,
            first_bad.as_deref(),
        )?;
        match &first_bad {
            Some(sha) => info!(first_bad = %sha, "bisection completed"),
            None => info!("bisection completed inconclusively (only skipped candidates remained)"),
        }
        Ok(RunOutcome::Completed { first_bad })
    }

    /// Build-only mode: run the BUILD phase on every host for one ref,
    /// storing logs under a throwaway terminal session. No boot, no test,
    /// no mark.
    pub async fn build_only(&self, reference: &str) -> EngineResult<Vec<HostOutcome>> {
        if self.store.latest_open_session()?.is_some() {
            return Err(EngineError::Config(
                "an open bisection session exists; finish or abort it before build-only".to_owned(),
            ));
        }

        let sha = self.driver.resolve(reference).await?;
        let message = self
            .driver
            .commit_message(&sha)
            .await
            .unwrap_or_else(|_| String::new());
        let session = self
            .store
            .create_session(&sha, &sha, &self.settings.config_snapshot)?;
        let iteration = self.store.create_iteration(session, 1, &sha, &message)?;

        let mut handles = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let agent = Arc::clone(agent);
            let sha = sha.clone();
            handles.push(tokio::spawn(async move {
                agent.build_only(iteration, &sha).await
            }));
        }
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|err| EngineError::Join(err.to_string()))??;
            self.store.put_host_outcome(iteration, &outcome)?;
            outcomes.push(outcome);
        }

        self.store
            .update_session_status(session, SessionStatus::Aborted, None)?;
        Ok(outcomes)
    }
}

fn stored_to_outcome(record: StoredHostOutcome) -> HostOutcome {
    HostOutcome {
        host: record.host,
        phase: record.phase,
        verdict: record.verdict,
        observed_kernel: record.observed_kernel,
        error_kind: record.error_kind,
        error: record.error,
        build_log: record.build_log,
        console_log: record.console_log,
        test_log: record.test_log,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use kbisect_core::{
        HostId, HostOutcome, HostVerdict, IterationId, IterationVerdict, Phase, SessionStatus,
        TestMode,
    };
    use kbisect_runner::RunnerResult;
    use kbisect_store::Store;
    use kbisect_vcs::{BisectDriver, MarkOutcome, VcsResult};

    use super::{Coordinator, EngineSettings, RunOutcome};
    use crate::agent::{AgentDescriptor, HostAgent};
    use crate::EngineError;

    fn sha_for(index: usize) -> String {
        format!("{:040x}", index + 1)
    }

    /// In-memory model of git bisect over a linear history:
    /// commit 0 is the known good endpoint, commit n-1 the known bad one.
    struct MockDriver {
        state: Mutex<DriverState>,
    }

    struct DriverState {
        commits: Vec<String>,
        good: usize,
        bad: usize,
        skipped: BTreeSet<usize>,
        current: Option<usize>,
        done: bool,
        first_bad: Option<String>,
        marks: Vec<(String, IterationVerdict)>,
    }

    impl MockDriver {
        fn new(range: usize) -> Arc<Self> {
            let commits = (0..range).map(sha_for).collect::<Vec<_>>();
            Arc::new(Self {
                state: Mutex::new(DriverState {
                    good: 0,
                    bad: range - 1,
                    commits,
                    skipped: BTreeSet::new(),
                    current: None,
                    done: false,
                    first_bad: None,
                    marks: Vec::new(),
                }),
            })
        }

        fn marks(&self) -> Vec<(String, IterationVerdict)> {
            self.state.lock().expect("lock driver").marks.clone()
        }

        fn index_of(&self, sha: &str) -> usize {
            self.state
                .lock()
                .expect("lock driver")
                .commits
                .iter()
                .position(|commit| commit == sha)
                .expect("known sha")
        }
    }

    impl DriverState {
        fn candidates(&self) -> Vec<usize> {
            ((self.good + 1)..self.bad)
                .filter(|index| !self.skipped.contains(index))
                .collect()
        }

        fn converge_if_exhausted(&mut self) {
            if self.done || !self.candidates().is_empty() {
                return;
            }
            self.done = true;
            self.first_bad = if self.bad == self.good + 1 {
                Some(self.commits[self.bad].clone())
            } else {
                // Skipped commits block the boundary; the culprit cannot be
                // narrowed to one commit.
                None
            };
        }

        fn pick(&mut self) -> Option<usize> {
            let candidates = self.candidates();
            if candidates.is_empty() {
                self.converge_if_exhausted();
                return None;
            }
            let midpoint = (self.good + self.bad) / 2;
            let pick = candidates
                .iter()
                .min_by_key(|index| index.abs_diff(midpoint))
                .copied();
            self.current = pick;
            pick
        }
    }

    #[async_trait]
    impl BisectDriver for MockDriver {
        async fn resolve(&self, reference: &str) -> VcsResult<String> {
            let state = self.state.lock().expect("lock driver");
            Ok(match reference {
                "good" => state.commits[0].clone(),
                "bad" => state.commits[state.commits.len() - 1].clone(),
                sha => sha.to_owned(),
            })
        }

        async fn start(&self, _good_ref: &str, _bad_ref: &str) -> VcsResult<()> {
            Ok(())
        }

        async fn current(&self) -> VcsResult<Option<String>> {
            let mut state = self.state.lock().expect("lock driver");
            if state.done {
                return Ok(None);
            }
            Ok(state.pick().map(|index| state.commits[index].clone()))
        }

        async fn mark(&self, verdict: IterationVerdict) -> VcsResult<MarkOutcome> {
            let mut state = self.state.lock().expect("lock driver");
            let index = match state.current.take() {
                Some(index) => index,
                None => {
                    // A re-mark after an interrupt applies to the candidate
                    // the search would pick next.
                    match state.pick() {
                        Some(index) => index,
                        None => {
                            return Ok(MarkOutcome {
                                done: true,
                                first_bad: state.first_bad.clone(),
                            })
                        }
                    }
                }
            };
            state.current = None;
            let sha = state.commits[index].clone();
            state.marks.push((sha, verdict));
            match verdict {
                IterationVerdict::Good => state.good = state.good.max(index),
                IterationVerdict::Bad => state.bad = state.bad.min(index),
                IterationVerdict::Skip => {
                    state.skipped.insert(index);
                }
                IterationVerdict::Pending => unreachable!("pending is never marked"),
            }
            state.converge_if_exhausted();
            Ok(MarkOutcome {
                done: state.done,
                first_bad: state.first_bad.clone(),
            })
        }

        async fn last_mark(&self) -> VcsResult<Option<(String, IterationVerdict)>> {
            Ok(self.state.lock().expect("lock driver").marks.last().cloned())
        }

        async fn first_bad(&self) -> VcsResult<Option<String>> {
            Ok(self.state.lock().expect("lock driver").first_bad.clone())
        }

        async fn reset(&self) -> VcsResult<()> {
            Ok(())
        }

        async fn commit_message(&self, sha: &str) -> VcsResult<String> {
            Ok(format!("subject for {}", &sha[..8]))
        }
    }

    type VerdictFn = Box<dyn Fn(&str) -> HostVerdict + Send + Sync>;

    struct MockAgent {
        host: HostId,
        verdict: VerdictFn,
        alive: Arc<AtomicBool>,
        runs: Mutex<Vec<String>>,
    }

    impl MockAgent {
        fn new(host: &str, verdict: VerdictFn) -> Arc<Self> {
            Arc::new(Self {
                host: HostId::new(host),
                verdict,
                alive: Arc::new(AtomicBool::new(true)),
                runs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HostAgent for MockAgent {
        fn host(&self) -> &HostId {
            &self.host
        }

        fn descriptor(&self) -> AgentDescriptor {
            AgentDescriptor {
                ssh_user: "root".to_owned(),
                kernel_path: "/root/kernel".to_owned(),
                power_control: "power.ipmi".to_owned(),
                test_script: None,
            }
        }

        async fn probe(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn prepare(&self) -> crate::EngineResult<()> {
            Ok(())
        }

        async fn collect_metadata(&self, kind: &str) -> Option<serde_json::Value> {
            Some(serde_json::json!({"host": self.host.as_str(), "kind": kind}))
        }

        async fn run_iteration(
            &self,
            _iteration: IterationId,
            sha: &str,
        ) -> RunnerResult<HostOutcome> {
            self.runs.lock().expect("lock runs").push(sha.to_owned());
            let verdict = (self.verdict)(sha);
            let phase = match verdict {
                HostVerdict::Pass => Phase::Done,
                HostVerdict::Fail => Phase::Test,
                HostVerdict::Skip => Phase::Build,
                HostVerdict::Unreachable => Phase::Boot,
            };
            Ok(HostOutcome::new(self.host.clone(), phase, verdict))
        }

        async fn build_only(
            &self,
            _iteration: IterationId,
            _sha: &str,
        ) -> RunnerResult<HostOutcome> {
            Ok(HostOutcome::new(
                self.host.clone(),
                Phase::Build,
                HostVerdict::Pass,
            ))
        }

        async fn cleanup_old_kernels(&self, _keep: u32) {}

        async fn verify_protection(&self) -> bool {
            true
        }
    }

    fn settings(mode: TestMode) -> EngineSettings {
        EngineSettings {
            test_mode: mode,
            ..EngineSettings::default()
        }
    }

    fn coordinator(
        driver: Arc<MockDriver>,
        agents: Vec<Arc<MockAgent>>,
        mode: TestMode,
    ) -> Coordinator {
        let store = Arc::new(Store::in_memory().expect("open store"));
        let agents = agents
            .into_iter()
            .map(|agent| agent as Arc<dyn HostAgent>)
            .collect();
        Coordinator::new(store, driver, agents, settings(mode))
    }

    /// Hosts fail every candidate at or past the regression point.
    fn failing_from(driver: Arc<MockDriver>, regression: usize) -> VerdictFn {
        Box::new(move |sha| {
            if driver.index_of(sha) >= regression {
                HostVerdict::Fail
            } else {
                HostVerdict::Pass
            }
        })
    }

    #[tokio::test]
    async fn single_host_boot_regression_converges_within_log2() {
        let driver = MockDriver::new(128);
        let agent = MockAgent::new("h1", failing_from(Arc::clone(&driver), 100));
        let coordinator = coordinator(Arc::clone(&driver), vec![Arc::clone(&agent)], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let outcome = coordinator.run().await.expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                first_bad: Some(sha_for(100))
            }
        );

        let session = coordinator
            .store()
            .latest_session()
            .expect("query session")
            .expect("session exists");
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.result_commit.as_deref(), Some(sha_for(100).as_str()));

        let iterations = coordinator
            .store()
            .iterations(session.session_id)
            .expect("list iterations");
        assert!(
            iterations.len() <= 8,
            "128-commit range should converge in <= 8 iterations, took {}",
            iterations.len()
        );
        for (position, iteration) in iterations.iter().enumerate() {
            assert_eq!(iteration.index, position as u32 + 1);
            assert_ne!(iteration.verdict, IterationVerdict::Pending);
            let outcomes = coordinator
                .store()
                .host_outcomes(iteration.iteration_id)
                .expect("outcomes");
            assert_eq!(outcomes.len(), 1, "exactly one outcome per host");
        }
        // Every closed iteration has a matching VCS mark.
        assert_eq!(driver.marks().len(), iterations.len());
    }

    #[tokio::test]
    async fn two_hosts_asymmetric_failure_pins_the_regression() {
        let driver = MockDriver::new(64);
        let srv = MockAgent::new("srv", Box::new(|_| HostVerdict::Pass));
        let cli = MockAgent::new("cli", failing_from(Arc::clone(&driver), 40));
        let coordinator = coordinator(Arc::clone(&driver), vec![srv, cli], TestMode::Custom);

        coordinator.init("good", "bad").await.expect("init");
        let outcome = coordinator.run().await.expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                first_bad: Some(sha_for(40))
            }
        );
        // Any candidate >= 40 aggregated bad (cli), any < 40 good.
        for (sha, verdict) in driver.marks() {
            let index = driver.index_of(&sha);
            let expected = if index >= 40 {
                IterationVerdict::Bad
            } else {
                IterationVerdict::Good
            };
            assert_eq!(verdict, expected, "candidate {index}");
        }
    }

    #[tokio::test]
    async fn build_failure_skips_and_the_search_routes_around_it() {
        let driver = MockDriver::new(16);
        let broken_build = sha_for(7);
        let driver_for_agent = Arc::clone(&driver);
        let agent = MockAgent::new(
            "h1",
            Box::new(move |sha| {
                if sha == broken_build {
                    HostVerdict::Skip
                } else if driver_for_agent.index_of(sha) >= 12 {
                    HostVerdict::Fail
                } else {
                    HostVerdict::Pass
                }
            }),
        );
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let outcome = coordinator.run().await.expect("run");
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                first_bad: Some(sha_for(12))
            }
        );

        let marks = driver.marks();
        assert!(marks
            .iter()
            .any(|(sha, verdict)| *sha == sha_for(7) && *verdict == IterationVerdict::Skip));

        let session = coordinator
            .store()
            .latest_session()
            .expect("query")
            .expect("session");
        let skipped = coordinator
            .store()
            .iterations(session.session_id)
            .expect("iterations")
            .into_iter()
            .find(|iteration| iteration.commit_sha == sha_for(7))
            .expect("skip iteration recorded");
        assert_eq!(skipped.verdict, IterationVerdict::Skip);
    }

    #[tokio::test]
    async fn unreachable_host_halts_without_marking_then_resume_marks_bad() {
        let driver = MockDriver::new(8);
        let wedged = Arc::new(AtomicBool::new(true));
        let wedged_for_agent = Arc::clone(&wedged);
        let agent = MockAgent::new(
            "h1",
            Box::new(move |_| {
                if wedged_for_agent.load(Ordering::SeqCst) {
                    HostVerdict::Unreachable
                } else {
                    HostVerdict::Pass
                }
            }),
        );
        agent.alive.store(false, Ordering::SeqCst);
        let coordinator = coordinator(Arc::clone(&driver), vec![Arc::clone(&agent)], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let outcome = coordinator.run().await.expect("run halts");

        let RunOutcome::Halted(report) = outcome else {
            panic!("expected halt, got {outcome:?}");
        };
        let halted_sha = report.commit_sha.clone();
        assert_eq!(report.unreachable_hosts, vec!["h1".to_owned()]);
        assert!(driver.marks().is_empty(), "no mark for the pending commit");

        let session = coordinator
            .store()
            .latest_open_session()
            .expect("query")
            .expect("session still open");
        assert_eq!(session.status, SessionStatus::Halted);
        let pending = coordinator
            .store()
            .latest_iteration(session.session_id)
            .expect("latest iteration")
            .expect("iteration exists");
        assert_eq!(pending.verdict, IterationVerdict::Pending);

        // Resume while the host is still dark is refused.
        let refused = coordinator.run().await.expect_err("resume refused");
        assert!(matches!(refused, EngineError::HostsUnreachable(_)));

        // Operator restores the host.
        agent.alive.store(true, Ordering::SeqCst);
        wedged.store(false, Ordering::SeqCst);

        let outcome = coordinator.run().await.expect("resume completes");
        // Boot mode: the unreachable candidate is re-classified bad and, with
        // every earlier candidate passing, becomes the first bad commit.
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                first_bad: Some(halted_sha.clone())
            }
        );
        let bad_marks = driver
            .marks()
            .into_iter()
            .filter(|(sha, verdict)| *sha == halted_sha && *verdict == IterationVerdict::Bad)
            .count();
        assert_eq!(bad_marks, 1, "exactly one mark for the recovered commit");
    }

    #[tokio::test]
    async fn unreachable_resume_in_custom_mode_marks_skip() {
        let driver = MockDriver::new(8);
        let wedged = Arc::new(AtomicBool::new(true));
        let wedged_for_agent = Arc::clone(&wedged);
        let agent = MockAgent::new(
            "h1",
            Box::new(move |_| {
                if wedged_for_agent.load(Ordering::SeqCst) {
                    HostVerdict::Unreachable
                } else {
                    HostVerdict::Pass
                }
            }),
        );
        let coordinator =
            coordinator(Arc::clone(&driver), vec![Arc::clone(&agent)], TestMode::Custom);

        coordinator.init("good", "bad").await.expect("init");
        let RunOutcome::Halted(report) = coordinator.run().await.expect("halt") else {
            panic!("expected halt");
        };

        wedged.store(false, Ordering::SeqCst);
        let outcome = coordinator.run().await.expect("resume completes");
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert!(driver
            .marks()
            .iter()
            .any(|(sha, verdict)| *sha == report.commit_sha
                && *verdict == IterationVerdict::Skip));
    }

    #[tokio::test]
    async fn crash_between_store_verdict_and_vcs_mark_is_re_marked_once() {
        let driver = MockDriver::new(16);
        let agent = MockAgent::new("h1", failing_from(Arc::clone(&driver), 9));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");

        // Simulate the first loop turn dying between begin_close and mark:
        // the iteration exists with verdict recorded and mark_state=marking,
        // but nothing reached the VCS.
        let session = coordinator
            .store()
            .latest_open_session()
            .expect("query")
            .expect("session");
        let sha = driver.current().await.expect("current").expect("candidate");
        let iteration = coordinator
            .store()
            .create_iteration(session.session_id, 1, &sha, "interrupted")
            .expect("create iteration");
        let verdict = if driver.index_of(&sha) >= 9 {
            IterationVerdict::Bad
        } else {
            IterationVerdict::Good
        };
        coordinator
            .store()
            .begin_iteration_close(iteration, verdict, None)
            .expect("begin close");

        let outcome = coordinator.run().await.expect("resume completes");
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                first_bad: Some(sha_for(9))
            }
        );
        // The interrupted candidate carries exactly one mark.
        let marks_for_sha = driver
            .marks()
            .into_iter()
            .filter(|(marked, _)| *marked == sha)
            .count();
        assert_eq!(marks_for_sha, 1);
        let record = coordinator
            .store()
            .iteration(iteration)
            .expect("read iteration");
        assert_eq!(record.mark_state, kbisect_core::MarkState::Marked);
    }

    #[tokio::test]
    async fn crash_after_mark_before_store_finalize_adopts_the_vcs_mark() {
        let driver = MockDriver::new(16);
        let agent = MockAgent::new("h1", failing_from(Arc::clone(&driver), 9));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let session = coordinator
            .store()
            .latest_open_session()
            .expect("query")
            .expect("session");

        // Crash window: VCS mark landed, store close never began.
        let sha = driver.current().await.expect("current").expect("candidate");
        let iteration = coordinator
            .store()
            .create_iteration(session.session_id, 1, &sha, "interrupted")
            .expect("create iteration");
        driver.mark(IterationVerdict::Good).await.expect("mark");

        let outcome = coordinator.run().await.expect("resume completes");
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        // The store adopted the VCS verdict instead of double-marking.
        let record = coordinator
            .store()
            .iteration(iteration)
            .expect("read iteration");
        assert_eq!(record.verdict, IterationVerdict::Good);
        assert_eq!(record.mark_state, kbisect_core::MarkState::Marked);
        let marks_for_sha = driver
            .marks()
            .into_iter()
            .filter(|(marked, _)| *marked == sha)
            .count();
        assert_eq!(marks_for_sha, 1);
    }

    #[tokio::test]
    async fn dangling_iteration_without_any_progress_is_discarded() {
        let driver = MockDriver::new(8);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let session = coordinator
            .store()
            .latest_open_session()
            .expect("query")
            .expect("session");
        let sha = driver.current().await.expect("current").expect("candidate");
        coordinator
            .store()
            .create_iteration(session.session_id, 1, &sha, "interrupted before any progress")
            .expect("create iteration");

        let outcome = coordinator.run().await.expect("run completes");
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        // Indexes stay dense from 1 with no gap for the discarded row.
        let iterations = coordinator
            .store()
            .iterations(session.session_id)
            .expect("iterations");
        for (position, iteration) in iterations.iter().enumerate() {
            assert_eq!(iteration.index, position as u32 + 1);
        }
    }

    #[tokio::test]
    async fn trivial_range_terminates_without_iterations() {
        // good and bad are adjacent: nothing to test.
        let driver = MockDriver::new(2);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let outcome = coordinator.run().await.expect("run");
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                first_bad: Some(sha_for(1))
            }
        );
        let session = coordinator
            .store()
            .latest_session()
            .expect("query")
            .expect("session");
        assert!(coordinator
            .store()
            .iterations(session.session_id)
            .expect("iterations")
            .is_empty());
    }

    #[tokio::test]
    async fn all_skip_range_completes_inconclusively_without_looping() {
        let driver = MockDriver::new(6);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Skip));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let outcome = coordinator.run().await.expect("run");
        assert_eq!(outcome, RunOutcome::Completed { first_bad: None });

        let session = coordinator
            .store()
            .latest_session()
            .expect("query")
            .expect("session");
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.result_commit, None);
        // Four candidates between the endpoints, each tried exactly once.
        assert_eq!(
            coordinator
                .store()
                .iterations(session.session_id)
                .expect("iterations")
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn init_twice_reuses_the_session() {
        let driver = MockDriver::new(8);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        let first = coordinator.init("good", "bad").await.expect("first init");
        let second = coordinator.init("good", "bad").await.expect("second init");
        assert_eq!(first, second);

        let sessions = coordinator
            .store()
            .latest_session()
            .expect("query")
            .expect("session");
        assert_eq!(sessions.session_id, first);
    }

    #[tokio::test]
    async fn init_with_conflicting_endpoints_is_rejected() {
        let driver = MockDriver::new(8);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        coordinator.init("good", "bad").await.expect("init");
        let error = coordinator
            .init(&sha_for(2), "bad")
            .await
            .expect_err("conflicting endpoints");
        assert!(matches!(error, EngineError::SessionMismatch(_)));
    }

    #[tokio::test]
    async fn baseline_metadata_is_collected_and_deduplicated() {
        let driver = MockDriver::new(4);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        let session = coordinator.init("good", "bad").await.expect("init");
        let baseline = coordinator
            .store()
            .baseline_metadata(session)
            .expect("query baseline")
            .expect("baseline present");
        assert!(baseline.payload.contains("baseline"));
    }

    #[tokio::test]
    async fn build_only_stores_outcomes_under_a_terminal_session() {
        let driver = MockDriver::new(8);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(Arc::clone(&driver), vec![agent], TestMode::Boot);

        let outcomes = coordinator.build_only(&sha_for(3)).await.expect("build only");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].verdict, HostVerdict::Pass);
        assert_eq!(outcomes[0].phase, Phase::Build);

        // The scratch session is terminal and does not block a real init.
        assert!(coordinator
            .store()
            .latest_open_session()
            .expect("query")
            .is_none());
        assert!(driver.marks().is_empty());
    }

    #[tokio::test]
    async fn run_without_a_session_is_an_error() {
        let driver = MockDriver::new(8);
        let agent = MockAgent::new("h1", Box::new(|_| HostVerdict::Pass));
        let coordinator = coordinator(driver, vec![agent], TestMode::Boot);
        assert!(matches!(
            coordinator.run().await,
            Err(EngineError::NoSession)
        ));
    }

    #[test]
    fn halt_report_names_the_recovery_steps() {
        let report = super::HaltReport {
            session_id: 3,
            iteration_index: 5,
            commit_sha: sha_for(9),
            unreachable_hosts: vec!["h1".to_owned()],
            power_failures: vec![],
        };
        let rendered = report.to_string();
        assert!(rendered.contains("session:   3"));
        assert!(rendered.contains("iteration: 5"));
        assert!(rendered.contains("h1"));
        assert!(rendered.contains("kbisect start"));
        assert!(rendered.contains("NOT been marked"));
    }
}
