use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::prompt;
use super::state::{RunStatus, StoreHandle};
use crate::checkpoint::CheckpointManager;
use crate::compliance::{ComplianceChecker, RemediationStrategy, summarize};
use crate::config::Config;
use crate::errors::{OrchestratorError, PhaseError};
use crate::gates::GateRunner;
use crate::phase::{Phase, PhaseStatus, dependency_order};
use crate::stream::{TokenLedger, TokenStats, describe_tool_use, truncate_str};
use crate::tracker::GitTracker;
use crate::ui::icons::commit_glyph;
use crate::ui::{UiAction, UiSink};
use crate::worker::{
    PidRegistry, SessionLog, SessionObserver, SessionReport, Termination, WorkerSession,
    WorkerSpec,
};

/// How often the UI is polled for actions while a worker runs or the run is paused.
pub const UI_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub const ENV_RUN_ID: &str = "CONDUCTOR_RUN_ID";
pub const ENV_PHASE_ID: &str = "CONDUCTOR_PHASE_ID";
pub const ENV_DB: &str = "CONDUCTOR_DB";

/// Final state of one phase in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub attempts: u32,
    /// Context restarts across all attempts
    pub restarts: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub outcomes: Vec<PhaseOutcome>,
    pub tokens: TokenStats,
}

impl RunSummary {
    pub fn outcome(&self, phase_id: &str) -> Option<&PhaseOutcome> {
        self.outcomes.iter().find(|o| o.phase_id == phase_id)
    }
}

/// What a finished auto-commit point represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitPoint {
    Resolved(PhaseStatus),
    Restart,
}

/// Drives phases through worker sessions, compliance checks and remediation.
///
/// One phase runs at a time. Each phase gets up to `max_retries + 1` attempts,
/// and each attempt up to `max_restarts` context restarts. Remediation
/// attempts never restart.
pub struct PhaseOrchestrator {
    config: Config,
    store: StoreHandle,
    ui: Arc<dyn UiSink>,
    registry: PidRegistry,
    compliance: ComplianceChecker,
    checkpoint: CheckpointManager,
    ledger: TokenLedger,
    run_id: i64,
    paused: bool,
    quit: bool,
}

impl PhaseOrchestrator {
    pub fn new(
        config: Config,
        store: StoreHandle,
        ui: Arc<dyn UiSink>,
        registry: PidRegistry,
    ) -> Self {
        let gates = GateRunner::new(&config.project_dir, config.gate_timeout());
        let compliance = ComplianceChecker::new(
            &config.project_dir,
            gates,
            config.settings.compliance.required_sections.clone(),
        );
        let checkpoint = CheckpointManager::new(&config.project_dir);
        Self {
            config,
            store,
            ui,
            registry,
            compliance,
            checkpoint,
            ledger: TokenLedger::new(),
            run_id: 0,
            paused: false,
            quit: false,
        }
    }

    pub fn token_ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    fn plan_key(&self) -> String {
        self.config.plan_file.display().to_string()
    }

    async fn store<F, R>(&self, f: F) -> Result<R, OrchestratorError>
    where
        F: FnOnce(&dyn super::state::StateStore) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.store.call(f).await.map_err(OrchestratorError::Store)
    }

    /// Run every phase in dependency order.
    ///
    /// With `resume`, phases whose latest execution under this plan completed
    /// are treated as already satisfied.
    pub async fn run(
        &mut self,
        phases: &[Phase],
        resume: bool,
    ) -> Result<RunSummary, OrchestratorError> {
        let ordered = dependency_order(phases)?;
        let plan = self.plan_key();

        let mut completed: HashSet<String> = if resume {
            let plan = plan.clone();
            self.store(move |s| s.completed_phases(&plan)).await?
        } else {
            HashSet::new()
        };

        let run_plan = plan.clone();
        self.run_id = self.store(move |s| s.create_run(&run_plan)).await?;
        info!(run_id = self.run_id, phases = ordered.len(), resume, "run started");

        let mut outcomes = Vec::with_capacity(ordered.len());
        for phase in &ordered {
            if self.quit {
                break;
            }
            if resume && completed.contains(&phase.id) {
                info!(phase = %phase.id, "already completed, skipping");
                self.ui.state_changed(
                    &phase.id,
                    PhaseStatus::Completed,
                    Some("completed in an earlier run"),
                );
                outcomes.push(PhaseOutcome {
                    phase_id: phase.id.clone(),
                    status: PhaseStatus::Completed,
                    attempts: 0,
                    restarts: 0,
                    reason: Some("completed in an earlier run".to_string()),
                });
                continue;
            }

            let outcome = match phase.depends_on.iter().find(|d| !completed.contains(*d)) {
                Some(dependency) => self.block_phase(phase, dependency).await?,
                None => match self.run_phase(phase).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let run_id = self.run_id;
                        if let Err(store_err) = self
                            .store(move |s| s.finish_run(run_id, RunStatus::Failed))
                            .await
                        {
                            warn!(error = %store_err, "failed to mark run failed");
                        }
                        return Err(e);
                    }
                },
            };
            if outcome.status == PhaseStatus::Completed {
                completed.insert(outcome.phase_id.clone());
            }
            outcomes.push(outcome);
        }

        let status = if self.quit {
            RunStatus::Cancelled
        } else if outcomes.len() == ordered.len()
            && outcomes.iter().all(|o| o.status == PhaseStatus::Completed)
        {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let run_id = self.run_id;
        self.store(move |s| s.finish_run(run_id, status)).await?;
        info!(run_id, status = status.as_str(), "run finished");

        Ok(RunSummary {
            run_id,
            status,
            outcomes,
            tokens: self.ledger.run_total().clone(),
        })
    }

    async fn block_phase(
        &mut self,
        phase: &Phase,
        dependency: &str,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let reason = PhaseError::DependencyUnmet {
            phase: phase.id.clone(),
            dependency: dependency.to_string(),
        }
        .to_string();
        warn!(phase = %phase.id, dependency, "dependency not completed, phase blocked");

        let (run_id, id) = (self.run_id, phase.id.clone());
        let exec_id = self
            .store(move |s| s.start_attempt(run_id, &id, 0, None))
            .await?;
        self.resolve(exec_id, &phase.id, PhaseStatus::Blocked, Some(reason.clone()))
            .await?;
        Ok(PhaseOutcome {
            phase_id: phase.id.clone(),
            status: PhaseStatus::Blocked,
            attempts: 0,
            restarts: 0,
            reason: Some(reason),
        })
    }

    /// Persist a state change and tell the UI.
    async fn resolve(
        &self,
        exec_id: i64,
        phase_id: &str,
        status: PhaseStatus,
        reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let stored = reason.clone();
        self.store(move |s| s.transition(exec_id, status, stored.as_deref()))
            .await?;
        self.ui.state_changed(phase_id, status, reason.as_deref());
        Ok(())
    }

    async fn run_phase(&mut self, phase: &Phase) -> Result<PhaseOutcome, OrchestratorError> {
        let retry = &self.config.settings.retry;
        let max_attempts = retry.max_retries + 1;
        let max_restarts = retry.max_restarts;

        self.checkpoint.start_phase(&phase.id);
        let base_prompt = prompt::phase_prompt(
            phase,
            &self.config.project_dir,
            &self.config.settings.worker.progress_command,
            &self.config.settings.compliance.required_sections,
        );
        let mut attempt_prompt = base_prompt.clone();
        let mut last_issue = String::new();
        let mut last_exec_id = None;
        let mut total_restarts = 0;

        let outcome = |status: PhaseStatus, attempts: u32, restarts: u32, reason: Option<String>| {
            PhaseOutcome {
                phase_id: phase.id.clone(),
                status,
                attempts,
                restarts,
                reason,
            }
        };

        for attempt in 1..=max_attempts {
            let pending = self.wait_while_paused().await;

            let log_path = self.config.attempt_log_path(&phase.id, attempt);
            let (run_id, id, stored_path) = (
                self.run_id,
                phase.id.clone(),
                log_path.display().to_string(),
            );
            let exec_id = self
                .store(move |s| s.start_attempt(run_id, &id, attempt, Some(&stored_path)))
                .await?;
            last_exec_id = Some(exec_id);

            if let Some(action) = pending {
                let (status, reason) = self.apply_stop_action(action);
                self.resolve(exec_id, &phase.id, status, Some(reason.clone()))
                    .await?;
                self.checkpoint.finish_phase();
                return Ok(outcome(status, attempt, total_restarts, Some(reason)));
            }

            info!(phase = %phase.id, attempt, max_attempts, "attempt started");
            self.ui.phase_started(phase, attempt, max_attempts);
            self.ui
                .state_changed(&phase.id, PhaseStatus::Running, None);

            let signal_marker = self.store(|s| s.last_signal_id()).await?;
            let restart_enabled = attempt == 1 && max_restarts > 0;
            let mut restarts = 0;
            let mut session_prompt = attempt_prompt.clone();
            let mut log = SessionLog::default();

            let (report, action) = loop {
                let (mut report, action) = match self
                    .run_session(phase, &session_prompt, log_path.clone(), restart_enabled)
                    .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        // Infrastructure failure: close the attempt before aborting the run
                        let reason = PhaseError::WorkerFailure {
                            reason: e.to_string(),
                        }
                        .to_string();
                        if let Err(store_err) = self
                            .resolve(exec_id, &phase.id, PhaseStatus::Failed, Some(reason))
                            .await
                        {
                            warn!(phase = %phase.id, error = %store_err, "failed to record worker failure");
                        }
                        self.checkpoint.finish_phase();
                        return Err(e);
                    }
                };
                log.merge(std::mem::take(&mut report.log));

                let reason = match report.termination {
                    Termination::ContextRestartRequested(reason) if action.is_none() => reason,
                    _ => break (report, action),
                };
                if restarts >= max_restarts {
                    let err = PhaseError::RestartExceeded { restarts };
                    warn!(
                        phase = %phase.id,
                        attempt,
                        error = %err,
                        "verifying what the worker produced"
                    );
                    break (report, action);
                }

                restarts += 1;
                total_restarts += 1;
                info!(phase = %phase.id, attempt, restart = restarts, reason = %reason, "context restart");
                self.auto_commit(phase, CommitPoint::Restart);

                let block = self.checkpoint.prepare_restart();
                let snapshot = self
                    .checkpoint
                    .checkpoint()
                    .and_then(|cp| serde_json::to_string(cp).ok())
                    .unwrap_or_default();
                let reason_str = reason.as_str().to_string();
                self.store(move |s| s.record_restart(exec_id, restarts, &reason_str, &snapshot))
                    .await?;
                self.ui.log(
                    &phase.id,
                    &format!("context restart {}/{} ({})", restarts, max_restarts, reason),
                );
                session_prompt = prompt::with_restart_context(&block, &attempt_prompt);
            };

            if let Some(action) = action {
                let (status, reason) = self.apply_stop_action(action);
                self.resolve(exec_id, &phase.id, status, Some(reason.clone()))
                    .await?;
                self.checkpoint.finish_phase();
                return Ok(outcome(status, attempt, total_restarts, Some(reason)));
            }

            if let Some(failure) = report.failure_reason() {
                let reason = PhaseError::WorkerFailure { reason: failure }.to_string();
                warn!(phase = %phase.id, attempt, reason = %reason, "worker attempt failed");
                self.resolve(exec_id, &phase.id, PhaseStatus::Failed, Some(reason.clone()))
                    .await?;
                self.auto_commit(phase, CommitPoint::Resolved(PhaseStatus::Failed));
                self.checkpoint.finish_phase();
                return Ok(outcome(PhaseStatus::Failed, attempt, total_restarts, Some(reason)));
            }

            self.resolve(exec_id, &phase.id, PhaseStatus::Validating, None)
                .await?;
            let (run_id, id) = (self.run_id, phase.id.clone());
            let signal = self
                .store(move |s| s.latest_signal_after(run_id, &id, signal_marker))
                .await?;
            let verdict = self.compliance.verify(phase, &log, signal.as_ref()).await;
            let gate_results = verdict.gate_results.clone();
            self.store(move |s| s.record_gate_results(exec_id, &gate_results))
                .await?;

            match verdict.strategy {
                RemediationStrategy::Pass | RemediationStrategy::WarnAndAccept => {
                    let reason = if verdict.issues.is_empty() {
                        None
                    } else {
                        for issue in &verdict.issues {
                            warn!(phase = %phase.id, issue = %issue, "accepted with warning");
                        }
                        Some(format!("accepted with warnings: {}", summarize(&verdict.issues)))
                    };
                    self.resolve(exec_id, &phase.id, PhaseStatus::Completed, reason.clone())
                        .await?;
                    self.auto_commit(phase, CommitPoint::Resolved(PhaseStatus::Completed));
                    self.checkpoint.finish_phase();
                    return Ok(outcome(PhaseStatus::Completed, attempt, total_restarts, reason));
                }
                RemediationStrategy::HumanRequired => {
                    let why = signal
                        .and_then(|s| s.reason)
                        .unwrap_or_else(|| summarize(&verdict.issues));
                    let reason = PhaseError::HumanRequired { reason: why }.to_string();
                    self.resolve(
                        exec_id,
                        &phase.id,
                        PhaseStatus::AwaitingHuman,
                        Some(reason.clone()),
                    )
                    .await?;
                    self.auto_commit(phase, CommitPoint::Resolved(PhaseStatus::AwaitingHuman));
                    self.checkpoint.finish_phase();
                    return Ok(outcome(
                        PhaseStatus::AwaitingHuman,
                        attempt,
                        total_restarts,
                        Some(reason),
                    ));
                }
                RemediationStrategy::TargetedFix | RemediationStrategy::FullRetry => {
                    last_issue = summarize(&verdict.issues);
                    let err = PhaseError::ComplianceFailure {
                        issue_count: verdict.issues.len(),
                        summary: last_issue.clone(),
                    };
                    warn!(
                        phase = %phase.id,
                        attempt,
                        strategy = %verdict.strategy,
                        error = %err,
                        "compliance failed"
                    );
                    self.resolve(exec_id, &phase.id, PhaseStatus::Failed, Some(err.to_string()))
                        .await?;
                    attempt_prompt = prompt::remediation_prompt(
                        &base_prompt,
                        attempt + 1,
                        verdict.strategy,
                        &verdict.issues,
                    );
                }
            }
        }

        let reason = PhaseError::RetryExceeded {
            attempts: max_attempts,
            last_issue,
        }
        .to_string();
        warn!(phase = %phase.id, reason = %reason, "phase failed");
        if let Some(exec_id) = last_exec_id {
            self.resolve(exec_id, &phase.id, PhaseStatus::Failed, Some(reason.clone()))
                .await?;
        }
        self.auto_commit(phase, CommitPoint::Resolved(PhaseStatus::Failed));
        self.checkpoint.finish_phase();
        Ok(outcome(
            PhaseStatus::Failed,
            max_attempts,
            total_restarts,
            Some(reason),
        ))
    }

    /// Start one worker session and drive it to completion while polling the UI.
    ///
    /// Returns the user action that stopped the session, if any.
    async fn run_session(
        &mut self,
        phase: &Phase,
        prompt: &str,
        log_path: PathBuf,
        restart_enabled: bool,
    ) -> Result<(SessionReport, Option<UiAction>), OrchestratorError> {
        let worker = &self.config.settings.worker;
        let spec = WorkerSpec {
            program: worker.command.clone(),
            args: self.config.worker_args(),
            workdir: phase.working_dir(&self.config.project_dir),
            env: vec![
                (ENV_RUN_ID.to_string(), self.run_id.to_string()),
                (ENV_PHASE_ID.to_string(), phase.id.clone()),
                (ENV_DB.to_string(), self.config.db_path.display().to_string()),
            ],
            prompt: prompt.to_string(),
            timeout: self.config.worker_timeout(),
            stop_grace: self.config.stop_grace(),
            log_path: Some(log_path),
            progress_command: worker.progress_command.clone(),
            context: self.config.context_estimate(),
            restart_enabled,
        };

        self.ledger.begin_session();
        let mut session = WorkerSession::start(spec, self.registry.clone()).await?;
        debug!(phase = %phase.id, pid = session.pid(), "worker session started");
        let stop = session.stop_handle();

        let ui = self.ui.clone();
        let mut observer = UiObserver {
            ui: ui.as_ref(),
            phase_id: &phase.id,
            ledger: &mut self.ledger,
        };
        let mut stop_action = None;

        let drive = session.drive(&mut observer, Some(&mut self.checkpoint));
        tokio::pin!(drive);
        let mut poll = tokio::time::interval(UI_POLL_INTERVAL);
        let report = loop {
            tokio::select! {
                report = &mut drive => break report?,
                _ = poll.tick() => match ui.poll_action() {
                    action @ (UiAction::Skip | UiAction::Quit) => {
                        if stop_action.is_none() {
                            info!(phase = %phase.id, action = ?action, "stopping worker session");
                            stop_action = Some(action);
                            stop.request_stop();
                        }
                    }
                    UiAction::Pause => {
                        info!("pause requested, takes effect before the next attempt");
                        self.paused = true;
                    }
                    UiAction::Resume => self.paused = false,
                    UiAction::None => {}
                },
            }
        };

        Ok((report, stop_action))
    }

    /// Block while paused. Returns a stop action requested before the attempt began.
    async fn wait_while_paused(&mut self) -> Option<UiAction> {
        loop {
            match self.ui.poll_action() {
                UiAction::Pause => self.paused = true,
                UiAction::Resume => self.paused = false,
                action @ (UiAction::Skip | UiAction::Quit) => return Some(action),
                UiAction::None if self.paused => tokio::time::sleep(UI_POLL_INTERVAL).await,
                UiAction::None => return None,
            }
        }
    }

    fn apply_stop_action(&mut self, action: UiAction) -> (PhaseStatus, String) {
        if action == UiAction::Quit {
            self.quit = true;
            (PhaseStatus::Failed, OrchestratorError::Cancelled.to_string())
        } else {
            (PhaseStatus::Skipped, "skipped by user".to_string())
        }
    }

    /// Commit the working tree when policy allows and tracked files changed.
    fn auto_commit(&self, phase: &Phase, point: CommitPoint) {
        let commit = &self.config.settings.commit;
        let (allowed, status, outcome) = match point {
            CommitPoint::Resolved(PhaseStatus::Completed) => {
                (true, PhaseStatus::Completed, "completed")
            }
            CommitPoint::Resolved(status) => (commit.on_failure, status, status.as_str()),
            CommitPoint::Restart => (commit.on_restart, PhaseStatus::Running, "restart"),
        };
        if !commit.enabled || !allowed {
            return;
        }

        let git = match GitTracker::new(&self.config.project_dir) {
            Ok(git) => git,
            Err(e) => {
                debug!(error = %e, "no git repository, skipping auto-commit");
                return;
            }
        };
        match git.has_tracked_changes() {
            Ok(true) => {}
            Ok(false) => {
                debug!(phase = %phase.id, "no tracked changes, nothing to commit");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not read git status, skipping auto-commit");
                return;
            }
        }

        let message = commit.render(commit_glyph(status), &phase.id, &phase.title, outcome);
        match git.commit_all(&message) {
            Ok(sha) => info!(phase = %phase.id, sha = %truncate_str(&sha, 12), "auto-committed"),
            Err(e) => warn!(phase = %phase.id, error = %e, "auto-commit failed"),
        }
    }
}

/// Forwards session activity to the UI and the token ledger.
struct UiObserver<'a> {
    ui: &'a dyn UiSink,
    phase_id: &'a str,
    ledger: &'a mut TokenLedger,
}

impl SessionObserver for UiObserver<'_> {
    fn on_text(&mut self, text: &str) {
        if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
            self.ui.log(self.phase_id, &truncate_str(line, 200));
        }
    }

    fn on_tool_use(&mut self, name: &str, input: &Value) {
        self.ui.log(self.phase_id, &describe_tool_use(name, input));
    }

    fn on_tool_result(
        &mut self,
        tool_name: Option<&str>,
        content: &str,
        is_error: bool,
        _subagent: Option<&str>,
    ) {
        if is_error {
            self.ui.log(
                self.phase_id,
                &format!(
                    "{} failed: {}",
                    tool_name.unwrap_or("tool"),
                    truncate_str(content.trim(), 160)
                ),
            );
        }
    }

    fn on_token_stats(&mut self, stats: &TokenStats, is_final: bool) {
        if is_final {
            self.ledger.finalize_session(stats.clone());
        } else {
            self.ledger.update_session(stats.clone());
        }
        self.ui
            .token_stats(self.ledger.session(), self.ledger.run_total());
    }

    fn on_subagent_change(&mut self, agent: Option<&str>) {
        match agent {
            Some(agent) => self.ui.log(self.phase_id, &format!("subagent {} active", agent)),
            None => self.ui.log(self.phase_id, "back to main worker"),
        }
    }

    fn on_progress(&mut self, message: &str) {
        self.ui.log(self.phase_id, &format!("progress: {}", message));
    }

    fn on_stderr(&mut self, line: &str) {
        debug!(phase = self.phase_id, stderr = line, "worker stderr");
    }
}
