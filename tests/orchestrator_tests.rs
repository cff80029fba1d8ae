//! End-to-end orchestrator scenarios driven by fake `sh` workers.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conductor::config::{Config, ConductorToml};
use conductor::orchestrator::{
    PhaseOrchestrator, RunStatus, RunSummary, SqliteStore, StateStore, StoreHandle,
};
use conductor::phase::{Gate, Phase, PhaseStatus};
use conductor::stream::TokenStats;
use conductor::ui::{NullSink, UiAction, UiSink};
use conductor::worker::PidRegistry;
use tempfile::TempDir;

const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"s1","model":"test"}"#;
const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","usage":{"input_tokens":10,"output_tokens":5},"total_cost_usd":0.01}"#;
const TOOL_USE: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;

/// A worker that reads its prompt, emits an init and a result event, and exits.
fn finishing_worker() -> String {
    format!(
        "cat > /dev/null\necho run >> runs.log\necho '{}'\necho '{}'\n",
        INIT, RESULT
    )
}

fn settings_for(script: &str) -> ConductorToml {
    let mut settings = ConductorToml::default();
    settings.worker.command = "sh".to_string();
    settings.worker.args = vec!["-c".to_string(), script.to_string(), "worker".to_string()];
    settings.worker.timeout_secs = 60;
    settings.worker.stop_grace_secs = 1;
    settings.commit.enabled = false;
    settings.compliance.gate_timeout_secs = 30;
    settings
}

fn project(settings: ConductorToml) -> (TempDir, Config) {
    let dir = TempDir::new().unwrap();
    let config = Config::with_settings(dir.path().to_path_buf(), settings, false);
    config.ensure_directories().unwrap();
    (dir, config)
}

fn in_memory_store() -> StoreHandle {
    StoreHandle::new(SqliteStore::open_in_memory().unwrap())
}

async fn run_plan(
    config: Config,
    store: StoreHandle,
    ui: Arc<dyn UiSink>,
    phases: &[Phase],
) -> RunSummary {
    let registry = PidRegistry::new();
    let mut orchestrator = PhaseOrchestrator::new(config, store, ui, registry.clone());
    let summary = orchestrator.run(phases, false).await.unwrap();
    assert!(registry.is_empty(), "worker pids left registered");
    summary
}

fn worker_runs(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("runs.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn gate_failing_twice_completes_on_third_attempt() {
    let mut settings = settings_for(&finishing_worker());
    settings.retry.max_retries = 2;
    let (dir, config) = project(settings);
    let store = in_memory_store();

    let counter_gate = "n=$(cat .gate-count 2>/dev/null || echo 0); n=$((n+1)); echo $n > .gate-count; test $n -ge 3";
    let phases = vec![
        Phase::new("01", "Schema", vec![])
            .with_gates(vec![Gate::new("counter", counter_gate, true)]),
        Phase::new("02", "Api", vec!["01".into()]),
    ];

    let summary = run_plan(config, store.clone(), Arc::new(NullSink), &phases).await;

    assert_eq!(summary.status, RunStatus::Completed);
    let first = summary.outcome("01").unwrap();
    assert_eq!(first.status, PhaseStatus::Completed);
    assert_eq!(first.attempts, 3);
    assert_eq!(summary.outcome("02").unwrap().status, PhaseStatus::Completed);
    assert_eq!(worker_runs(dir.path()), 4);

    let guard = store.lock_sync().unwrap();
    let history = guard.phase_history("01").unwrap();
    assert_eq!(history.len(), 3);
    let statuses: Vec<PhaseStatus> = history.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![PhaseStatus::Failed, PhaseStatus::Failed, PhaseStatus::Completed]
    );
    for failed in &history[..2] {
        let error = failed.error.as_deref().unwrap();
        assert!(error.contains("Compliance failed"), "{}", error);
        assert!(error.contains("gates-failed"), "{}", error);
        assert!(!guard.gate_results(failed.id).unwrap()[0].passed);
    }
    assert!(guard.gate_results(history[2].id).unwrap()[0].passed);

    let second = guard.phase_history("02").unwrap();
    assert_eq!(second.len(), 1);
    assert!(second[0].id > history[2].id, "phase 02 started before 01 completed");
    assert!(summary.tokens.cost_usd > 0.039);
}

#[tokio::test]
async fn exhausted_retries_fail_phase_and_block_dependents() {
    let mut settings = settings_for(&finishing_worker());
    settings.retry.max_retries = 1;
    let (dir, config) = project(settings);
    let store = in_memory_store();

    let phases = vec![
        Phase::new("01", "Broken", vec![]).with_gates(vec![Gate::new("never", "exit 1", true)]),
        Phase::new("02", "Dependent", vec!["01".into()]),
        Phase::new("03", "Independent", vec![]),
    ];

    let summary = run_plan(config, store.clone(), Arc::new(NullSink), &phases).await;

    assert_eq!(summary.status, RunStatus::Failed);
    let broken = summary.outcome("01").unwrap();
    assert_eq!(broken.status, PhaseStatus::Failed);
    assert_eq!(broken.attempts, 2);
    assert!(broken.reason.as_deref().unwrap().contains("Retry budget exhausted after 2"));

    let dependent = summary.outcome("02").unwrap();
    assert_eq!(dependent.status, PhaseStatus::Blocked);
    assert!(dependent.reason.as_deref().unwrap().contains("depends on 01"));
    assert_eq!(summary.outcome("03").unwrap().status, PhaseStatus::Completed);
    // Two attempts for 01, none for 02, one for 03
    assert_eq!(worker_runs(dir.path()), 3);

    let guard = store.lock_sync().unwrap();
    let latest = guard.latest_executions(summary.run_id).unwrap();
    let reason = latest
        .iter()
        .find(|e| e.phase_id == "01")
        .and_then(|e| e.error.clone())
        .unwrap();
    assert!(reason.contains("Retry budget exhausted"));
}

#[tokio::test]
async fn second_restart_request_falls_through_to_compliance() {
    let script = format!(
        "mkdir -p prompts\nn=$(ls prompts | wc -l)\ncat > prompts/$n.txt\necho '{}'\necho '{}'\nsleep 30\n",
        INIT, TOOL_USE
    );
    let mut settings = settings_for(&script);
    settings.retry.max_restarts = 1;
    settings.context.tool_call_threshold = 1;
    let (dir, config) = project(settings);
    let store = in_memory_store();

    let phases = vec![Phase::new("01", "Restarting", vec![])];
    let summary = run_plan(config, store.clone(), Arc::new(NullSink), &phases).await;

    let outcome = summary.outcome("01").unwrap();
    assert_eq!(outcome.status, PhaseStatus::Completed);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.restarts, 1);

    let prompts = dir.path().join("prompts");
    assert_eq!(std::fs::read_dir(&prompts).unwrap().count(), 2);
    let first = std::fs::read_to_string(prompts.join("0.txt")).unwrap();
    let second = std::fs::read_to_string(prompts.join("1.txt")).unwrap();
    assert!(!first.contains("SESSION RESET"));
    assert!(second.starts_with("## SESSION RESET: CONTEXT RESTART"));
    assert!(second.contains("# PHASE 01: Restarting"));

    let guard = store.lock_sync().unwrap();
    let exec = &guard.phase_history("01").unwrap()[0];
    assert_eq!(exec.restarts, 1);
    let restarts = guard.restart_events(exec.id).unwrap();
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].reason, "tool-call-fallback");
    assert!(restarts[0].checkpoint.contains("\"phase_id\":\"01\""));
}

/// Requests `Quit` once a marker file appears.
struct QuitWhenReady {
    marker: PathBuf,
    fired: AtomicBool,
}

impl UiSink for QuitWhenReady {
    fn phase_started(&self, _phase: &Phase, _attempt: u32, _max_attempts: u32) {}
    fn state_changed(&self, _phase_id: &str, _status: PhaseStatus, _reason: Option<&str>) {}
    fn log(&self, _phase_id: &str, _line: &str) {}
    fn token_stats(&self, _session: &TokenStats, _run_total: &TokenStats) {}
    fn poll_action(&self) -> UiAction {
        if self.marker.exists() && !self.fired.swap(true, Ordering::SeqCst) {
            UiAction::Quit
        } else {
            UiAction::None
        }
    }
}

fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Field 3 is the state; zombies are already dead
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn quit_kills_whole_worker_tree() {
    let script = format!(
        "cat > /dev/null\nsleep 300 &\necho $! > child.pid\nsh -c 'sleep 300 & echo $! > grandchild.pid; wait' &\necho '{}'\nsleep 1\ntouch ready\nsleep 300\n",
        INIT
    );
    let (dir, config) = project(settings_for(&script));
    let store = in_memory_store();
    let ui = Arc::new(QuitWhenReady {
        marker: dir.path().join("ready"),
        fired: AtomicBool::new(false),
    });

    let phases = vec![
        Phase::new("01", "Long", vec![]),
        Phase::new("02", "Never", vec![]),
    ];
    let summary = run_plan(config, store.clone(), ui, &phases).await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.outcomes.len(), 1);
    assert!(summary.outcomes[0].reason.as_deref().unwrap().contains("cancelled"));

    for file in ["child.pid", "grandchild.pid"] {
        let pid: i32 = std::fs::read_to_string(dir.path().join(file))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!process_alive(pid), "{} {} survived", file, pid);
    }

    let run = store.lock_sync().unwrap().latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn worker_signals_through_cli_are_verified() {
    let bin = env!("CARGO_BIN_EXE_conductor");
    let task = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t9","name":"Task","input":{"subagent_type":"code-reviewer","prompt":"review"}}]}}"#;
    let task_result = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t9","content":[{"type":"text","text":"looks good"}]}]}}"#;
    let script = format!(
        "cat > /dev/null\necho '{init}'\necho '{task}'\necho '{task_result}'\n\"{bin}\" done \"$CONDUCTOR_PHASE_ID\" --status completed --report '{{\"steps_completed\":[\"review\"],\"agents_used\":[\"code-reviewer\"]}}' > /dev/null\necho '{result}'\n",
        init = INIT,
        task = task,
        task_result = task_result,
        bin = bin,
        result = RESULT,
    );
    let (_dir, config) = project(settings_for(&script));
    let store = StoreHandle::new(SqliteStore::open(&config.db_path).unwrap());

    let mut phase = Phase::new("01", "Reviewed", vec![]).with_capabilities(vec!["code-reviewer".into()]);
    phase.steps = vec!["review".into()];
    let summary = run_plan(config, store, Arc::new(NullSink), &[phase]).await;

    let outcome = summary.outcome("01").unwrap();
    assert_eq!(outcome.status, PhaseStatus::Completed);
    assert_eq!(outcome.reason, None, "no compliance issues expected");
}

#[tokio::test]
async fn blocked_signal_awaits_human() {
    let bin = env!("CARGO_BIN_EXE_conductor");
    let script = format!(
        "cat > /dev/null\necho '{}'\n\"{}\" done \"$CONDUCTOR_PHASE_ID\" --status blocked --reason 'need an API key' > /dev/null\necho '{}'\n",
        INIT, bin, RESULT
    );
    let (_dir, config) = project(settings_for(&script));
    let store = StoreHandle::new(SqliteStore::open(&config.db_path).unwrap());

    let phases = vec![
        Phase::new("01", "Needs creds", vec![]),
        Phase::new("02", "After", vec!["01".into()]),
    ];
    let summary = run_plan(config, store.clone(), Arc::new(NullSink), &phases).await;

    let outcome = summary.outcome("01").unwrap();
    assert_eq!(outcome.status, PhaseStatus::AwaitingHuman);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.reason.as_deref().unwrap().contains("need an API key"));
    assert_eq!(summary.outcome("02").unwrap().status, PhaseStatus::Blocked);
}

#[tokio::test]
async fn nonzero_exit_fails_without_retry() {
    let script = format!("cat > /dev/null\necho '{}'\necho 'boom' >&2\nexit 3\n", INIT);
    let mut settings = settings_for(&script);
    settings.retry.max_retries = 2;
    let (_dir, config) = project(settings);
    let store = in_memory_store();

    let summary = run_plan(
        config,
        store.clone(),
        Arc::new(NullSink),
        &[Phase::new("01", "Crashes", vec![])],
    )
    .await;

    let outcome = summary.outcome("01").unwrap();
    assert_eq!(outcome.status, PhaseStatus::Failed);
    assert_eq!(outcome.attempts, 1);
    let reason = outcome.reason.as_deref().unwrap();
    assert!(reason.contains("exited with code 3"), "{}", reason);
    assert!(reason.contains("boom"), "{}", reason);
}

#[tokio::test]
async fn missing_worker_binary_is_fatal() {
    let mut settings = settings_for("true");
    settings.worker.command = "/nonexistent/conductor-worker".to_string();
    settings.worker.args.clear();
    let (_dir, config) = project(settings);
    let store = in_memory_store();

    let mut orchestrator =
        PhaseOrchestrator::new(config, store.clone(), Arc::new(NullSink), PidRegistry::new());
    let err = orchestrator
        .run(&[Phase::new("01", "Unreachable", vec![])], false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to spawn worker"), "{}", err);

    let guard = store.lock_sync().unwrap();
    assert_eq!(guard.latest_run().unwrap().unwrap().status, RunStatus::Failed);
    let history = guard.phase_history("01").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PhaseStatus::Failed);
    assert!(history[0].completed_at.is_some());
    let reason = history[0].error.as_deref().unwrap();
    assert!(reason.starts_with("Worker failed: Failed to spawn worker"), "{}", reason);
}

#[tokio::test]
async fn resume_skips_completed_phases() {
    let (dir, config) = project(settings_for(&finishing_worker()));
    let store = in_memory_store();
    let phases = vec![Phase::new("01", "One", vec![]), Phase::new("02", "Two", vec!["01".into()])];

    run_plan(config.clone(), store.clone(), Arc::new(NullSink), &phases).await;
    assert_eq!(worker_runs(dir.path()), 2);

    let mut orchestrator =
        PhaseOrchestrator::new(config, store, Arc::new(NullSink), PidRegistry::new());
    let summary = orchestrator.run(&phases, true).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.outcome("02").unwrap().attempts, 0);
    assert_eq!(worker_runs(dir.path()), 2);
}
