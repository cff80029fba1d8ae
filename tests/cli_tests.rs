//! CLI tests for the `conductor` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use conductor::compliance::SignalStatus;
use conductor::orchestrator::{SqliteStore, StateStore};

fn conductor() -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.env_remove("CONDUCTOR_DB")
        .env_remove("CONDUCTOR_RUN_ID")
        .env_remove("CONDUCTOR_PHASE_ID")
        .env_remove("CONDUCTOR_WORKER_CMD")
        .env_remove("RUST_LOG");
    cmd
}

fn seeded_store(dir: &TempDir) -> (std::path::PathBuf, i64) {
    let db = dir.path().join(".conductor/state.db");
    let store = SqliteStore::open(&db).unwrap();
    let run_id = store.create_run(".conductor/phases.json").unwrap();
    (db, run_id)
}

// =============================================================================
// Basics
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("done"))
            .stdout(predicate::str::contains("progress"));
    }

    #[test]
    fn test_version() {
        conductor()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("conductor"));
    }

    #[test]
    fn test_status_without_runs() {
        let dir = TempDir::new().unwrap();
        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded yet."));
    }

    #[test]
    fn test_run_without_plan_fails() {
        let dir = TempDir::new().unwrap();
        conductor()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No plan found"));
    }

    #[test]
    fn test_history_unknown_phase() {
        let dir = TempDir::new().unwrap();
        seeded_store(&dir);
        conductor()
            .current_dir(dir.path())
            .args(["history", "99"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No executions recorded for phase 99."));
    }
}

// =============================================================================
// Worker signals
// =============================================================================

mod signals {
    use super::*;

    #[test]
    fn test_done_records_signal_with_report() {
        let dir = TempDir::new().unwrap();
        let (db, run_id) = seeded_store(&dir);

        conductor()
            .current_dir(dir.path())
            .env("CONDUCTOR_DB", &db)
            .env("CONDUCTOR_RUN_ID", run_id.to_string())
            .args([
                "done",
                "01",
                "--report",
                r#"{"steps_completed":["write schema"],"agents_used":["code-reviewer"]}"#,
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Recorded completed signal for phase 01"));

        let store = SqliteStore::open(&db).unwrap();
        let signal = store.latest_signal_after(run_id, "01", 0).unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Completed);
        let report = signal.report.unwrap();
        assert!(report.claims_step("write schema"));
        assert!(report.claims_agent("code-reviewer"));
    }

    #[test]
    fn test_done_blocked_uses_latest_run() {
        let dir = TempDir::new().unwrap();
        let (db, run_id) = seeded_store(&dir);

        conductor()
            .current_dir(dir.path())
            .args(["done", "02", "--status", "blocked", "--reason", "missing credentials"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Recorded blocked signal for phase 02"));

        let store = SqliteStore::open(&db).unwrap();
        let signal = store.latest_signal_after(run_id, "02", 0).unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Blocked);
        assert_eq!(signal.reason.as_deref(), Some("missing credentials"));
    }

    #[test]
    fn test_done_report_from_file() {
        let dir = TempDir::new().unwrap();
        let (db, run_id) = seeded_store(&dir);
        fs::write(dir.path().join("report.json"), r#"{"warnings":["slow tests"]}"#).unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["done", "01", "--report", "@report.json"])
            .assert()
            .success();

        let store = SqliteStore::open(&db).unwrap();
        let signal = store.latest_signal_after(run_id, "01", 0).unwrap().unwrap();
        assert_eq!(signal.report.unwrap().warnings, vec!["slow tests".to_string()]);
    }

    #[test]
    fn test_done_rejects_unknown_status() {
        let dir = TempDir::new().unwrap();
        seeded_store(&dir);
        conductor()
            .current_dir(dir.path())
            .args(["done", "01", "--status", "finished"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("finished"));
    }

    #[test]
    fn test_done_rejects_invalid_report() {
        let dir = TempDir::new().unwrap();
        seeded_store(&dir);
        conductor()
            .current_dir(dir.path())
            .args(["done", "01", "--report", "{not json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not valid JSON"));
    }

    #[test]
    fn test_done_without_state_fails() {
        let dir = TempDir::new().unwrap();
        conductor()
            .current_dir(dir.path())
            .args(["done", "01"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No conductor state"));
    }

    #[test]
    fn test_progress_acknowledges() {
        conductor()
            .args(["progress", "wrote the migration"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Progress noted: wrote the migration"));
    }

    #[test]
    fn test_progress_rejects_empty_message() {
        conductor().args(["progress", "  "]).assert().failure();
    }
}

// =============================================================================
// End to end
// =============================================================================

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use conductor::config::ConductorToml;

    const WORKER_SCRIPT: &str = r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"s1","model":"test"}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"done","usage":{"input_tokens":10,"output_tokens":5},"total_cost_usd":0.01}'
"#;

    fn write_project(dir: &TempDir, max_retries: u32, phases: &str) {
        let conductor_dir = dir.path().join(".conductor");
        fs::create_dir_all(&conductor_dir).unwrap();

        let mut settings = ConductorToml::default();
        settings.worker.command = "sh".to_string();
        settings.worker.args = vec!["-c".into(), WORKER_SCRIPT.into(), "worker".into()];
        settings.worker.stop_grace_secs = 1;
        settings.commit.enabled = false;
        settings.retry.max_retries = max_retries;
        fs::write(
            conductor_dir.join("conductor.toml"),
            toml::to_string(&settings).unwrap(),
        )
        .unwrap();
        fs::write(conductor_dir.join("phases.json"), phases).unwrap();
    }

    #[test]
    fn test_run_then_status_and_history() {
        let dir = TempDir::new().unwrap();
        write_project(
            &dir,
            2,
            r#"{"phases":[
                {"id":"01","title":"Scaffold","gates":[{"name":"marker","command":"true"}]},
                {"id":"02","title":"Build","depends_on":["01"]}
            ]}"#,
        );

        conductor()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));

        assert!(dir.path().join(".conductor/logs/conductor.log").exists());
        assert!(dir
            .path()
            .join(".conductor/logs/phase-01-attempt-1.jsonl")
            .exists());

        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("01"))
            .stdout(predicate::str::contains("02"));

        conductor()
            .current_dir(dir.path())
            .args(["history", "01"])
            .assert()
            .success()
            .stdout(predicate::str::contains("marker"));
    }

    #[test]
    fn test_failing_run_exits_nonzero() {
        let dir = TempDir::new().unwrap();
        write_project(
            &dir,
            0,
            r#"{"phases":[{"id":"01","title":"Broken","gates":[{"name":"never","command":"exit 1"}]}]}"#,
        );

        conductor()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("did not complete"));
    }
}
