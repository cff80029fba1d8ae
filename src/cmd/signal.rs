//! Worker-facing signal commands: `conductor done` and `conductor progress`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use conductor::compliance::{CompletionReport, SignalStatus};
use conductor::config::CONDUCTOR_DIR;
use conductor::orchestrator::runner::{ENV_DB, ENV_PHASE_ID, ENV_RUN_ID};
use conductor::orchestrator::{SqliteStore, StateStore};

/// Parse `--report`: inline JSON, or `@path` to a JSON file.
pub fn parse_report(raw: &str) -> Result<CompletionReport> {
    let json = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report file {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&json).context("Completion report is not valid JSON")
}

pub fn cmd_done(
    project_dir: &Path,
    phase_id: &str,
    status: &str,
    reason: Option<&str>,
    report: Option<&str>,
) -> Result<()> {
    let status = SignalStatus::from_str(status)?;
    let report = report.map(parse_report).transpose()?;

    if let Ok(active) = std::env::var(ENV_PHASE_ID)
        && active != phase_id
    {
        warn!(active = %active, signalled = %phase_id, "signalling a phase other than the active one");
    }

    let db_path = std::env::var(ENV_DB)
        .map(PathBuf::from)
        .unwrap_or_else(|_| project_dir.join(CONDUCTOR_DIR).join("state.db"));
    if !db_path.exists() {
        anyhow::bail!("No conductor state at {}", db_path.display());
    }
    let store = SqliteStore::open(&db_path)?;

    let run_id = match std::env::var(ENV_RUN_ID) {
        Ok(id) => id.parse::<i64>().context("CONDUCTOR_RUN_ID is not a number")?,
        Err(_) => {
            store
                .latest_run()?
                .context("No run recorded; nothing to signal")?
                .id
        }
    };

    store.record_signal(run_id, phase_id, status, reason, report.as_ref())?;
    println!("Recorded {} signal for phase {}", status, phase_id);
    Ok(())
}

/// Progress is read from the worker's own stream; the command only acknowledges.
pub fn cmd_progress(message: &str) -> Result<()> {
    if message.trim().is_empty() {
        anyhow::bail!("Progress message is empty");
    }
    println!("Progress noted: {}", message.trim());
    Ok(())
}
