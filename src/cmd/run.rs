//! `conductor run`.

use anyhow::Result;
use console::style;
use std::sync::Arc;
use tracing::warn;

use conductor::config::Config;
use conductor::errors::OrchestratorError;
use conductor::orchestrator::{PhaseOrchestrator, RunStatus, SqliteStore, StoreHandle};
use conductor::phase::PhasesFile;
use conductor::ui::ConsoleSink;
use conductor::ui::icons::status_icon;
use conductor::worker::PidRegistry;

pub async fn cmd_run(config: Config, resume: bool) -> Result<()> {
    if !config.plan_file.exists() {
        anyhow::bail!(
            "No plan found at {}. Write the phase plan there first.",
            config.plan_file.display()
        );
    }
    for warning in config.settings.validate() {
        warn!("{}", warning);
    }
    config.ensure_directories()?;

    let plan = PhasesFile::load(&config.plan_file)?;
    let store = StoreHandle::new(SqliteStore::open(&config.db_path)?);
    let registry = PidRegistry::new();
    let sink = Arc::new(ConsoleSink::new(config.verbose));
    sink.listen_for_interrupt(registry.clone());

    let mut orchestrator = PhaseOrchestrator::new(config, store, sink.clone(), registry.clone());
    let result = orchestrator.run(&plan.phases, resume).await;

    // Last resort for anything a failed run left behind
    let reaped = registry.reap_all();
    if reaped > 0 {
        warn!(reaped, "killed leftover worker process trees");
    }
    let summary = result?;

    println!();
    println!("Run {} {}", summary.run_id, style(summary.status.as_str()).bold());
    for outcome in &summary.outcomes {
        print!(
            "  {}{:<8} {:<15} attempts {}",
            status_icon(outcome.status),
            outcome.phase_id,
            outcome.status.as_str(),
            outcome.attempts
        );
        if outcome.restarts > 0 {
            print!(", restarts {}", outcome.restarts);
        }
        println!();
        if let Some(reason) = &outcome.reason {
            println!("           {}", style(reason).dim());
        }
    }
    println!(
        "  tokens: {} (${:.4})",
        summary.tokens.total_tokens(),
        summary.tokens.cost_usd
    );

    match summary.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => Err(OrchestratorError::Cancelled.into()),
        _ => {
            let unfinished = summary
                .outcomes
                .iter()
                .filter(|o| o.status != conductor::phase::PhaseStatus::Completed)
                .count();
            anyhow::bail!("{} phase(s) did not complete", unfinished)
        }
    }
}
