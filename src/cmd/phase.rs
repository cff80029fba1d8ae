//! `conductor status` and `conductor history`.

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use conductor::config::CONDUCTOR_DIR;
use conductor::orchestrator::{PhaseExecution, SqliteStore, StateStore};
use conductor::ui::icons::status_icon;

fn db_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONDUCTOR_DIR).join("state.db")
}

fn open_store(project_dir: &Path) -> Result<Option<SqliteStore>> {
    let path = db_path(project_dir);
    if !path.exists() {
        println!("No runs recorded yet.");
        return Ok(None);
    }
    Ok(Some(SqliteStore::open(&path)?))
}

fn print_execution(exec: &PhaseExecution) {
    print!(
        "  {}{:<8} {:<15} attempt {}",
        status_icon(exec.status),
        exec.phase_id,
        exec.status.as_str(),
        exec.attempt
    );
    if exec.restarts > 0 {
        print!(", restarts {}", exec.restarts);
    }
    println!();
    if let Some(error) = &exec.error {
        println!("           {}", style(error).dim());
    }
}

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    let Some(store) = open_store(project_dir)? else {
        return Ok(());
    };
    let Some(run) = store.latest_run()? else {
        println!("No runs recorded yet.");
        return Ok(());
    };

    println!();
    println!(
        "Run {} ({}) started {}",
        run.id,
        style(run.status.as_str()).bold(),
        run.started_at
    );
    println!("Plan: {}", run.plan_path);
    if let Some(done) = &run.completed_at {
        println!("Finished: {}", done);
    }
    println!();

    let executions = store.latest_executions(run.id)?;
    if executions.is_empty() {
        println!("  No phases have started.");
    }
    for exec in &executions {
        print_execution(exec);
    }
    println!();
    Ok(())
}

pub fn cmd_history(project_dir: &Path, phase_id: &str) -> Result<()> {
    let Some(store) = open_store(project_dir)? else {
        return Ok(());
    };
    let history = store.phase_history(phase_id)?;
    if history.is_empty() {
        println!("No executions recorded for phase {}.", phase_id);
        return Ok(());
    }

    println!();
    println!("Phase {} history", style(phase_id).yellow());
    for exec in &history {
        println!();
        println!(
            "Run {} attempt {} ({} .. {})",
            exec.run_id,
            exec.attempt,
            exec.started_at,
            exec.completed_at.as_deref().unwrap_or("-")
        );
        print_execution(exec);
        for gate in store.gate_results(exec.id)? {
            let mark = if gate.passed {
                style("pass").green()
            } else {
                style("fail").red()
            };
            println!("    gate {:<20} {}", gate.gate_name, mark);
        }
        for restart in store.restart_events(exec.id)? {
            println!("    restart {} ({}) at {}", restart.seq, restart.reason, restart.created_at);
        }
        if let Some(log) = &exec.log_path {
            println!("    log {}", style(log).dim());
        }
    }
    println!();
    Ok(())
}
