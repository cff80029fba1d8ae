use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conductor::config::{CONDUCTOR_DIR, Config};
use conductor::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Run plan phases through supervised worker sessions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every phase in .conductor/phases.json
    Run {
        /// Treat phases completed by an earlier run of this plan as done
        #[arg(long)]
        resume: bool,
    },
    /// Show the latest run's phase states and why each stopped
    Status,
    /// Show every execution of one phase
    History { phase: String },
    /// Signal that a phase is finished (called by the worker)
    Done {
        phase: String,
        /// completed or blocked
        #[arg(long, default_value = "completed")]
        status: String,
        #[arg(long)]
        reason: Option<String>,
        /// Completion report as JSON, or @path to a JSON file
        #[arg(long)]
        report: Option<String>,
    },
    /// Record a progress message (called by the worker)
    Progress { message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = matches!(cli.command, Commands::Run { .. })
        .then(|| project_dir.join(CONDUCTOR_DIR).join("logs"));
    let _log_guard = logging::init(cli.verbose, log_dir.as_deref())?;

    match &cli.command {
        Commands::Run { resume } => {
            let config = Config::load(&project_dir, cli.verbose)?;
            cmd::cmd_run(config, *resume).await?;
        }
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::History { phase } => cmd::cmd_history(&project_dir, phase)?,
        Commands::Done {
            phase,
            status,
            reason,
            report,
        } => cmd::cmd_done(&project_dir, phase, status, reason.as_deref(), report.as_deref())?,
        Commands::Progress { message } => cmd::cmd_progress(message)?,
    }

    Ok(())
}
