//! Typed error hierarchy for the conductor.
//!
//! Three top-level enums cover the three layers:
//! - `WorkerError`: infrastructure failures while running a worker process
//! - `PhaseError`: why a single phase stopped short of `completed`
//! - `OrchestratorError`: failures that end the whole run

use thiserror::Error;

/// Infrastructure failures from a worker session.
///
/// These are never retried: a missing binary or a broken pipe will not fix
/// itself on the next attempt.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker process '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Failed to wait for worker process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Failed to open session log at {path}: {source}")]
    SessionLog {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a phase did not reach `completed`.
///
/// The `Display` output is what gets persisted as the human-readable reason
/// for the phase's terminal state.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Worker failed: {reason}")]
    WorkerFailure { reason: String },

    #[error("Compliance failed with {issue_count} issue(s): {summary}")]
    ComplianceFailure { issue_count: usize, summary: String },

    #[error("Context restart budget exhausted after {restarts} restart(s)")]
    RestartExceeded { restarts: u32 },

    #[error("Retry budget exhausted after {attempts} attempt(s): {last_issue}")]
    RetryExceeded { attempts: u32, last_issue: String },

    #[error("Phase {phase} depends on {dependency}, which has not completed")]
    DependencyUnmet { phase: String, dependency: String },

    #[error("Human input required: {reason}")]
    HumanRequired { reason: String },
}

/// Errors that abort an entire run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("State store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Run cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
