//! Phase orchestration: sequencing, attempts, restarts and persisted state.

pub mod prompt;
pub mod runner;
pub mod state;

pub use runner::{PhaseOrchestrator, PhaseOutcome, RunSummary, UI_POLL_INTERVAL};
pub use state::{
    GateRecord, PhaseExecution, RestartRecord, RunRecord, RunStatus, SqliteStore, StateStore,
    StoreHandle,
};
