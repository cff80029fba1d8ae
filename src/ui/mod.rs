//! The orchestrator's view of a user interface.
//!
//! The orchestrator reports through [`UiSink`] and polls it for a
//! [`UiAction`]. It never inspects what kind of sink it was given.

pub mod console;
pub mod icons;

use crate::phase::{Phase, PhaseStatus};
use crate::stream::TokenStats;

pub use console::ConsoleSink;

/// Actions a user can request while a run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiAction {
    #[default]
    None,
    Pause,
    Resume,
    Skip,
    Quit,
}

/// Everything a UI must handle. Methods take `&self` so one sink can be
/// shared between the orchestrator and the session observer.
pub trait UiSink: Send + Sync {
    fn phase_started(&self, phase: &Phase, attempt: u32, max_attempts: u32);
    fn state_changed(&self, phase_id: &str, status: PhaseStatus, reason: Option<&str>);
    fn log(&self, phase_id: &str, line: &str);
    fn token_stats(&self, session: &TokenStats, run_total: &TokenStats);
    /// Next pending user action, or `UiAction::None`. Must not block.
    fn poll_action(&self) -> UiAction;
}

/// Sink that renders nothing and never requests an action.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl UiSink for NullSink {
    fn phase_started(&self, _phase: &Phase, _attempt: u32, _max_attempts: u32) {}
    fn state_changed(&self, _phase_id: &str, _status: PhaseStatus, _reason: Option<&str>) {}
    fn log(&self, _phase_id: &str, _line: &str) {}
    fn token_stats(&self, _session: &TokenStats, _run_total: &TokenStats) {}
    fn poll_action(&self) -> UiAction {
        UiAction::None
    }
}
