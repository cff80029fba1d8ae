//! Worker session management.
//!
//! A worker is an external agent process speaking the stream-json protocol.
//! This module spawns it, decodes its output, enforces the timeout and the
//! context budget, and guarantees the whole process tree is gone afterwards.

mod log;
pub mod process;
mod registry;
mod session;

pub use log::SessionLog;
pub use registry::PidRegistry;
pub use session::{
    EVENT_CHANNEL_CAPACITY, NoopObserver, SessionObserver, SessionReport, SessionState,
    StopHandle, Termination, WorkerSession, WorkerSpec,
};
