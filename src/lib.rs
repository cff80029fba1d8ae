pub mod checkpoint;
pub mod compliance;
pub mod config;
pub mod context;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod stream;
pub mod tracker;
pub mod ui;
pub mod worker;
