//! CLI command implementations.
//!
//! | Module   | Commands handled       |
//! |----------|------------------------|
//! | `run`    | `Run`                  |
//! | `phase`  | `Status`, `History`    |
//! | `signal` | `Done`, `Progress`     |

pub mod phase;
pub mod run;
pub mod signal;

pub use phase::{cmd_history, cmd_status};
pub use run::cmd_run;
pub use signal::{cmd_done, cmd_progress};
