//! The worker's completion signal: the claimed side of verification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Status a worker may signal for its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Completed,
    Blocked,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Completed => "completed",
            SignalStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(SignalStatus::Completed),
            "blocked" => Ok(SignalStatus::Blocked),
            _ => anyhow::bail!("Invalid signal status '{}' (expected completed or blocked)", s),
        }
    }
}

/// Structured report attached to a completion signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionReport {
    pub steps_completed: Vec<String>,
    pub agents_used: Vec<String>,
    /// Gate name to the status the worker says it observed
    pub gates_run: BTreeMap<String, String>,
    pub notes_path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl CompletionReport {
    pub fn claims_agent(&self, agent: &str) -> bool {
        self.agents_used.iter().any(|a| a.eq_ignore_ascii_case(agent))
    }

    pub fn claims_step(&self, step: &str) -> bool {
        self.steps_completed
            .iter()
            .any(|s| s.trim().eq_ignore_ascii_case(step.trim()))
    }

    /// Whether the worker claimed this gate passed.
    pub fn claims_gate_passed(&self, gate: &str) -> bool {
        self.gates_run.get(gate).is_some_and(|status| {
            matches!(
                status.to_ascii_lowercase().as_str(),
                "pass" | "passed" | "ok" | "success"
            )
        })
    }
}

/// The most recent `done` signal for a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSignal {
    pub status: SignalStatus,
    pub reason: Option<String>,
    pub report: Option<CompletionReport>,
}
