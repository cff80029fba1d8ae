//! Phase definitions and JSON plan loading.
//!
//! This module provides:
//! - `Phase` and `Gate`, the immutable description of a unit of work
//! - `PhaseStatus`, the only mutable part of a phase during a run
//! - `PhasesFile` for the `phases.json` plan format
//! - `dependency_order`, the topological walk the orchestrator follows

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use crate::errors::OrchestratorError;

/// A pass/fail validation command attached to a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gate {
    pub name: String,
    /// Shell command, run with `sh -c` in the phase's working directory
    pub command: String,
    /// A failing blocking gate stops the remaining gates from running
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

impl Gate {
    pub fn new(name: &str, command: &str, blocking: bool) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            blocking,
        }
    }
}

/// A single unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Phase identifier (e.g., "01", "auth-setup")
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Ids of phases that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    /// Capability (sub-agent) names the worker is required to use
    #[serde(default, alias = "agents")]
    pub required_capabilities: Vec<String>,
    /// Notes produced by earlier phases that this phase should read
    #[serde(default)]
    pub notes_in: Option<PathBuf>,
    /// Notes this phase must produce
    #[serde(default)]
    pub notes_out: Option<PathBuf>,
    /// Whether a missing or incomplete `notes_out` blocks completion
    #[serde(default)]
    pub notes_required: bool,
    /// Declared steps, checked against the worker's completion report
    #[serde(default)]
    pub steps: Vec<String>,
    /// Working directory override, relative to the project directory
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Phase {
    pub fn new(id: &str, title: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            depends_on,
            gates: Vec::new(),
            required_capabilities: Vec::new(),
            notes_in: None,
            notes_out: None,
            notes_required: false,
            steps: Vec::new(),
            workdir: None,
        }
    }

    pub fn with_gates(mut self, gates: Vec<Gate>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    /// Resolve the directory gates and the worker run in.
    pub fn working_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        }
    }
}

/// Lifecycle of a phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Validating,
    Completed,
    Failed,
    Blocked,
    AwaitingHuman,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Validating => "validating",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Blocked => "blocked",
            PhaseStatus::AwaitingHuman => "awaiting_human",
            PhaseStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            PhaseStatus::Pending | PhaseStatus::Running | PhaseStatus::Validating
        )
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "running" => Ok(PhaseStatus::Running),
            "validating" => Ok(PhaseStatus::Validating),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            "blocked" => Ok(PhaseStatus::Blocked),
            "awaiting_human" => Ok(PhaseStatus::AwaitingHuman),
            "skipped" => Ok(PhaseStatus::Skipped),
            _ => anyhow::bail!("Invalid phase status '{}'", s),
        }
    }
}

/// The `phases.json` plan format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesFile {
    pub phases: Vec<Phase>,
}

impl PhasesFile {
    /// Load phases from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;

        let phases_file: PhasesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phases JSON: {}", path.display()))?;

        Ok(phases_file)
    }
}

/// Order phases so every phase follows its dependencies.
///
/// Kahn's algorithm, stable with respect to declared order. Phases caught in a
/// cycle never become ready; they are appended in declared order and the
/// orchestrator reports them as blocked when their dependencies never complete.
pub fn dependency_order(phases: &[Phase]) -> Result<Vec<Phase>, OrchestratorError> {
    let index: HashMap<&str, usize> = phases
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; phases.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); phases.len()];
    for (i, phase) in phases.iter().enumerate() {
        for dep in &phase.depends_on {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                return Err(OrchestratorError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                });
            };
            in_degree[i] += 1;
            dependents[dep_idx].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..phases.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = vec![false; phases.len()];
    let mut ordered = Vec::with_capacity(phases.len());

    while let Some(i) = ready.pop_front() {
        placed[i] = true;
        ordered.push(phases[i].clone());
        let mut unlocked: Vec<usize> = Vec::new();
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                unlocked.push(d);
            }
        }
        unlocked.sort_unstable();
        ready.extend(unlocked);
    }

    ordered.extend(
        phases
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, p)| p.clone()),
    );
    Ok(ordered)
}
