//! Gate execution.
//!
//! Gates are re-run by the conductor itself after every attempt. Nothing the
//! worker says about its own gate runs is taken into account here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::phase::{Gate, Phase};
use crate::worker::process;

/// Captured gate output kept per result, from the end of the stream.
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    /// Not run because an earlier blocking gate failed
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub command: String,
    pub blocking: bool,
    pub outcome: GateOutcome,
    pub exit_code: Option<i32>,
    /// Tail of combined stdout and stderr
    pub output: String,
    pub duration_ms: u64,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }

    pub fn failed(&self) -> bool {
        self.outcome == GateOutcome::Failed
    }

    fn skipped(gate: &Gate) -> Self {
        Self {
            name: gate.name.clone(),
            command: gate.command.clone(),
            blocking: gate.blocking,
            outcome: GateOutcome::Skipped,
            exit_code: None,
            output: String::new(),
            duration_ms: 0,
        }
    }
}

/// Runs a phase's gates with `sh -c` in the phase's working directory.
pub struct GateRunner {
    project_dir: PathBuf,
    timeout: Duration,
}

impl GateRunner {
    pub fn new(project_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Run every gate in order. Returns exactly one result per gate.
    ///
    /// After a blocking gate fails the remaining gates are reported as
    /// skipped; a failing non-blocking gate does not stop the sequence.
    pub async fn run(&self, phase: &Phase) -> Vec<GateResult> {
        let workdir = phase.working_dir(&self.project_dir);
        let mut results = Vec::with_capacity(phase.gates.len());
        let mut halted = false;

        for gate in &phase.gates {
            if halted {
                results.push(GateResult::skipped(gate));
                continue;
            }
            let result = self.run_gate(gate, &workdir).await;
            if result.failed() && gate.blocking {
                warn!(phase = %phase.id, gate = %gate.name, "blocking gate failed, halting gates");
                halted = true;
            }
            results.push(result);
        }
        results
    }

    async fn run_gate(&self, gate: &Gate, workdir: &Path) -> GateResult {
        let started = Instant::now();
        debug!(gate = %gate.name, command = %gate.command, "running gate");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&gate.command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::isolate_process_group(&mut cmd);

        let (exit_code, output) = match cmd.spawn() {
            Err(e) => (None, format!("failed to spawn gate command: {}", e)),
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                match timeout(self.timeout, child.wait_with_output()).await {
                    Ok(Ok(out)) => {
                        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                        text.push_str(&String::from_utf8_lossy(&out.stderr));
                        (out.status.code(), text)
                    }
                    Ok(Err(e)) => (None, format!("failed to wait for gate command: {}", e)),
                    Err(_) => {
                        process::kill_tree_now(pid);
                        (
                            None,
                            format!("gate timed out after {}s", self.timeout.as_secs()),
                        )
                    }
                }
            }
        };

        let outcome = if exit_code == Some(0) {
            GateOutcome::Passed
        } else {
            GateOutcome::Failed
        };
        info!(gate = %gate.name, outcome = ?outcome, exit_code = ?exit_code, "gate finished");

        GateResult {
            name: gate.name.clone(),
            command: gate.command.clone(),
            blocking: gate.blocking,
            outcome,
            exit_code,
            output: tail_chars(&output, MAX_OUTPUT_CHARS),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        s.chars().skip(count - max).collect()
    }
}
