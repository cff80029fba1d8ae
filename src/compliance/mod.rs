//! Compliance verification and remediation.
//!
//! `ComplianceChecker::verify` turns one finished attempt into a fresh list
//! of `ComplianceIssue`s by re-running gates, inspecting the notes output, and
//! searching the session log for evidence of required capabilities. The
//! remediation strategy is a pure function of that list.

mod report;

pub use report::{CompletionReport, CompletionSignal, SignalStatus};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::gates::{GateResult, GateRunner};
use crate::phase::Phase;
use crate::stream::truncate_str;
use crate::worker::SessionLog;

/// Evidence excerpts are cut to this many characters.
const MAX_EVIDENCE_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    GatesFailed,
    NotesMissing,
    NotesIncomplete,
    AgentSkipped,
    StepSkipped,
    WorkerBlocked,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::GatesFailed => "gates-failed",
            IssueKind::NotesMissing => "notes-missing",
            IssueKind::NotesIncomplete => "notes-incomplete",
            IssueKind::AgentSkipped => "agent-skipped",
            IssueKind::StepSkipped => "step-skipped",
            IssueKind::WorkerBlocked => "worker-blocked",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub detail: String,
    pub evidence: Option<String>,
}

impl ComplianceIssue {
    pub fn new(kind: IssueKind, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            detail: detail.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }
}

impl std::fmt::Display for ComplianceIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.detail)
    }
}

/// What to do about a set of issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemediationStrategy {
    /// No issues
    Pass,
    WarnAndAccept,
    TargetedFix,
    FullRetry,
    HumanRequired,
}

impl RemediationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStrategy::Pass => "pass",
            RemediationStrategy::WarnAndAccept => "warn-and-accept",
            RemediationStrategy::TargetedFix => "targeted-fix",
            RemediationStrategy::FullRetry => "full-retry",
            RemediationStrategy::HumanRequired => "human-required",
        }
    }

    /// Whether the phase can be marked completed.
    pub fn accepts(&self) -> bool {
        matches!(
            self,
            RemediationStrategy::Pass | RemediationStrategy::WarnAndAccept
        )
    }
}

impl std::fmt::Display for RemediationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a strategy. First match wins: an explicit worker block, then two or
/// more critical issues, then one critical or two high, then anything else.
pub fn select_strategy(issues: &[ComplianceIssue]) -> RemediationStrategy {
    if issues.iter().any(|i| i.kind == IssueKind::WorkerBlocked) {
        return RemediationStrategy::HumanRequired;
    }
    let critical = issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .count();
    let high = issues
        .iter()
        .filter(|i| i.severity == Severity::High)
        .count();

    if critical >= 2 {
        RemediationStrategy::FullRetry
    } else if critical == 1 || high >= 2 {
        RemediationStrategy::TargetedFix
    } else if !issues.is_empty() {
        RemediationStrategy::WarnAndAccept
    } else {
        RemediationStrategy::Pass
    }
}

/// One-line summary of an issue list, for persisted reasons.
pub fn summarize(issues: &[ComplianceIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{} ({})", i.kind, i.detail))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of one verification pass.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub issues: Vec<ComplianceIssue>,
    pub strategy: RemediationStrategy,
    pub gate_results: Vec<GateResult>,
}

pub struct ComplianceChecker {
    project_dir: PathBuf,
    gates: GateRunner,
    required_sections: Vec<String>,
}

impl ComplianceChecker {
    pub fn new(project_dir: &Path, gates: GateRunner, required_sections: Vec<String>) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            gates,
            required_sections,
        }
    }

    /// Verify an attempt against independent evidence.
    pub async fn verify(
        &self,
        phase: &Phase,
        log: &SessionLog,
        signal: Option<&CompletionSignal>,
    ) -> Verdict {
        let report = signal.and_then(|s| s.report.as_ref());
        let mut issues = Vec::new();

        if let Some(signal) = signal
            && signal.status == SignalStatus::Blocked
        {
            issues.push(ComplianceIssue::new(
                IssueKind::WorkerBlocked,
                Severity::Critical,
                signal
                    .reason
                    .clone()
                    .unwrap_or_else(|| "worker signalled blocked without a reason".to_string()),
            ));
        }

        let gate_results = self.gates.run(phase).await;
        issues.extend(gate_issues(&gate_results, report));
        issues.extend(self.notes_issues(phase));
        issues.extend(capability_issues(phase, log, report));
        issues.extend(step_issues(phase, report));

        let strategy = select_strategy(&issues);
        info!(
            phase = %phase.id,
            issues = issues.len(),
            strategy = %strategy,
            "compliance verified"
        );

        Verdict {
            issues,
            strategy,
            gate_results,
        }
    }

    fn notes_issues(&self, phase: &Phase) -> Vec<ComplianceIssue> {
        let Some(notes) = &phase.notes_out else {
            return Vec::new();
        };
        let path = if notes.is_absolute() {
            notes.clone()
        } else {
            self.project_dir.join(notes)
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                let severity = if phase.notes_required {
                    Severity::Critical
                } else {
                    Severity::Low
                };
                return vec![ComplianceIssue::new(
                    IssueKind::NotesMissing,
                    severity,
                    format!("notes output {} was not written", notes.display()),
                )];
            }
        };

        let severity = if phase.notes_required {
            Severity::High
        } else {
            Severity::Low
        };
        self.required_sections
            .iter()
            .filter(|section| !content.contains(section.as_str()))
            .map(|section| {
                ComplianceIssue::new(
                    IssueKind::NotesIncomplete,
                    severity,
                    format!("notes {} lack section '{}'", notes.display(), section),
                )
            })
            .collect()
    }
}

fn gate_issues(results: &[GateResult], report: Option<&CompletionReport>) -> Vec<ComplianceIssue> {
    results
        .iter()
        .filter(|r| r.failed())
        .map(|r| {
            let detail = match r.exit_code {
                Some(code) => format!("gate '{}' failed with exit code {}", r.name, code),
                None => format!("gate '{}' failed", r.name),
            };
            let mut evidence = truncate_tail(&r.output, MAX_EVIDENCE_CHARS);
            if report.is_some_and(|rep| rep.claims_gate_passed(&r.name)) {
                evidence = format!("worker reported '{}' as passed, but:\n{}", r.name, evidence);
            }
            ComplianceIssue::new(IssueKind::GatesFailed, Severity::Critical, detail)
                .with_evidence(evidence)
        })
        .collect()
}

fn capability_issues(
    phase: &Phase,
    log: &SessionLog,
    report: Option<&CompletionReport>,
) -> Vec<ComplianceIssue> {
    phase
        .required_capabilities
        .iter()
        .filter(|cap| !log.has_evidence_of(cap))
        .map(|cap| {
            if report.is_some_and(|r| r.claims_agent(cap)) {
                ComplianceIssue::new(
                    IssueKind::AgentSkipped,
                    Severity::High,
                    format!("'{}' claimed as used but never invoked", cap),
                )
                .with_evidence(format!(
                    "tools invoked: {}",
                    truncate_str(&log.tool_uses.join(", "), MAX_EVIDENCE_CHARS)
                ))
            } else {
                ComplianceIssue::new(
                    IssueKind::AgentSkipped,
                    Severity::Critical,
                    format!("required capability '{}' was not used", cap),
                )
            }
        })
        .collect()
}

fn step_issues(phase: &Phase, report: Option<&CompletionReport>) -> Vec<ComplianceIssue> {
    let Some(report) = report else {
        return vec![ComplianceIssue::new(
            IssueKind::StepSkipped,
            Severity::Low,
            "no completion report was submitted",
        )];
    };
    phase
        .steps
        .iter()
        .filter(|step| !report.claims_step(step))
        .map(|step| {
            ComplianceIssue::new(
                IssueKind::StepSkipped,
                Severity::High,
                format!("step '{}' not reported as completed", step),
            )
        })
        .collect()
}

fn truncate_tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.trim_end().to_string()
    } else {
        let tail: String = s.chars().skip(count - max).collect();
        format!("...{}", tail.trim_end())
    }
}
