//! Prompt text handed to worker sessions.

use std::path::Path;

use crate::compliance::{ComplianceIssue, RemediationStrategy};
use crate::phase::Phase;

/// Base prompt for a phase attempt.
pub fn phase_prompt(
    phase: &Phase,
    project_dir: &Path,
    progress_command: &str,
    required_sections: &[String],
) -> String {
    let mut out = format!("# PHASE {}: {}\n\n", phase.id, phase.title);

    if let Some(notes_in) = &phase.notes_in {
        let path = project_dir.join(notes_in);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                out.push_str("## CONTEXT FROM EARLIER PHASES\n");
                out.push_str(content.trim_end());
                out.push_str("\n\n");
            }
            Err(_) => out.push_str(&format!(
                "## CONTEXT FROM EARLIER PHASES\n[{} does not exist yet]\n\n",
                notes_in.display()
            )),
        }
    }

    if !phase.steps.is_empty() {
        out.push_str("## STEPS\n");
        for (i, step) in phase.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out.push('\n');
    }

    if !phase.required_capabilities.is_empty() {
        out.push_str("## REQUIRED AGENTS\nYou must actually invoke each of these, not just mention them:\n");
        for cap in &phase.required_capabilities {
            out.push_str(&format!("- {}\n", cap));
        }
        out.push('\n');
    }

    if !phase.gates.is_empty() {
        out.push_str("## GATES\nThese commands are re-run independently after you finish:\n");
        for gate in &phase.gates {
            let kind = if gate.blocking { "blocking" } else { "advisory" };
            out.push_str(&format!("- {} ({}): `{}`\n", gate.name, kind, gate.command));
        }
        out.push('\n');
    }

    if let Some(notes_out) = &phase.notes_out {
        out.push_str(&format!(
            "## NOTES\nWrite notes for later phases to {}",
            notes_out.display()
        ));
        if !required_sections.is_empty() {
            out.push_str(&format!(" with sections: {}", required_sections.join(", ")));
        }
        out.push_str(".\n\n");
    }

    out.push_str(&format!(
        r#"## SIGNALS
- Record progress after each meaningful step: {progress} "<what you finished>"
- When the phase is done: conductor done {id} --status completed --report '<json>'
  The report is a JSON object with steps_completed, agents_used, gates_run, notes_path and warnings.
- If you cannot continue without a human: conductor done {id} --status blocked --reason "<why>"
"#,
        progress = progress_command,
        id = phase.id
    ));

    out
}

/// Put a restart briefing in front of the base prompt.
pub fn with_restart_context(restart_block: &str, prompt: &str) -> String {
    if restart_block.is_empty() {
        return prompt.to_string();
    }
    format!("{}\n\n---\n\n{}", restart_block.trim_end(), prompt)
}

/// Prompt for a remediation attempt: the issues first, then the base prompt.
pub fn remediation_prompt(
    base: &str,
    attempt: u32,
    strategy: RemediationStrategy,
    issues: &[ComplianceIssue],
) -> String {
    let mut out = format!(
        "## REMEDIATION (attempt {}, {})\n",
        attempt,
        strategy.as_str()
    );
    match strategy {
        RemediationStrategy::TargetedFix => out.push_str(
            "The previous attempt was mostly done. Fix only the issues below, then signal done again.\n",
        ),
        _ => out.push_str(
            "The previous attempt did not hold up to verification. Redo the phase, addressing every issue below.\n",
        ),
    }
    out.push_str("\n### Issues found\n");
    for issue in issues {
        out.push_str(&format!(
            "- [{}] {}: {}\n",
            issue.severity, issue.kind, issue.detail
        ));
        if let Some(evidence) = &issue.evidence {
            for line in evidence.lines().take(10) {
                out.push_str(&format!("    > {}\n", line));
            }
        }
    }
    out.push_str("\n---\n\n");
    out.push_str(base);
    out
}
