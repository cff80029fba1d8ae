use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a worker observably did during an attempt.
///
/// Compliance checks look here for evidence instead of trusting the worker's
/// own completion report. Restarted sessions within one attempt are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    /// Tool names in invocation order
    pub tool_uses: Vec<String>,
    /// `subagent_type` of every sub-agent spawned
    pub subagents_invoked: Vec<String>,
    /// Sub-agents whose results came back
    pub subagent_results: Vec<String>,
    /// Explicit progress messages
    pub progress: Vec<String>,
    pub result_text: Option<String>,
    pub result_is_error: bool,
}

impl SessionLog {
    pub fn record_tool_use(&mut self, name: &str, input: &Value) {
        self.tool_uses.push(name.to_string());
        if let Some(agent) = input.get("subagent_type").and_then(|v| v.as_str()) {
            self.subagents_invoked.push(agent.to_string());
        }
        // Skill-style tools name the capability in their input
        if let Some(skill) = input.get("skill").and_then(|v| v.as_str()) {
            self.subagents_invoked.push(skill.to_string());
        }
    }

    pub fn record_subagent_result(&mut self, agent: &str) {
        self.subagent_results.push(agent.to_string());
    }

    /// Whether the log shows the capability being used.
    pub fn has_evidence_of(&self, capability: &str) -> bool {
        let matches = |name: &String| name.eq_ignore_ascii_case(capability);
        self.subagents_invoked.iter().any(matches)
            || self.subagent_results.iter().any(matches)
            || self.tool_uses.iter().any(matches)
    }

    /// Fold a later session of the same attempt into this one.
    pub fn merge(&mut self, later: SessionLog) {
        self.tool_uses.extend(later.tool_uses);
        self.subagents_invoked.extend(later.subagents_invoked);
        self.subagent_results.extend(later.subagent_results);
        self.progress.extend(later.progress);
        if later.result_text.is_some() {
            self.result_text = later.result_text;
            self.result_is_error = later.result_is_error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evidence_from_subagent_invocation() {
        let mut log = SessionLog::default();
        log.record_tool_use("Task", &json!({"subagent_type": "Code-Reviewer"}));
        assert!(log.has_evidence_of("code-reviewer"));
        assert!(log.has_evidence_of("Task"));
        assert!(!log.has_evidence_of("security-auditor"));
    }

    #[test]
    fn test_evidence_from_skill_input() {
        let mut log = SessionLog::default();
        log.record_tool_use("Skill", &json!({"skill": "db-migrations"}));
        assert!(log.has_evidence_of("db-migrations"));
    }

    #[test]
    fn test_merge_keeps_order_and_latest_result() {
        let mut first = SessionLog {
            tool_uses: vec!["Read".into()],
            result_text: Some("partial".into()),
            ..Default::default()
        };
        let second = SessionLog {
            tool_uses: vec!["Edit".into()],
            progress: vec!["half done".into()],
            ..Default::default()
        };
        first.merge(second);
        assert_eq!(first.tool_uses, vec!["Read", "Edit"]);
        assert_eq!(first.result_text.as_deref(), Some("partial"));

        first.merge(SessionLog {
            result_text: Some("final".into()),
            result_is_error: true,
            ..Default::default()
        });
        assert_eq!(first.result_text.as_deref(), Some("final"));
        assert!(first.result_is_error);
    }
}
