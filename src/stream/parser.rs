//! Stateful stream-json parser.
//!
//! Turns raw protocol lines into `SessionEvent`s and keeps the bookkeeping
//! needed across lines: which tool-use ids belong to sub-agents, which tool
//! produced each result, and which sub-agent is currently active.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use super::usage::TokenStats;
use super::{
    ContentBlock, KNOWN_EVENT_TYPES, StreamEvent, ToolResultContent, UserBlock, UserContent,
};

/// A protocol line that could not be turned into events.
#[derive(Debug, Error)]
pub enum StreamLineError {
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("event has no \"type\" field")]
    MissingType,

    #[error("unrecognized event type '{0}'")]
    Unrecognized(String),

    #[error("invalid '{kind}' event: {source}")]
    InvalidShape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A decoded, attributed event from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Init {
        session_id: Option<String>,
        model: Option<String>,
        context_window: Option<u64>,
    },
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Name of the tool that produced this result, when its tool use was seen
        tool_name: Option<String>,
        content: String,
        is_error: bool,
        /// Sub-agent this result came back from (list-shaped results only)
        subagent: Option<String>,
    },
    SubagentChanged(Option<String>),
    Usage {
        stats: TokenStats,
        /// True for the `result` event's authoritative totals
        is_final: bool,
    },
    Finished {
        subtype: String,
        is_error: bool,
        result: Option<String>,
    },
}

#[derive(Debug, Default)]
pub struct StreamParser {
    /// Pending sub-agent tool-use ids, in spawn order, with their agent type
    pending_subagents: Vec<(String, String)>,
    tool_names: HashMap<String, String>,
    active_subagent: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one protocol line. Blank lines yield no events.
    pub fn parse_line(&mut self, line: &str) -> Result<Vec<SessionEvent>, StreamLineError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_str(line).map_err(StreamLineError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(StreamLineError::MissingType)?
            .to_string();
        if !KNOWN_EVENT_TYPES.contains(&kind.as_str()) {
            return Err(StreamLineError::Unrecognized(kind));
        }

        let event: StreamEvent = serde_json::from_value(value)
            .map_err(|source| StreamLineError::InvalidShape { kind, source })?;
        Ok(self.handle(event))
    }

    /// Convert a typed protocol event into session events.
    pub fn handle(&mut self, event: StreamEvent) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        match event {
            StreamEvent::System {
                subtype,
                session_id,
                model,
                context_window,
            } => {
                if subtype == "init" {
                    out.push(SessionEvent::Init {
                        session_id,
                        model,
                        context_window,
                    });
                }
            }
            StreamEvent::Assistant { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => out.push(SessionEvent::Text(text)),
                        ContentBlock::ToolUse { id, name, input } => {
                            self.tool_names.insert(id.clone(), name.clone());
                            if let Some(agent) =
                                input.get("subagent_type").and_then(|v| v.as_str())
                            {
                                self.pending_subagents.push((id.clone(), agent.to_string()));
                                self.set_active(Some(agent.to_string()), &mut out);
                            }
                            out.push(SessionEvent::ToolUse { id, name, input });
                        }
                        ContentBlock::Other => {}
                    }
                }
                if let Some(usage) = message.usage {
                    out.push(SessionEvent::Usage {
                        stats: TokenStats::from_usage(&usage, None),
                        is_final: false,
                    });
                }
            }
            StreamEvent::User { message } => {
                let UserContent::Blocks(blocks) = message.content else {
                    return out;
                };
                for block in blocks {
                    if let UserBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        self.handle_tool_result(tool_use_id, content, is_error, &mut out);
                    }
                }
            }
            StreamEvent::Result {
                subtype,
                is_error,
                result,
                usage,
                total_cost_usd,
            } => {
                if let Some(usage) = usage {
                    out.push(SessionEvent::Usage {
                        stats: TokenStats::from_usage(&usage, total_cost_usd),
                        is_final: true,
                    });
                }
                out.push(SessionEvent::Finished {
                    subtype,
                    is_error,
                    result,
                });
            }
        }
        out
    }

    fn handle_tool_result(
        &mut self,
        tool_use_id: String,
        content: ToolResultContent,
        is_error: bool,
        out: &mut Vec<SessionEvent>,
    ) {
        let tool_name = self.tool_names.remove(&tool_use_id);
        let (content, subagent) = match content {
            ToolResultContent::Text(text) => (text, None),
            ToolResultContent::Blocks(parts) => {
                let text = parts
                    .iter()
                    .filter(|p| p.kind == "text")
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let subagent = self
                    .pending_subagents
                    .iter()
                    .position(|(id, _)| *id == tool_use_id)
                    .map(|pos| self.pending_subagents.remove(pos).1);
                (text, subagent)
            }
        };

        out.push(SessionEvent::ToolResult {
            tool_use_id,
            tool_name,
            content,
            is_error,
            subagent: subagent.clone(),
        });

        if subagent.is_some() {
            let next = self.pending_subagents.last().map(|(_, agent)| agent.clone());
            self.set_active(next, out);
        }
    }

    fn set_active(&mut self, agent: Option<String>, out: &mut Vec<SessionEvent>) {
        if self.active_subagent != agent {
            self.active_subagent = agent.clone();
            out.push(SessionEvent::SubagentChanged(agent));
        }
    }

    /// Whether a tool-use id is still awaiting its sub-agent result.
    pub fn is_pending_subagent(&self, tool_use_id: &str) -> bool {
        self.pending_subagents.iter().any(|(id, _)| id == tool_use_id)
    }

    pub fn pending_subagent_count(&self) -> usize {
        self.pending_subagents.len()
    }

    pub fn active_subagent(&self) -> Option<&str> {
        self.active_subagent.as_deref()
    }
}

/// Extract the message from a shell command that invokes the progress command.
///
/// `marker` is the progress command prefix (e.g. `conductor progress`). The
/// message is the quoted argument after it, or the rest of the command up to
/// the next `&&`, `;` or newline when unquoted.
pub fn extract_progress_message(command: &str, marker: &str) -> Option<String> {
    let start = command.find(marker)? + marker.len();
    let rest = command[start..].trim_start();

    let message = match rest.chars().next()? {
        quote @ ('"' | '\'') => {
            let body = &rest[1..];
            let end = body.find(quote)?;
            &body[..end]
        }
        _ => {
            let end = ["&&", ";", "\n", "|"]
                .iter()
                .filter_map(|sep| rest.find(sep))
                .min()
                .unwrap_or(rest.len());
            &rest[..end]
        }
    };

    let message = message.trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_USE: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"task-1","name":"Task","input":{"subagent_type":"code-reviewer","prompt":"review"}}]}}"#;

    fn events(parser: &mut StreamParser, line: &str) -> Vec<SessionEvent> {
        parser.parse_line(line).unwrap()
    }

    #[test]
    fn test_init_event() {
        let mut parser = StreamParser::new();
        let out = events(
            &mut parser,
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"m1","context_window":1000}"#,
        );
        assert_eq!(
            out,
            vec![SessionEvent::Init {
                session_id: Some("abc".into()),
                model: Some("m1".into()),
                context_window: Some(1000),
            }]
        );
    }

    #[test]
    fn test_task_result_attributed_to_pending_subagent() {
        let mut parser = StreamParser::new();
        let out = events(&mut parser, TASK_USE);
        assert_eq!(
            out[0],
            SessionEvent::SubagentChanged(Some("code-reviewer".into()))
        );
        assert!(parser.is_pending_subagent("task-1"));

        let out = events(
            &mut parser,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"task-1","content":[{"type":"text","text":"looks good"},{"type":"text","text":"ship it"}]}]}}"#,
        );
        match &out[0] {
            SessionEvent::ToolResult {
                subagent,
                content,
                tool_name,
                ..
            } => {
                assert_eq!(subagent.as_deref(), Some("code-reviewer"));
                assert_eq!(content, "looks good\nship it");
                assert_eq!(tool_name.as_deref(), Some("Task"));
            }
            other => panic!("Expected ToolResult, got {:?}", other),
        }
        assert_eq!(out[1], SessionEvent::SubagentChanged(None));
        assert!(!parser.is_pending_subagent("task-1"));
        assert_eq!(parser.pending_subagent_count(), 0);
    }

    #[test]
    fn test_string_result_never_attributed() {
        let mut parser = StreamParser::new();
        events(&mut parser, TASK_USE);

        let out = events(
            &mut parser,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"task-1","content":"plain string","is_error":false}]}}"#,
        );
        match &out[0] {
            SessionEvent::ToolResult { subagent, .. } => assert!(subagent.is_none()),
            other => panic!("Expected ToolResult, got {:?}", other),
        }
        assert_eq!(out.len(), 1);
        assert!(parser.is_pending_subagent("task-1"));
        assert_eq!(parser.active_subagent(), Some("code-reviewer"));
    }

    #[test]
    fn test_nested_subagents_restore_previous_active() {
        let mut parser = StreamParser::new();
        events(&mut parser, TASK_USE);
        events(
            &mut parser,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"task-2","name":"Task","input":{"subagent_type":"tester"}}]}}"#,
        );
        assert_eq!(parser.active_subagent(), Some("tester"));

        let out = events(
            &mut parser,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"task-2","content":[{"type":"text","text":"ok"}]}]}}"#,
        );
        assert_eq!(
            out.last(),
            Some(&SessionEvent::SubagentChanged(Some("code-reviewer".into())))
        );
    }

    #[test]
    fn test_read_result_carries_tool_name() {
        let mut parser = StreamParser::new();
        events(
            &mut parser,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"r1","name":"Read","input":{"file_path":"/a.rs"}}]}}"#,
        );
        let out = events(
            &mut parser,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"r1","content":"fn main() {}"}]}}"#,
        );
        assert!(matches!(
            &out[0],
            SessionEvent::ToolResult { tool_name: Some(n), .. } if n == "Read"
        ));
    }

    #[test]
    fn test_result_event_emits_final_usage() {
        let mut parser = StreamParser::new();
        let out = events(
            &mut parser,
            r#"{"type":"result","subtype":"success","is_error":false,"usage":{"input_tokens":7,"output_tokens":3},"total_cost_usd":0.01}"#,
        );
        match &out[0] {
            SessionEvent::Usage { stats, is_final } => {
                assert!(*is_final);
                assert_eq!(stats.input_tokens, 7);
                assert!((stats.cost_usd - 0.01).abs() < f64::EPSILON);
            }
            other => panic!("Expected Usage, got {:?}", other),
        }
        assert!(matches!(&out[1], SessionEvent::Finished { subtype, .. } if subtype == "success"));
    }

    #[test]
    fn test_assistant_usage_is_not_final() {
        let mut parser = StreamParser::new();
        let out = events(
            &mut parser,
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":5}}}"#,
        );
        assert!(matches!(&out[0], SessionEvent::Usage { is_final: false, .. }));
    }

    #[test]
    fn test_malformed_lines_are_errors_not_panics() {
        let mut parser = StreamParser::new();
        assert!(matches!(
            parser.parse_line("not json"),
            Err(StreamLineError::Malformed(_))
        ));
        assert!(matches!(
            parser.parse_line(r#"{"message":{}}"#),
            Err(StreamLineError::MissingType)
        ));
        assert!(matches!(
            parser.parse_line(r#"{"type":"rate_limit"}"#),
            Err(StreamLineError::Unrecognized(t)) if t == "rate_limit"
        ));
        assert!(matches!(
            parser.parse_line(r#"{"type":"assistant"}"#),
            Err(StreamLineError::InvalidShape { .. })
        ));
        assert!(parser.parse_line("   ").unwrap().is_empty());
    }

    #[test]
    fn test_extract_progress_message() {
        let marker = "conductor progress";
        assert_eq!(
            extract_progress_message(r#"conductor progress "schema migrated""#, marker).as_deref(),
            Some("schema migrated")
        );
        assert_eq!(
            extract_progress_message("cd api && conductor progress 'tests green' && ls", marker)
                .as_deref(),
            Some("tests green")
        );
        assert_eq!(
            extract_progress_message("conductor progress halfway done; echo hi", marker)
                .as_deref(),
            Some("halfway done")
        );
        assert!(extract_progress_message("cargo test", marker).is_none());
        assert!(extract_progress_message("conductor progress \"\"", marker).is_none());
    }
}
