//! Context budget estimation for worker sessions.
//!
//! The worker's own token accounting is not observable while it runs, so the
//! estimate is built from what the session can see: file contents returned by
//! reads, other tool output, the injected prompt, and a raw tool-call count.

use serde::{Deserialize, Serialize};

/// Approximate characters per token.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Multiplier (in tenths) for reasoning overhead the stream never shows: 1.3x.
pub const OVERHEAD_TENTHS: u64 = 13;

/// Context window assumed when the worker does not report one.
pub const DEFAULT_WINDOW_TOKENS: u64 = 200_000;

/// Usage percentage at which a restart is advised. 100 disables the check.
pub const DEFAULT_CONTEXT_THRESHOLD: f64 = 80.0;

/// Tool calls after which a restart is advised. 0 disables the check.
pub const DEFAULT_TOOL_CALL_THRESHOLD: u32 = 100;

/// Why the estimator advised a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartReason {
    ContextThreshold,
    ToolCallFallback,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::ContextThreshold => "context-threshold",
            RestartReason::ToolCallFallback => "tool-call-fallback",
        }
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running estimate of one worker session's context consumption.
#[derive(Debug, Clone)]
pub struct ContextEstimate {
    file_tokens: u64,
    tool_output_tokens: u64,
    prompt_tokens: u64,
    tool_call_count: u32,
    window_tokens: u64,
    default_window_tokens: u64,
    context_threshold: f64,
    tool_call_threshold: u32,
}

impl ContextEstimate {
    pub fn new(window_tokens: u64, context_threshold: f64, tool_call_threshold: u32) -> Self {
        Self {
            file_tokens: 0,
            tool_output_tokens: 0,
            prompt_tokens: 0,
            tool_call_count: 0,
            window_tokens,
            default_window_tokens: window_tokens,
            context_threshold,
            tool_call_threshold,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_WINDOW_TOKENS,
            DEFAULT_CONTEXT_THRESHOLD,
            DEFAULT_TOOL_CALL_THRESHOLD,
        )
    }

    /// Approximate token count for a piece of text.
    pub fn estimate_tokens(text: &str) -> u64 {
        text.chars().count() as u64 / CHARS_PER_TOKEN
    }

    /// Clear all counters. Called at the start of every attempt and restart.
    pub fn reset(&mut self) {
        self.file_tokens = 0;
        self.tool_output_tokens = 0;
        self.prompt_tokens = 0;
        self.tool_call_count = 0;
        self.window_tokens = self.default_window_tokens;
    }

    /// Adopt the window size the worker reported.
    ///
    /// Only honored before anything has been counted, so usage never moves
    /// backwards within a session. Returns whether the window was applied.
    pub fn set_window(&mut self, window_tokens: u64) -> bool {
        if window_tokens == 0 || self.raw_tokens() > 0 || self.tool_call_count > 0 {
            return false;
        }
        self.window_tokens = window_tokens;
        true
    }

    pub fn record_file_read(&mut self, content: &str) {
        self.file_tokens += Self::estimate_tokens(content);
    }

    pub fn record_tool_output(&mut self, content: &str) {
        self.tool_output_tokens += Self::estimate_tokens(content);
    }

    pub fn record_prompt(&mut self, text: &str) {
        self.prompt_tokens += Self::estimate_tokens(text);
    }

    pub fn record_tool_call(&mut self) {
        self.tool_call_count += 1;
    }

    fn raw_tokens(&self) -> u64 {
        self.file_tokens + self.tool_output_tokens + self.prompt_tokens
    }

    /// Observed tokens with the overhead multiplier applied.
    pub fn total_estimated(&self) -> u64 {
        self.raw_tokens() * OVERHEAD_TENTHS / 10
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.window_tokens == 0 {
            return 100.0;
        }
        self.total_estimated() as f64 * 100.0 / self.window_tokens as f64
    }

    /// Why a restart is advised, if it is.
    pub fn restart_reason(&self) -> Option<RestartReason> {
        if self.context_threshold < 100.0 && self.usage_percentage() >= self.context_threshold {
            return Some(RestartReason::ContextThreshold);
        }
        if self.tool_call_threshold > 0 && self.tool_call_count >= self.tool_call_threshold {
            return Some(RestartReason::ToolCallFallback);
        }
        None
    }

    pub fn should_restart(&self) -> bool {
        self.restart_reason().is_some()
    }

    pub fn file_tokens(&self) -> u64 {
        self.file_tokens
    }

    pub fn tool_output_tokens(&self) -> u64 {
        self.tool_output_tokens
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn tool_call_count(&self) -> u32 {
        self.tool_call_count
    }

    pub fn window_tokens(&self) -> u64 {
        self.window_tokens
    }

    /// Get a status summary for display.
    pub fn status_summary(&self) -> String {
        format!(
            "Context: {:.1}% of {} tokens (~{} estimated), {} tool calls",
            self.usage_percentage(),
            self.window_tokens,
            self.total_estimated(),
            self.tool_call_count
        )
    }
}

impl Default for ContextEstimate {
    fn default() -> Self {
        Self::with_defaults()
    }
}
