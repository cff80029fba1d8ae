//! Token and cost accounting.

use serde::{Deserialize, Serialize};

use super::Usage;

/// Token counts and cost for one usage report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
}

impl TokenStats {
    pub fn from_usage(usage: &Usage, cost_usd: Option<f64>) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cost_usd: cost_usd.unwrap_or(0.0),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn add(&mut self, other: &TokenStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Two explicit views of token usage.
///
/// `session` is overwritten by every usage report of the active worker
/// session. `run_total` only grows, and only from final (`result`) reports, so
/// intermediate reports are never double counted.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    session: TokenStats,
    run_total: TokenStats,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intermediate usage report for the active session.
    pub fn update_session(&mut self, stats: TokenStats) {
        self.session = stats;
    }

    /// Record the authoritative totals of a finished session.
    pub fn finalize_session(&mut self, stats: TokenStats) {
        self.run_total.add(&stats);
        self.session = stats;
    }

    /// Clear the session view when a new worker session starts.
    pub fn begin_session(&mut self) {
        self.session = TokenStats::default();
    }

    pub fn session(&self) -> &TokenStats {
        &self.session
    }

    pub fn run_total(&self) -> &TokenStats {
        &self.run_total
    }
}
