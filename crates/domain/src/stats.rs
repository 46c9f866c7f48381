//! Per-turn resource accounting shared by agents, the runner, and the
//! block store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Token counters for one completed block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Resource accounting for one completed turn (block).
///
/// Produced by the agent-side accumulator for normal turns and by the
/// runner's per-session accumulator for geek/evolution turns. Snapshots
/// are always by-value copies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub total_duration_ms: u64,
    pub thinking_duration_ms: u64,
    pub tool_duration_ms: u64,
    pub generation_duration_ms: u64,
    #[serde(default)]
    pub tokens: TokenUsage,
    pub tool_call_count: u64,
    /// Deduplicated, ordered for stable serialisation.
    #[serde(default)]
    pub tool_names: BTreeSet<String>,
    pub files_touched: u64,
    #[serde(default)]
    pub file_paths: Vec<String>,
    pub cost_usd: f64,
    pub cost_milli_cents: i64,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub had_error: bool,
    #[serde(default)]
    pub error_message: String,
}
