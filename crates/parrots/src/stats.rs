//! The shared turn-stats accumulator.
//!
//! Strictly a statistics aggregator: tokens, durations, tool names, and
//! incremental cost via the pricing table. All mutation happens under one
//! lock; `snapshot()` hands out a by-value copy.

use std::sync::Arc;

use parking_lot::Mutex;

use av_domain::llm::LlmCallStats;
use av_domain::pricing::{milli_cents_to_usd, PricingTable};
use av_domain::stats::{SessionStats, TokenUsage};

pub struct TurnStats {
    pricing: Arc<PricingTable>,
    inner: Mutex<SessionStats>,
}

impl TurnStats {
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        let stats = SessionStats {
            started_at_ms: av_domain::now_ms(),
            ..SessionStats::default()
        };
        Self {
            pricing,
            inner: Mutex::new(stats),
        }
    }

    /// Fold one LLM call: tokens, duration buckets, and incremental cost
    /// from the model's pricing row.
    pub fn track_llm_call(&self, call: &LlmCallStats, model: &str) {
        let cost = self
            .pricing
            .cost_milli_cents(model, call.prompt_tokens, call.completion_tokens);

        let mut stats = self.inner.lock();
        stats.tokens = TokenUsage {
            input_tokens: stats.tokens.input_tokens + call.prompt_tokens,
            output_tokens: stats.tokens.output_tokens + call.completion_tokens,
            cache_read_tokens: stats.tokens.cache_read_tokens + call.cache_read_tokens,
            cache_write_tokens: stats.tokens.cache_write_tokens + call.cache_write_tokens,
        };
        stats.thinking_duration_ms += call.thinking_ms;
        stats.generation_duration_ms += call.generation_ms;
        stats.total_duration_ms += call.total_ms;
        stats.cost_milli_cents += cost;
        stats.cost_usd = milli_cents_to_usd(stats.cost_milli_cents);
        stats.model_name = model.to_string();
    }

    /// Count a tool invocation; tool names are deduplicated.
    pub fn track_tool_call(&self, name: &str) {
        let mut stats = self.inner.lock();
        stats.tool_call_count += 1;
        if !name.is_empty() {
            stats.tool_names.insert(name.to_string());
        }
    }

    pub fn track_tool_duration(&self, ms: u64) {
        self.inner.lock().tool_duration_ms += ms;
    }

    pub fn note_error(&self, message: &str) {
        let mut stats = self.inner.lock();
        stats.had_error = true;
        stats.error_message = message.to_string();
    }

    /// Close the turn: sets the end time and total duration.
    pub fn finalize(&self) {
        let mut stats = self.inner.lock();
        stats.ended_at_ms = av_domain::now_ms();
        let elapsed = (stats.ended_at_ms - stats.started_at_ms).max(0) as u64;
        if stats.total_duration_ms == 0 {
            stats.total_duration_ms = elapsed;
        }
    }

    /// By-value copy; no shared mutable state escapes.
    pub fn snapshot(&self) -> SessionStats {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(prompt: u64, completion: u64) -> LlmCallStats {
        LlmCallStats {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            generation_ms: 120,
            total_ms: 150,
            ..LlmCallStats::default()
        }
    }

    #[test]
    fn llm_calls_accumulate_tokens_and_cost() {
        let stats = TurnStats::new(Arc::new(PricingTable::default()));
        stats.track_llm_call(&call(1_000_000, 0), "deepseek-chat");
        stats.track_llm_call(&call(0, 1_000_000), "deepseek-chat");

        let snap = stats.snapshot();
        assert_eq!(snap.tokens.input_tokens, 1_000_000);
        assert_eq!(snap.tokens.output_tokens, 1_000_000);
        // $0.14 + $0.28 in milli-cents.
        assert_eq!(snap.cost_milli_cents, 42_000);
        assert!((snap.cost_usd - 0.42).abs() < 1e-9);
        assert_eq!(snap.model_name, "deepseek-chat");
    }

    #[test]
    fn total_tokens_equal_sum_of_call_contributions() {
        let stats = TurnStats::new(Arc::new(PricingTable::default()));
        let calls = [(120, 30), (800, 210), (45, 5)];
        for (p, c) in calls {
            stats.track_llm_call(&call(p, c), "gpt-4");
        }
        let snap = stats.snapshot();
        let expected: u64 = calls.iter().map(|(p, c)| p + c).sum();
        assert_eq!(snap.tokens.total(), expected);
    }

    #[test]
    fn tool_calls_count_and_dedup() {
        let stats = TurnStats::new(Arc::new(PricingTable::default()));
        stats.track_tool_call("calendar");
        stats.track_tool_call("calendar");
        stats.track_tool_call("search");

        let snap = stats.snapshot();
        assert_eq!(snap.tool_call_count, 3);
        assert_eq!(snap.tool_names.len(), 2);
    }

    #[test]
    fn finalize_sets_end_time() {
        let stats = TurnStats::new(Arc::new(PricingTable::default()));
        stats.finalize();
        let snap = stats.snapshot();
        assert!(snap.ended_at_ms >= snap.started_at_ms);
    }

    #[test]
    fn snapshot_is_independent() {
        let stats = TurnStats::new(Arc::new(PricingTable::default()));
        let before = stats.snapshot();
        stats.track_tool_call("exec");
        assert_eq!(before.tool_call_count, 0);
    }
}
