//! Per-session running stats accumulator.

use parking_lot::Mutex;

use av_domain::pricing::usd_to_milli_cents;
use av_domain::stats::{SessionStats, TokenUsage};

use crate::protocol::{ResultPayload, SubprocessEvent};

/// Accumulates stats across one session's turns. `snapshot()` returns a
/// by-value copy; nothing mutable is ever shared out.
#[derive(Default)]
pub struct SessionAccumulator {
    inner: Mutex<SessionStats>,
}

impl SessionAccumulator {
    pub fn new() -> Self {
        let stats = SessionStats {
            started_at_ms: av_domain::now_ms(),
            ..SessionStats::default()
        };
        Self {
            inner: Mutex::new(stats),
        }
    }

    /// Fold one parsed stdout event into the running stats.
    pub fn record_event(&self, event: &SubprocessEvent) {
        match event {
            SubprocessEvent::ToolUse { name, .. } => {
                let mut stats = self.inner.lock();
                stats.tool_call_count += 1;
                if !name.is_empty() {
                    stats.tool_names.insert(name.clone());
                }
            }
            SubprocessEvent::Result(payload) => self.apply_result(payload),
            _ => {}
        }
    }

    /// Fold the terminal `result` message: authoritative tokens, durations
    /// and cost for the turn.
    pub fn apply_result(&self, payload: &ResultPayload) {
        let mut stats = self.inner.lock();

        stats.tokens = TokenUsage {
            input_tokens: stats.tokens.input_tokens + payload.input_tokens,
            output_tokens: stats.tokens.output_tokens + payload.output_tokens,
            cache_read_tokens: stats.tokens.cache_read_tokens + payload.cache_read_tokens,
            cache_write_tokens: stats.tokens.cache_write_tokens + payload.cache_write_tokens,
        };
        stats.total_duration_ms += payload.duration_ms;
        stats.thinking_duration_ms += payload.thinking_ms;
        stats.tool_duration_ms += payload.tool_ms;
        stats.generation_duration_ms += payload.generation_ms;

        for tool in &payload.tools_used {
            stats.tool_names.insert(tool.clone());
        }
        for path in &payload.files_touched {
            if !stats.file_paths.contains(path) {
                stats.file_paths.push(path.clone());
            }
        }
        stats.files_touched = stats.file_paths.len() as u64;

        stats.cost_usd += payload.total_cost_usd;
        stats.cost_milli_cents += usd_to_milli_cents(payload.total_cost_usd);

        if let Some(model) = &payload.model {
            stats.model_name = model.clone();
        }
        if payload.is_error {
            stats.had_error = true;
            stats.error_message = payload.error.clone().unwrap_or_default();
        }
        stats.ended_at_ms = av_domain::now_ms();
    }

    pub fn note_error(&self, message: &str) {
        let mut stats = self.inner.lock();
        stats.had_error = true;
        stats.error_message = message.to_string();
        stats.ended_at_ms = av_domain::now_ms();
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> SessionStats {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_events_count_and_dedup() {
        let acc = SessionAccumulator::new();
        for name in ["exec", "write_file", "exec"] {
            acc.record_event(&SubprocessEvent::ToolUse {
                name: name.into(),
                input: serde_json::Value::Null,
            });
        }
        let stats = acc.snapshot();
        assert_eq!(stats.tool_call_count, 3);
        assert_eq!(stats.tool_names.len(), 2);
    }

    #[test]
    fn result_payload_accumulates_across_turns() {
        let acc = SessionAccumulator::new();
        let turn = ResultPayload {
            total_cost_usd: 0.05,
            input_tokens: 1000,
            output_tokens: 200,
            duration_ms: 1500,
            tools_used: vec!["exec".into()],
            files_touched: vec!["a.rs".into()],
            model: Some("cli-agent".into()),
            ..ResultPayload::default()
        };
        acc.apply_result(&turn);
        acc.apply_result(&turn);

        let stats = acc.snapshot();
        assert_eq!(stats.tokens.input_tokens, 2000);
        assert_eq!(stats.tokens.output_tokens, 400);
        assert_eq!(stats.total_duration_ms, 3000);
        assert_eq!(stats.cost_milli_cents, 10_000); // 2 * $0.05
        assert!((stats.cost_usd - 0.10).abs() < 1e-9);
        // File paths dedup; model sticks.
        assert_eq!(stats.files_touched, 1);
        assert_eq!(stats.model_name, "cli-agent");
    }

    #[test]
    fn snapshot_is_a_copy() {
        let acc = SessionAccumulator::new();
        let before = acc.snapshot();
        acc.record_event(&SubprocessEvent::ToolUse {
            name: "exec".into(),
            input: serde_json::Value::Null,
        });
        assert_eq!(before.tool_call_count, 0);
        assert_eq!(acc.snapshot().tool_call_count, 1);
    }

    #[test]
    fn error_result_sets_flag() {
        let acc = SessionAccumulator::new();
        acc.apply_result(&ResultPayload {
            is_error: true,
            error: Some("sandbox violation".into()),
            ..ResultPayload::default()
        });
        let stats = acc.snapshot();
        assert!(stats.had_error);
        assert_eq!(stats.error_message, "sandbox violation");
    }
}
