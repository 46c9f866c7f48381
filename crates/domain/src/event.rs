//! The event stream produced to callers.
//!
//! Every turn yields an ordered sequence of `(type, data)` pairs. `data`
//! is JSON-serialised when structured. Unknown types pass through
//! unchanged — consumers must not reject them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// Well-known event types.
pub const EVENT_PLAN: &str = "plan";
pub const EVENT_TASK_START: &str = "task_start";
pub const EVENT_TASK_END: &str = "task_end";
pub const EVENT_PHASE_CHANGE: &str = "phase_change";
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_THINKING: &str = "thinking";
pub const EVENT_TOOL_USE: &str = "tool_use";
pub const EVENT_TOOL_RESULT: &str = "tool_result";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_SESSION_STATS: &str = "session_stats";
pub const EVENT_DANGER_BLOCK: &str = "danger_block";

/// One event as dispatched to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: String,
}

impl AgentEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    /// Build an event whose data is the JSON serialisation of `value`.
    pub fn json(event_type: impl Into<String>, value: &impl Serialize) -> Self {
        Self {
            event_type: event_type.into(),
            data: serde_json::to_string(value).unwrap_or_default(),
        }
    }
}

/// One event as persisted on a block's `event_stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: String,
    pub at_ms: i64,
}

impl StoredEvent {
    pub fn from_event(event: &AgentEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            data: event.data.clone(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Extract the answer text from an `answer` event's data. Agent events
/// carry `{"content": …}`; runner events nest it under
/// `{"data": {"content": …}, "meta": …}`.
pub fn answer_text(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    let content = value
        .get("content")
        .or_else(|| value.pointer("/data/content"))?;
    content.as_str().map(str::to_string)
}

/// Synchronous event sink. Slow consumers slow the event source
/// (backpressure); dispatch order is the caller-observed order.
pub type EventCallback = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// A callback that discards everything. Useful for tests and fire-and-forget
/// internal calls.
pub fn null_callback() -> EventCallback {
    Arc::new(|_event| {})
}
