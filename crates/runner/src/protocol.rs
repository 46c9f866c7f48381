//! The line-framed JSON protocol spoken by the external CLI agent.
//!
//! Each stdout line is one envelope `{type, …}`. Recognised types are
//! `thinking`, `tool_use`, `tool_result`, `assistant` and the terminal
//! `result`; unknown types are counted but never an error. Stdin accepts
//! one JSON prompt message per turn, newline-terminated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsed events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One parsed stdout envelope.
#[derive(Debug, Clone)]
pub enum SubprocessEvent {
    Thinking { text: String },
    ToolUse { name: String, input: Value },
    ToolResult { content: Value },
    Assistant { text: String },
    Result(ResultPayload),
    Unknown { kind: String, raw: Value },
}

impl SubprocessEvent {
    /// The caller-facing event type string.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Thinking { .. } => av_domain::event::EVENT_THINKING,
            Self::ToolUse { .. } => av_domain::event::EVENT_TOOL_USE,
            Self::ToolResult { .. } => av_domain::event::EVENT_TOOL_RESULT,
            Self::Assistant { .. } => av_domain::event::EVENT_ANSWER,
            Self::Result(_) => av_domain::event::EVENT_SESSION_STATS,
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// The terminal `result` message: final stats for the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub thinking_ms: u64,
    #[serde(default)]
    pub tool_ms: u64,
    #[serde(default)]
    pub generation_ms: u64,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Meta wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Envelope dispatched to the caller: the parsed event plus per-session
/// ordering metadata.
#[derive(Debug, Clone, Serialize)]
pub struct EventWithMeta {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub meta: EventMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub session_id: String,
    pub sequence: u64,
    pub at_ms: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one stdout line. `None` for blank lines; `Err` for lines that are
/// not JSON objects (a framing error).
pub fn parse_line(line: &str) -> av_domain::Result<Option<SubprocessEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| av_domain::Error::Other(format!("bad envelope: {e}: {trimmed}")))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let event = match kind.as_str() {
        "thinking" => SubprocessEvent::Thinking {
            text: text_field(&value),
        },
        "tool_use" => SubprocessEvent::ToolUse {
            name: value
                .get("name")
                .or_else(|| value.pointer("/tool/name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            input: value
                .get("input")
                .cloned()
                .unwrap_or(Value::Null),
        },
        "tool_result" => SubprocessEvent::ToolResult {
            content: value
                .get("content")
                .or_else(|| value.get("output"))
                .cloned()
                .unwrap_or(Value::Null),
        },
        "assistant" => SubprocessEvent::Assistant {
            text: assistant_text(&value),
        },
        "result" => {
            let payload: ResultPayload = serde_json::from_value(value.clone())
                .map_err(|e| av_domain::Error::Other(format!("bad result envelope: {e}")))?;
            SubprocessEvent::Result(payload)
        }
        "" => SubprocessEvent::Unknown {
            kind: "unknown".into(),
            raw: value,
        },
        other => SubprocessEvent::Unknown {
            kind: other.to_string(),
            raw: value,
        },
    };

    Ok(Some(event))
}

fn text_field(value: &Value) -> String {
    value
        .get("text")
        .or_else(|| value.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Extract the answer text from an `assistant` envelope. The nested
/// `message.content` is preferred over a top-level `content` when both are
/// present; content blocks may be a plain string or an array of
/// `{type: "text", text}` blocks.
fn assistant_text(value: &Value) -> String {
    let content = value
        .pointer("/message/content")
        .or_else(|| value.get("content"));

    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    block.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Serialise the event for caller dispatch.
pub fn event_data(event: &SubprocessEvent) -> Value {
    match event {
        SubprocessEvent::Thinking { text } => serde_json::json!({ "text": text }),
        SubprocessEvent::ToolUse { name, input } => {
            serde_json::json!({ "name": name, "input": input })
        }
        SubprocessEvent::ToolResult { content } => serde_json::json!({ "content": content }),
        SubprocessEvent::Assistant { text } => serde_json::json!({ "content": text }),
        SubprocessEvent::Result(payload) => {
            serde_json::to_value(payload).unwrap_or(Value::Null)
        }
        SubprocessEvent::Unknown { raw, .. } => raw.clone(),
    }
}

/// The framed prompt message written to the subprocess stdin.
#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub content: &'a str,
}

impl<'a> PromptMessage<'a> {
    pub fn user(content: &'a str) -> Self {
        Self {
            kind: "user",
            content,
        }
    }
}

/// Sentinel written on stdin to ask the subprocess to exit.
pub const SHUTDOWN_SENTINEL: &str = r#"{"type":"shutdown"}"#;
