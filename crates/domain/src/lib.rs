//! Shared domain types for all Aviary crates.
//!
//! Holds the error taxonomy, the configuration surface, the consumed
//! LLM/embedder/tool contracts, the caller-facing event envelope, the
//! pricing table, per-turn stats, and structured trace events.

pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod pricing;
pub mod stats;
pub mod trace;
pub mod turn;

pub use config::Config;
pub use error::{
    classify, ClassifiedError, DangerBlocked, DangerCategory, DangerLevel, Error, ErrorClass,
    HandoffSuggestion, MissingCapability, ParrotError, Result,
};
pub use event::{AgentEvent, EventCallback, StoredEvent};
pub use llm::{Embedder, LlmCallStats, LlmProvider, Message, Role, ToolExecutor};
pub use pricing::PricingTable;
pub use stats::{SessionStats, TokenUsage};
pub use trace::TraceEvent;
pub use turn::TurnContext;

/// Current time in milliseconds since the epoch. All persisted timestamps
/// use this resolution.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
