//! Consumed contracts: the LLM provider, the embedder, and the tool
//! executor. The core is agnostic to which SDK implements them.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A boxed async stream, used for streaming provider responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: text.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call statistics reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmCallStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub thinking_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during a streaming chat call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum LlmStreamEvent {
    #[serde(rename = "token")]
    Token { text: String },

    #[serde(rename = "done")]
    Done { stats: LlmCallStats },

    #[serde(rename = "error")]
    Error { message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The consumed LLM provider contract. Implementations are external SDK
/// adapters; the core only ever calls through this trait.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat request and wait for the full response text plus stats.
    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<(String, LlmCallStats)>;

    /// Send a chat request and stream the response.
    async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>>;

    /// Name of the model this provider instance answers with.
    fn model_name(&self) -> &str;
}

/// The consumed text-embedding contract, used by the router's history
/// matcher. Optional: callers degrade gracefully when absent.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool definition exposed to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Strip a surrounding markdown code fence from a model answer, if any.
/// JSON-answer prompts routinely come back fenced.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Executes named tools on behalf of an agent.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The tools this executor can serve.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Invoke a tool by name with JSON arguments; returns the textual
    /// observation passed back to the model.
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<String>;
}
