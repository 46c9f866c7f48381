//! LLM provider wiring.
//!
//! The concrete provider SDK lives outside this workspace; the binary
//! ships with a stub that satisfies the contract and fails with a clear
//! message until an adapter is plugged in. Rule-routed agents and the
//! runner-backed geek/evolution paths work without it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use av_domain::llm::{BoxStream, LlmCallStats, LlmProvider, LlmStreamEvent, Message};
use av_domain::{Error, Result};

pub fn from_env() -> Arc<dyn LlmProvider> {
    // TODO(provider): plug in the SDK adapter once its crate stabilises;
    // until then classification and decomposition degrade gracefully.
    Arc::new(Unconfigured)
}

struct Unconfigured;

#[async_trait]
impl LlmProvider for Unconfigured {
    async fn chat(
        &self,
        _cancel: &CancellationToken,
        _messages: &[Message],
    ) -> Result<(String, LlmCallStats)> {
        Err(Error::Provider(
            "no LLM provider configured; set up a provider adapter".into(),
        ))
    }

    async fn chat_stream(
        &self,
        _cancel: &CancellationToken,
        _messages: &[Message],
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        Err(Error::Provider(
            "no LLM provider configured; set up a provider adapter".into(),
        ))
    }

    fn model_name(&self) -> &str {
        "unconfigured"
    }
}
