//! Last-resort LLM classification.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use av_domain::llm::{strip_code_fences, LlmProvider, Message};
use av_domain::{Error, Result};

/// The classifier's verdict.
#[derive(Debug, Clone)]
pub struct LlmDecision {
    pub route: Option<String>,
    pub confidence: f64,
    pub needs_orchestration: bool,
}

/// An agent the classifier may pick from.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub name: String,
    pub description: String,
}

pub struct LlmClassifier {
    provider: Arc<dyn LlmProvider>,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct RawDecision {
    #[serde(default)]
    route: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    orchestrate: bool,
}

impl LlmClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout_ms: u64) -> Self {
        Self {
            provider,
            timeout_ms,
        }
    }

    /// Ask the model to pick an agent (or orchestration) for the input.
    pub async fn classify(
        &self,
        cancel: &CancellationToken,
        input: &str,
        candidates: &[RouteCandidate],
    ) -> Result<LlmDecision> {
        let listing: String = candidates
            .iter()
            .map(|c| format!("- {}: {}\n", c.name, c.description))
            .collect();

        let messages = vec![
            Message::system(format!(
                "You route user requests to specialist agents.\n\
                 Agents:\n{listing}\
                 Answer with JSON only: \
                 {{\"route\": \"<agent name or null>\", \"confidence\": 0.0, \"orchestrate\": false}}. \
                 Set orchestrate=true when the request needs several agents or none fits."
            )),
            Message::user(input.to_string()),
        ];

        let timeout = Duration::from_millis(self.timeout_ms);
        let (text, _stats) = tokio::time::timeout(timeout, self.provider.chat(cancel, &messages))
            .await
            .map_err(|_| Error::Timeout(format!("classifier timed out after {}ms", self.timeout_ms)))??;

        let raw: RawDecision = serde_json::from_str(strip_code_fences(&text))
            .map_err(|e| Error::Routing(format!("unparseable classifier answer: {e}")))?;

        // A route the registry does not know falls back to orchestration.
        let route = raw
            .route
            .filter(|r| !r.is_empty() && candidates.iter().any(|c| &c.name == r));

        Ok(LlmDecision {
            needs_orchestration: raw.orchestrate || route.is_none(),
            route,
            confidence: raw.confidence.clamp(0.0, 1.0),
        })
    }
}
