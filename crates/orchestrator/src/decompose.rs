//! Task decomposition: one LLM call producing a [`TaskPlan`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use av_domain::llm::{strip_code_fences, LlmProvider, Message};
use av_domain::{Error, Result};
use av_parrots::Cognition;

use crate::plan::TaskPlan;

pub struct Decomposer {
    provider: Arc<dyn LlmProvider>,
    timeout_ms: u64,
}

impl Decomposer {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout_ms: u64) -> Self {
        Self {
            provider,
            timeout_ms,
        }
    }

    /// Decompose a request into a validated plan. Any failure here aborts
    /// the whole orchestration.
    pub async fn decompose(
        &self,
        cancel: &CancellationToken,
        input: &str,
        experts: &[Cognition],
    ) -> Result<TaskPlan> {
        let listing: String = experts
            .iter()
            .map(|c| format!("- {}: {}\n", c.name, c.description))
            .collect();

        let messages = vec![
            Message::system(format!(
                "Decompose the user request into tasks for these specialist agents:\n\
                 {listing}\n\
                 Answer with JSON only:\n\
                 {{\"analysis\": \"<short reasoning>\",\n  \"tasks\": [{{\"id\": \"a\", \"agent\": \"<name>\", \
                 \"purpose\": \"<why>\", \"input\": \"<instruction>\", \"deps\": []}}],\n  \
                 \"parallel\": true, \"aggregate\": true}}\n\
                 A task may reference a dependency's result as {{{{dep_id}}}} inside its input. \
                 Dependencies must not form cycles."
            )),
            Message::user(input.to_string()),
        ];

        let timeout = Duration::from_millis(self.timeout_ms);
        let (text, _stats) = tokio::time::timeout(timeout, self.provider.chat(cancel, &messages))
            .await
            .map_err(|_| Error::Timeout(format!("decomposition timed out after {}ms", self.timeout_ms)))?
            .map_err(|e| Error::Decomposition(format!("decomposition call failed: {e}")))?;

        let plan: TaskPlan = serde_json::from_str(strip_code_fences(&text))
            .map_err(|e| Error::Decomposition(format!("unparseable plan: {e}")))?;

        // Unknown agents are a decomposition error, caught before any
        // execution starts.
        for task in &plan.tasks {
            if !experts.iter().any(|c| c.name == task.agent) {
                return Err(Error::Decomposition(format!(
                    "task '{}' targets unknown agent '{}'",
                    task.id, task.agent
                )));
            }
        }

        plan.validate()?;
        Ok(plan)
    }
}
