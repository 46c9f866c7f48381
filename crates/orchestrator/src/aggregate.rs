//! Multi-task result aggregation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use av_domain::llm::{LlmCallStats, LlmProvider, Message};
use av_domain::{Error, Result};

use crate::plan::{Task, TaskStatus};

/// Literal separator used when results are concatenated instead of
/// synthesised.
pub const RESULT_SEPARATOR: &str = "\n\n---\n\n";

pub struct Aggregator {
    provider: Arc<dyn LlmProvider>,
    timeout_ms: u64,
}

impl Aggregator {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout_ms: u64) -> Self {
        Self {
            provider,
            timeout_ms,
        }
    }

    /// The model answering synthesis calls, for cost attribution.
    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// One synthesis call over the completed tasks' results. The call's
    /// stats are returned so the turn's accounting can include them.
    pub async fn aggregate(
        &self,
        cancel: &CancellationToken,
        user_input: &str,
        tasks: &[Task],
    ) -> Result<(String, LlmCallStats)> {
        let sections: String = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed && !t.result.is_empty())
            .map(|t| format!("## {} ({})\n{}\n\n", t.id, t.purpose, t.result))
            .collect();

        let messages = vec![
            Message::system(
                "Synthesise the task results below into one coherent answer to the \
                 user's request. Do not mention the tasks themselves.",
            ),
            Message::user(format!("Request: {user_input}\n\nTask results:\n{sections}")),
        ];

        let timeout = Duration::from_millis(self.timeout_ms);
        let (text, stats) = tokio::time::timeout(timeout, self.provider.chat(cancel, &messages))
            .await
            .map_err(|_| Error::Timeout(format!("aggregation timed out after {}ms", self.timeout_ms)))??;
        Ok((text, stats))
    }
}

/// Plain concatenation fallback, in task order.
pub fn concatenate_results(tasks: &[Task]) -> String {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed && !t.result.is_empty())
        .map(|t| t.result.as_str())
        .collect::<Vec<_>>()
        .join(RESULT_SEPARATOR)
}
