//! The orchestrator: decompose → schedule → aggregate.

use std::sync::Arc;
use std::time::Duration;

use av_domain::config::OrchestratorConfig;
use av_domain::event::{AgentEvent, EVENT_PLAN};
use av_domain::llm::LlmCallStats;
use av_domain::{Error, EventCallback, Result, TraceEvent, TurnContext};
use av_parrots::ExpertRegistry;

use crate::aggregate::{concatenate_results, Aggregator};
use crate::decompose::Decomposer;
use crate::dispatch::EventDispatcher;
use crate::plan::{TaskPlan, TaskStatus};
use crate::scheduler::{HandoffHandler, Scheduler, TaskError};

/// Usage of the synthesis call, surfaced so the turn's accounting can
/// include it alongside the per-agent contributions.
#[derive(Debug, Clone)]
pub struct AggregationUsage {
    pub model: String,
    pub stats: LlmCallStats,
}

/// The outcome of one orchestration run.
#[derive(Debug)]
pub struct ExecutionResult {
    pub plan: TaskPlan,
    pub final_response: String,
    pub is_aggregated: bool,
    pub errors: Vec<TaskError>,
    /// Present when a synthesis call produced `final_response`.
    pub aggregation: Option<AggregationUsage>,
}

pub struct Orchestrator {
    decomposer: Decomposer,
    scheduler: Scheduler,
    aggregator: Aggregator,
    registry: Arc<ExpertRegistry>,
    config: OrchestratorConfig,
    /// Drain ceiling applied when closing the event dispatcher.
    dispatcher_drain_ms: u64,
}

impl Orchestrator {
    pub fn new(
        decomposer: Decomposer,
        aggregator: Aggregator,
        registry: Arc<ExpertRegistry>,
        handoff: Option<Arc<dyn HandoffHandler>>,
        config: OrchestratorConfig,
        dispatcher_drain_ms: u64,
    ) -> Self {
        Self {
            decomposer,
            scheduler: Scheduler::new(registry.clone(), handoff, config.clone()),
            aggregator,
            registry,
            config,
            dispatcher_drain_ms,
        }
    }

    /// Run one orchestration under the configured total deadline.
    pub async fn run(
        &self,
        ctx: &TurnContext,
        input: &str,
        callback: EventCallback,
    ) -> Result<ExecutionResult> {
        let deadline = Duration::from_millis(self.config.max_total_ms);
        tokio::time::timeout(deadline, self.run_inner(ctx, input, callback))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "orchestration exceeded {}ms",
                    self.config.max_total_ms
                ))
            })?
    }

    async fn run_inner(
        &self,
        ctx: &TurnContext,
        input: &str,
        callback: EventCallback,
    ) -> Result<ExecutionResult> {
        let dispatcher = EventDispatcher::new(callback);
        let sink = dispatcher.sink();
        let drain = Duration::from_millis(self.dispatcher_drain_ms);

        // Decomposition failure aborts the whole run.
        let experts = self.registry.cognitions();
        let mut plan = match self.decomposer.decompose(&ctx.cancel, input, &experts).await {
            Ok(plan) => plan,
            Err(err) => {
                drop(sink);
                dispatcher.close(drain).await;
                return Err(err);
            }
        };

        TraceEvent::PlanAccepted {
            trace_id: ctx.trace_id.clone(),
            task_count: plan.tasks.len(),
            parallel: plan.parallel,
            aggregate: plan.aggregate,
        }
        .emit();
        sink(AgentEvent::json(EVENT_PLAN, &plan));

        let errors = self.scheduler.run(ctx, &mut plan, &sink).await;

        let completed: Vec<&str> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed && !t.result.is_empty())
            .map(|t| t.result.as_str())
            .collect();

        // A single completed task bypasses aggregation entirely.
        let mut aggregation = None;
        let (final_response, is_aggregated) = match completed.as_slice() {
            [] => (String::new(), false),
            [only] => (only.to_string(), false),
            _ if plan.aggregate => {
                match self.aggregator.aggregate(&ctx.cancel, input, &plan.tasks).await {
                    Ok((text, stats)) => {
                        aggregation = Some(AggregationUsage {
                            model: self.aggregator.model_name().to_string(),
                            stats,
                        });
                        (text, true)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "aggregation failed; concatenating results");
                        (concatenate_results(&plan.tasks), false)
                    }
                }
            }
            _ => (concatenate_results(&plan.tasks), false),
        };

        // The dispatcher only drains once every sink clone is gone.
        drop(sink);
        dispatcher.close(drain).await;

        Ok(ExecutionResult {
            plan,
            final_response,
            is_aggregated,
            errors,
            aggregation,
        })
    }
}
