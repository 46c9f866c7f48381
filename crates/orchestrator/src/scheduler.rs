//! DAG-layered task execution with bounded handoff.
//!
//! Layers run in dependency order; tasks inside a layer run concurrently.
//! A task whose agent reports a missing capability may be handed off to a
//! different agent, at most `handoff_max_depth` times and never to itself.
//! Per-task failures are recorded and unrelated branches continue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;

use av_domain::config::OrchestratorConfig;
use av_domain::event::{answer_text, AgentEvent, EVENT_ANSWER, EVENT_TASK_END, EVENT_TASK_START};
use av_domain::{
    Error, EventCallback, HandoffSuggestion, MissingCapability, TraceEvent, TurnContext,
};
use av_parrots::ExpertRegistry;

use crate::plan::{substitute_results, Task, TaskPlan, TaskStatus};

/// One failed task, as surfaced in the execution result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskError {
    pub task_id: String,
    pub agent: String,
    pub message: String,
}

/// Proposes a replacement agent for a task that failed with
/// [`MissingCapability`].
pub trait HandoffHandler: Send + Sync {
    fn suggest(
        &self,
        task: &Task,
        missing: &MissingCapability,
        available_agents: &[String],
    ) -> Option<HandoffSuggestion>;
}

pub struct Scheduler {
    registry: Arc<ExpertRegistry>,
    handoff: Option<Arc<dyn HandoffHandler>>,
    config: OrchestratorConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ExpertRegistry>,
        handoff: Option<Arc<dyn HandoffHandler>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            handoff,
            config,
        }
    }

    /// Execute the plan in place. Returns the per-task failures.
    pub async fn run(
        &self,
        ctx: &TurnContext,
        plan: &mut TaskPlan,
        sink: &EventCallback,
    ) -> Vec<TaskError> {
        let layers = match plan.topo_layers() {
            Ok(layers) => layers,
            Err(err) => {
                // The plan was validated at acceptance; a cycle here is a bug.
                tracing::error!(error = %err, "plan became cyclic after acceptance");
                return vec![TaskError {
                    task_id: String::new(),
                    agent: String::new(),
                    message: err.to_string(),
                }];
            }
        };

        let mut results: HashMap<String, String> = HashMap::new();
        let mut errors = Vec::new();

        for layer in layers {
            let mut pending = Vec::new();
            for id in &layer {
                let task = plan.task(id).expect("layered task exists").clone();

                // A failed dependency fails the dependents without
                // touching unrelated branches.
                if let Some(dep) = task.deps.iter().find(|d| !results.contains_key(*d)) {
                    let message = format!("dependency '{dep}' did not complete");
                    if let Some(t) = plan.task_mut(id) {
                        t.status = TaskStatus::Failed;
                        t.error = message.clone();
                    }
                    errors.push(TaskError {
                        task_id: id.clone(),
                        agent: task.agent,
                        message,
                    });
                    continue;
                }

                let input = substitute_results(&task.input, &results);
                pending.push(self.execute_with_handoff(ctx, task, input, sink));
            }

            for outcome in join_all(pending).await {
                let task = plan.task_mut(&outcome.task_id).expect("task exists");
                task.agent = outcome.agent.clone();
                task.input = outcome.input;
                match outcome.result {
                    Ok(text) => {
                        task.status = TaskStatus::Completed;
                        task.result = text.clone();
                        results.insert(outcome.task_id, text);
                    }
                    Err(message) => {
                        task.status = TaskStatus::Failed;
                        task.error = message.clone();
                        errors.push(TaskError {
                            task_id: outcome.task_id,
                            agent: outcome.agent,
                            message,
                        });
                    }
                }
            }
        }

        errors
    }

    async fn execute_with_handoff(
        &self,
        ctx: &TurnContext,
        mut task: Task,
        mut input: String,
        sink: &EventCallback,
    ) -> TaskOutcome {
        let mut depth = 0u32;

        loop {
            let attempt = self.execute_once(ctx, &task, &input, sink, depth).await;

            let err = match attempt {
                Ok(text) => {
                    return TaskOutcome {
                        task_id: task.id,
                        agent: task.agent,
                        input,
                        result: Ok(text),
                    }
                }
                Err(err) => err,
            };

            // Only a typed missing-capability failure is eligible for
            // handoff, and only below the depth bound.
            let suggestion = missing_capability(&err)
                .filter(|_| depth < self.config.handoff_max_depth)
                .and_then(|missing| {
                    self.handoff
                        .as_ref()
                        .and_then(|h| h.suggest(&task, missing, &self.registry.names()))
                });

            let Some(HandoffSuggestion { target, input: new_input }) = suggestion else {
                return TaskOutcome {
                    task_id: task.id,
                    agent: task.agent,
                    input,
                    result: Err(err.to_string()),
                };
            };

            // Self-handoff is a loop, not a retry; treat as unrecoverable.
            if target == task.agent {
                tracing::warn!(task_id = %task.id, agent = %task.agent, "self-handoff rejected");
                return TaskOutcome {
                    task_id: task.id,
                    agent: task.agent,
                    input,
                    result: Err(err.to_string()),
                };
            }

            depth += 1;
            TraceEvent::TaskHandoff {
                trace_id: ctx.trace_id.clone(),
                task_id: task.id.clone(),
                from_agent: task.agent.clone(),
                to_agent: target.clone(),
                depth,
            }
            .emit();

            // Reset and re-dispatch under the suggested agent.
            task.status = TaskStatus::Pending;
            task.agent = target;
            input = new_input;
        }
    }

    async fn execute_once(
        &self,
        ctx: &TurnContext,
        task: &Task,
        input: &str,
        sink: &EventCallback,
        depth: u32,
    ) -> Result<String, Error> {
        let agent = self
            .registry
            .get(&task.agent)
            .ok_or_else(|| Error::Routing(format!("unknown agent '{}'", task.agent)))?;

        sink(AgentEvent::json(
            EVENT_TASK_START,
            &serde_json::json!({
                "task_id": task.id,
                "agent": task.agent,
                "purpose": task.purpose,
                "depth": depth,
            }),
        ));
        TraceEvent::TaskDispatched {
            trace_id: ctx.trace_id.clone(),
            task_id: task.id.clone(),
            agent: task.agent.clone(),
        }
        .emit();

        let collector = Arc::new(ResultCollector::new(
            task.id.clone(),
            self.config.task_result_cap_bytes,
        ));
        let callback = collector.clone().wrap(sink.clone());

        let outcome = agent.execute(&ctx.child(), input, &[], callback).await;

        let (status, error) = match &outcome {
            Ok(()) => ("completed", serde_json::Value::Null),
            Err(err) => ("failed", serde_json::Value::String(err.to_string())),
        };
        sink(AgentEvent::json(
            EVENT_TASK_END,
            &serde_json::json!({
                "task_id": task.id,
                "agent": task.agent,
                "status": status,
                "error": error,
                "truncated": collector.truncated(),
            }),
        ));

        outcome.map(|()| collector.take())
    }
}

struct TaskOutcome {
    task_id: String,
    agent: String,
    input: String,
    result: Result<String, String>,
}

/// Peel a typed missing-capability failure out of an error chain.
fn missing_capability(err: &Error) -> Option<&MissingCapability> {
    match err {
        Error::MissingCapability(missing) => Some(missing),
        Error::Parrot(parrot) => missing_capability(&parrot.wrapped),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result collection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates a task's answer text under a byte cap. Streaming to the
/// caller continues after truncation; the cap only bounds the stored
/// result.
struct ResultCollector {
    task_id: String,
    cap: usize,
    buf: Mutex<String>,
    truncated: AtomicBool,
}

impl ResultCollector {
    fn new(task_id: String, cap: usize) -> Self {
        Self {
            task_id,
            cap,
            buf: Mutex::new(String::new()),
            truncated: AtomicBool::new(false),
        }
    }

    fn wrap(self: Arc<Self>, sink: EventCallback) -> EventCallback {
        Arc::new(move |event: AgentEvent| {
            if event.event_type == EVENT_ANSWER {
                if let Some(text) = answer_text(&event.data) {
                    self.append(&text);
                }
            }
            sink(event);
        })
    }

    fn append(&self, text: &str) {
        let mut buf = self.buf.lock();
        let remaining = self.cap.saturating_sub(buf.len());
        if text.len() <= remaining {
            buf.push_str(text);
            return;
        }

        if remaining > 0 {
            let mut boundary = remaining;
            while boundary > 0 && !text.is_char_boundary(boundary) {
                boundary -= 1;
            }
            buf.push_str(&text[..boundary]);
        }
        if !self.truncated.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                task_id = %self.task_id,
                cap_bytes = self.cap,
                "task result truncated at cap; streaming continues"
            );
        }
    }

    fn truncated(&self) -> bool {
        self.truncated.load(Ordering::SeqCst)
    }

    fn take(&self) -> String {
        std::mem::take(&mut self.buf.lock())
    }
}
