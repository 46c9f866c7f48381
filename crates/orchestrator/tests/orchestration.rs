//! Orchestrator end-to-end tests with scripted providers and stub agents.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use av_domain::config::OrchestratorConfig;
use av_domain::event::{AgentEvent, EVENT_ANSWER};
use av_domain::llm::{BoxStream, LlmCallStats, LlmProvider, LlmStreamEvent, Message};
use av_domain::{
    Error, EventCallback, HandoffSuggestion, MissingCapability, ParrotError, Result, SessionStats,
    TurnContext,
};
use av_orchestrator::{
    Aggregator, Decomposer, HandoffHandler, Orchestrator, Task, TaskStatus,
};
use av_parrots::{Cognition, ExpertRegistry, Parrot};

// ── Test doubles ───────────────────────────────────────────────────

/// Always answers with the same text (used for decompose/aggregate).
struct FixedProvider(String);

#[async_trait]
impl LlmProvider for FixedProvider {
    async fn chat(
        &self,
        _cancel: &CancellationToken,
        _messages: &[Message],
    ) -> Result<(String, LlmCallStats)> {
        Ok((self.0.clone(), LlmCallStats::default()))
    }
    async fn chat_stream(
        &self,
        _cancel: &CancellationToken,
        _messages: &[Message],
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        Err(Error::Other("not used".into()))
    }
    fn model_name(&self) -> &str {
        "test-model"
    }
}

/// Echoes its input back as `<name>:<input>` and records invocations.
struct EchoParrot {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Parrot for EchoParrot {
    fn name(&self) -> &str {
        &self.name
    }
    fn self_describe(&self) -> Cognition {
        Cognition::new(&self.name, "echo", "echoes input")
    }
    async fn execute(
        &self,
        _ctx: &TurnContext,
        user_input: &str,
        _history: &[Message],
        callback: EventCallback,
    ) -> Result<()> {
        self.log.lock().push(format!("{}:{}", self.name, user_input));
        callback(AgentEvent::json(
            EVENT_ANSWER,
            &serde_json::json!({ "content": format!("{}({})", self.name, user_input) }),
        ));
        Ok(())
    }
    fn session_stats(&self) -> Option<SessionStats> {
        None
    }
}

/// Fails with MissingCapability until renamed input arrives.
struct IncapableParrot {
    name: String,
}

#[async_trait]
impl Parrot for IncapableParrot {
    fn name(&self) -> &str {
        &self.name
    }
    fn self_describe(&self) -> Cognition {
        Cognition::new(&self.name, "limited", "cannot search")
    }
    async fn execute(
        &self,
        _ctx: &TurnContext,
        _user_input: &str,
        _history: &[Message],
        _callback: EventCallback,
    ) -> Result<()> {
        Err(Error::Parrot(ParrotError::wrap(
            &self.name,
            "execute",
            Error::MissingCapability(MissingCapability {
                expert: self.name.clone(),
                missing_capabilities: vec!["web_search".into()],
                original: "needs web search".into(),
                suggestion: None,
            }),
        )))
    }
    fn session_stats(&self) -> Option<SessionStats> {
        None
    }
}

struct ToSearchHandoff;

impl HandoffHandler for ToSearchHandoff {
    fn suggest(
        &self,
        task: &Task,
        _missing: &MissingCapability,
        available: &[String],
    ) -> Option<HandoffSuggestion> {
        available
            .iter()
            .find(|a| a.as_str() == "search")
            .map(|target| HandoffSuggestion {
                target: target.clone(),
                input: format!("handed off: {}", task.input),
            })
    }
}

/// Suggests the failing agent itself (must be rejected).
struct SelfHandoff;

impl HandoffHandler for SelfHandoff {
    fn suggest(
        &self,
        task: &Task,
        _missing: &MissingCapability,
        _available: &[String],
    ) -> Option<HandoffSuggestion> {
        Some(HandoffSuggestion {
            target: task.agent.clone(),
            input: task.input.clone(),
        })
    }
}

// ── Harness ────────────────────────────────────────────────────────

fn registry_with_echoes(log: &Arc<Mutex<Vec<String>>>, names: &[&str]) -> Arc<ExpertRegistry> {
    let registry = Arc::new(ExpertRegistry::new());
    for name in names {
        registry.register(Arc::new(EchoParrot {
            name: name.to_string(),
            log: log.clone(),
        }));
    }
    registry
}

fn orchestrator(
    plan_json: &str,
    registry: Arc<ExpertRegistry>,
    handoff: Option<Arc<dyn HandoffHandler>>,
) -> Orchestrator {
    let decompose_provider = Arc::new(FixedProvider(plan_json.to_string()));
    let aggregate_provider = Arc::new(FixedProvider("synthesised answer".into()));
    Orchestrator::new(
        Decomposer::new(decompose_provider, 5_000),
        Aggregator::new(aggregate_provider, 5_000),
        registry,
        handoff,
        OrchestratorConfig::default(),
        5_000,
    )
}

fn collecting_callback() -> (EventCallback, Arc<Mutex<Vec<AgentEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));
    (callback, seen)
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn dag_runs_in_order_and_substitutes_results() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &["alpha", "beta"]);

    let plan = r#"{
        "analysis": "two steps",
        "tasks": [
            {"id": "A", "agent": "alpha", "purpose": "first", "input": "collect data", "deps": []},
            {"id": "B", "agent": "beta", "purpose": "second", "input": "summarise {{A}}", "deps": ["A"]}
        ],
        "parallel": true,
        "aggregate": true
    }"#;

    let orch = orchestrator(plan, registry, None);
    let ctx = TurnContext::new("c1", "u1");
    let (callback, seen) = collecting_callback();

    let result = orch.run(&ctx, "do both things", callback).await.unwrap();

    // A ran before B, and B saw A's completed result text.
    let invocations = log.lock();
    assert_eq!(invocations[0], "alpha:collect data");
    assert_eq!(invocations[1], "beta:summarise alpha(collect data)");

    // plan, then task events in order per task.
    let events = seen.lock();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types[0], "plan");
    let starts: Vec<usize> = types
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == "task_start")
        .map(|(i, _)| i)
        .collect();
    let ends: Vec<usize> = types
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == "task_end")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(ends.len(), 2);
    assert!(starts[0] < ends[0] && ends[0] < starts[1] && starts[1] < ends[1]);

    // Two results with aggregate=true: synthesis ran, and its usage is
    // surfaced for accounting.
    assert!(result.is_aggregated);
    assert_eq!(result.final_response, "synthesised answer");
    assert!(result.errors.is_empty());
    let aggregation = result.aggregation.unwrap();
    assert_eq!(aggregation.model, "test-model");
}

#[tokio::test]
async fn cyclic_plan_is_a_decomposition_error() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &["alpha"]);

    let plan = r#"{
        "tasks": [
            {"id": "A", "agent": "alpha", "input": "x", "deps": ["B"]},
            {"id": "B", "agent": "alpha", "input": "y", "deps": ["A"]}
        ]
    }"#;

    let orch = orchestrator(plan, registry, None);
    let ctx = TurnContext::new("c1", "u1");
    let (callback, _) = collecting_callback();

    let err = orch.run(&ctx, "anything", callback).await.unwrap_err();
    assert!(matches!(err, Error::Decomposition(_)));
    // Nothing executed.
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn single_task_bypasses_aggregation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &["alpha"]);

    let plan = r#"{
        "tasks": [{"id": "A", "agent": "alpha", "input": "solo", "deps": []}],
        "aggregate": true
    }"#;

    let orch = orchestrator(plan, registry, None);
    let ctx = TurnContext::new("c1", "u1");
    let (callback, _) = collecting_callback();

    let result = orch.run(&ctx, "one thing", callback).await.unwrap();
    assert!(!result.is_aggregated);
    assert!(result.aggregation.is_none());
    assert_eq!(result.final_response, "alpha(solo)");
}

#[tokio::test]
async fn concatenation_without_aggregate_flag() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &["alpha", "beta"]);

    let plan = r#"{
        "tasks": [
            {"id": "A", "agent": "alpha", "input": "one", "deps": []},
            {"id": "B", "agent": "beta", "input": "two", "deps": []}
        ],
        "aggregate": false
    }"#;

    let orch = orchestrator(plan, registry, None);
    let ctx = TurnContext::new("c1", "u1");
    let (callback, _) = collecting_callback();

    let result = orch.run(&ctx, "both", callback).await.unwrap();
    assert!(!result.is_aggregated);
    assert!(result.aggregation.is_none());
    assert_eq!(result.final_response, "alpha(one)\n\n---\n\nbeta(two)");
}

#[tokio::test]
async fn per_task_failure_does_not_abort_unrelated_branches() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &["alpha"]);
    registry.register(Arc::new(IncapableParrot {
        name: "limited".into(),
    }));

    let plan = r#"{
        "tasks": [
            {"id": "A", "agent": "limited", "input": "needs search", "deps": []},
            {"id": "B", "agent": "alpha", "input": "independent", "deps": []},
            {"id": "C", "agent": "alpha", "input": "uses {{A}}", "deps": ["A"]}
        ]
    }"#;

    let orch = orchestrator(plan, registry, None);
    let ctx = TurnContext::new("c1", "u1");
    let (callback, _) = collecting_callback();

    let result = orch.run(&ctx, "mixed", callback).await.unwrap();

    // A failed, C (depends on A) failed, B completed.
    assert_eq!(result.errors.len(), 2);
    let plan = &result.plan;
    assert_eq!(plan.task("A").unwrap().status, TaskStatus::Failed);
    assert_eq!(plan.task("B").unwrap().status, TaskStatus::Completed);
    assert_eq!(plan.task("C").unwrap().status, TaskStatus::Failed);
    assert_eq!(result.final_response, "alpha(independent)");
}

#[tokio::test]
async fn missing_capability_triggers_handoff() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &["search"]);
    registry.register(Arc::new(IncapableParrot {
        name: "limited".into(),
    }));

    let plan = r#"{
        "tasks": [{"id": "A", "agent": "limited", "input": "find rust news", "deps": []}]
    }"#;

    let orch = orchestrator(plan, registry, Some(Arc::new(ToSearchHandoff)));
    let ctx = TurnContext::new("c1", "u1");
    let (callback, _) = collecting_callback();

    let result = orch.run(&ctx, "news", callback).await.unwrap();

    assert!(result.errors.is_empty());
    let task = result.plan.task("A").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.agent, "search");
    assert_eq!(result.final_response, "search(handed off: find rust news)");
}

#[tokio::test]
async fn self_handoff_is_rejected_as_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_echoes(&log, &[]);
    registry.register(Arc::new(IncapableParrot {
        name: "limited".into(),
    }));

    let plan = r#"{
        "tasks": [{"id": "A", "agent": "limited", "input": "x", "deps": []}]
    }"#;

    let orch = orchestrator(plan, registry, Some(Arc::new(SelfHandoff)));
    let ctx = TurnContext::new("c1", "u1");
    let (callback, _) = collecting_callback();

    let result = orch.run(&ctx, "x", callback).await.unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.plan.task("A").unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn handoff_depth_is_bounded() {
    // Handler always re-targets "other", which also lacks the capability:
    // limited -> other -> ... would loop without the depth bound.
    struct PingPong;
    impl HandoffHandler for PingPong {
        fn suggest(
            &self,
            task: &Task,
            _missing: &MissingCapability,
            _available: &[String],
        ) -> Option<HandoffSuggestion> {
            let target = if task.agent == "limited" { "other" } else { "limited" };
            Some(HandoffSuggestion {
                target: target.into(),
                input: task.input.clone(),
            })
        }
    }

    let registry = Arc::new(ExpertRegistry::new());
    registry.register(Arc::new(IncapableParrot {
        name: "limited".into(),
    }));
    registry.register(Arc::new(IncapableParrot {
        name: "other".into(),
    }));

    let plan = r#"{
        "tasks": [{"id": "A", "agent": "limited", "input": "x", "deps": []}]
    }"#;

    let orch = orchestrator(plan, registry, Some(Arc::new(PingPong)));
    let ctx = TurnContext::new("c1", "u1");
    let (callback, seen) = collecting_callback();

    let result = orch.run(&ctx, "x", callback).await.unwrap();
    assert_eq!(result.errors.len(), 1);

    // Initial attempt plus at most handoff_max_depth (3) retries.
    let starts = seen
        .lock()
        .iter()
        .filter(|e| e.event_type == "task_start")
        .count();
    assert_eq!(starts, 4);
}
