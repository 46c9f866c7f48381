//! The config-driven universal parrot.
//!
//! Declarative configuration chooses the role, system prompt, tools, and
//! reasoning strategy. Tool invocations go through the `ToolExecutor`
//! contract; tool requests are parsed from the model's structured
//! `Action:` / `Action Input:` lines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use av_domain::event::{
    AgentEvent, EVENT_ANSWER, EVENT_PHASE_CHANGE, EVENT_SESSION_STATS, EVENT_THINKING,
    EVENT_TOOL_RESULT, EVENT_TOOL_USE,
};
use av_domain::llm::{LlmProvider, Message, ToolExecutor};
use av_domain::pricing::PricingTable;
use av_domain::{Error, EventCallback, ParrotError, Result, SessionStats, TraceEvent, TurnContext};

use crate::cognition::Cognition;
use crate::parrot::Parrot;
use crate::stats::TurnStats;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Direct,
    React,
    Planning,
    Reflexion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParrotConfig {
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    pub strategy: Strategy,
    /// Tool names this parrot may use (subset of the executor's set).
    #[serde(default)]
    pub tools: Vec<String>,
    /// Step budget for iterative strategies.
    #[serde(default = "d_max_steps")]
    pub max_steps: usize,
}

fn d_max_steps() -> usize {
    6
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parrot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UniversalParrot {
    config: ParrotConfig,
    provider: Arc<dyn LlmProvider>,
    tools: Option<Arc<dyn ToolExecutor>>,
    pricing: Arc<PricingTable>,
    llm_timeout_ms: u64,
    last_stats: Mutex<Option<SessionStats>>,
}

impl UniversalParrot {
    pub fn new(
        config: ParrotConfig,
        provider: Arc<dyn LlmProvider>,
        tools: Option<Arc<dyn ToolExecutor>>,
        pricing: Arc<PricingTable>,
        llm_timeout_ms: u64,
    ) -> Self {
        Self {
            config,
            provider,
            tools,
            pricing,
            llm_timeout_ms,
            last_stats: Mutex::new(None),
        }
    }

    fn wrap(&self, operation: &str, err: Error) -> Error {
        Error::Parrot(ParrotError::wrap(&self.config.name, operation, err))
    }

    async fn call_llm(
        &self,
        ctx: &TurnContext,
        messages: &[Message],
        stats: &TurnStats,
    ) -> Result<String> {
        let timeout = Duration::from_millis(self.llm_timeout_ms);
        let started = Instant::now();
        let (text, call) = tokio::time::timeout(timeout, self.provider.chat(&ctx.cancel, messages))
            .await
            .map_err(|_| Error::Timeout(format!("LLM call timed out after {}ms", self.llm_timeout_ms)))??;

        let model = self.provider.model_name();
        stats.track_llm_call(&call, model);
        TraceEvent::LlmCall {
            model: model.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            prompt_tokens: call.prompt_tokens,
            completion_tokens: call.completion_tokens,
        }
        .emit();
        Ok(text)
    }

    fn system_message(&self) -> Message {
        let mut prompt = format!("You are {}.\n{}", self.config.role, self.config.system_prompt);
        if !self.config.tools.is_empty() {
            let listing = self.tool_listing();
            prompt.push_str(&format!(
                "\n\nAvailable tools:\n{listing}\n\
                 To use a tool answer with exactly:\n\
                 Thought: <why>\nAction: <tool name>\nAction Input: <JSON arguments>\n\
                 When you have the answer, answer with:\nFinal Answer: <text>"
            ));
        }
        Message::system(prompt)
    }

    fn tool_listing(&self) -> String {
        let Some(executor) = &self.tools else {
            return String::new();
        };
        executor
            .definitions()
            .iter()
            .filter(|def| self.config.tools.contains(&def.name))
            .map(|def| format!("- {}: {}\n", def.name, def.description))
            .collect()
    }

    // ── Strategies ─────────────────────────────────────────────────

    async fn run_direct(
        &self,
        ctx: &TurnContext,
        messages: Vec<Message>,
        stats: &TurnStats,
        _callback: &EventCallback,
    ) -> Result<String> {
        self.call_llm(ctx, &messages, stats).await
    }

    /// Observe/act loop: parse `Action:` lines, invoke the executor,
    /// feed observations back, stop on `Final Answer:`.
    async fn run_react(
        &self,
        ctx: &TurnContext,
        mut messages: Vec<Message>,
        stats: &TurnStats,
        callback: &EventCallback,
    ) -> Result<String> {
        for _step in 0..self.config.max_steps {
            let text = self.call_llm(ctx, &messages, stats).await?;
            let step = parse_react(&text);

            if let Some(thought) = &step.thought {
                callback(AgentEvent::json(
                    EVENT_THINKING,
                    &serde_json::json!({ "text": thought }),
                ));
            }

            if let Some(answer) = step.final_answer {
                return Ok(answer);
            }

            let Some((tool, input)) = step.action else {
                // No action and no final answer: the raw text is the answer.
                return Ok(text);
            };

            callback(AgentEvent::json(
                EVENT_TOOL_USE,
                &serde_json::json!({ "name": tool, "input": input }),
            ));
            let observation = self.invoke_tool(ctx, &tool, &input, stats).await?;
            callback(AgentEvent::json(
                EVENT_TOOL_RESULT,
                &serde_json::json!({ "name": tool, "content": observation }),
            ));

            messages.push(Message::assistant(text));
            messages.push(Message::tool(format!("Observation: {observation}")));
        }

        Err(Error::Other(format!(
            "react loop exceeded {} steps without a final answer",
            self.config.max_steps
        )))
    }

    async fn run_planning(
        &self,
        ctx: &TurnContext,
        messages: Vec<Message>,
        stats: &TurnStats,
        callback: &EventCallback,
    ) -> Result<String> {
        callback(AgentEvent::json(
            EVENT_PHASE_CHANGE,
            &serde_json::json!({ "phase": "planning" }),
        ));
        let mut plan_messages = messages.clone();
        plan_messages.push(Message::user(
            "First produce a short numbered plan for the request above. Plan only, no execution.",
        ));
        let plan = self.call_llm(ctx, &plan_messages, stats).await?;

        callback(AgentEvent::json(
            EVENT_PHASE_CHANGE,
            &serde_json::json!({ "phase": "executing" }),
        ));
        let mut exec_messages = messages;
        exec_messages.push(Message::assistant(plan));
        exec_messages.push(Message::user(
            "Now carry out that plan and answer the original request.",
        ));
        self.call_llm(ctx, &exec_messages, stats).await
    }

    async fn run_reflexion(
        &self,
        ctx: &TurnContext,
        messages: Vec<Message>,
        stats: &TurnStats,
        callback: &EventCallback,
    ) -> Result<String> {
        let draft = self.call_llm(ctx, &messages, stats).await?;

        callback(AgentEvent::json(
            EVENT_PHASE_CHANGE,
            &serde_json::json!({ "phase": "reflecting" }),
        ));
        let mut revise = messages;
        revise.push(Message::assistant(draft.clone()));
        revise.push(Message::user(
            "Critique the draft above for mistakes or omissions, then give the corrected final answer only.",
        ));
        self.call_llm(ctx, &revise, stats).await
    }

    async fn invoke_tool(
        &self,
        ctx: &TurnContext,
        name: &str,
        input: &serde_json::Value,
        stats: &TurnStats,
    ) -> Result<String> {
        let executor = self
            .tools
            .as_ref()
            .ok_or_else(|| Error::Other(format!("no tool executor configured for '{name}'")))?;
        if !self.config.tools.iter().any(|t| t == name) {
            return Err(Error::Other(format!("tool '{name}' not allowed for this agent")));
        }

        stats.track_tool_call(name);
        let started = Instant::now();
        let observation = executor.invoke(&ctx.cancel, name, input).await?;
        stats.track_tool_duration(started.elapsed().as_millis() as u64);
        Ok(observation)
    }
}

#[async_trait::async_trait]
impl Parrot for UniversalParrot {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn self_describe(&self) -> Cognition {
        Cognition::new(&self.config.name, &self.config.role, &self.config.system_prompt)
            .with_capabilities(self.config.tools.clone())
    }

    async fn execute(
        &self,
        ctx: &TurnContext,
        user_input: &str,
        history: &[Message],
        callback: EventCallback,
    ) -> Result<()> {
        let stats = TurnStats::new(self.pricing.clone());

        let mut messages = vec![self.system_message()];
        messages.extend_from_slice(history);
        messages.push(Message::user(user_input));

        let outcome = match self.config.strategy {
            Strategy::Direct => self.run_direct(ctx, messages, &stats, &callback).await,
            Strategy::React => self.run_react(ctx, messages, &stats, &callback).await,
            Strategy::Planning => self.run_planning(ctx, messages, &stats, &callback).await,
            Strategy::Reflexion => self.run_reflexion(ctx, messages, &stats, &callback).await,
        };

        let answer = match outcome {
            Ok(answer) => answer,
            Err(err) => {
                stats.note_error(&err.to_string());
                stats.finalize();
                *self.last_stats.lock() = Some(stats.snapshot());
                return Err(self.wrap("execute", err));
            }
        };

        stats.finalize();
        let snapshot = stats.snapshot();

        callback(AgentEvent::json(
            EVENT_ANSWER,
            &serde_json::json!({ "content": answer }),
        ));
        callback(AgentEvent::json(EVENT_SESSION_STATS, &snapshot));

        *self.last_stats.lock() = Some(snapshot);
        Ok(())
    }

    fn session_stats(&self) -> Option<SessionStats> {
        self.last_stats.lock().clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// React parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct ReactStep {
    pub thought: Option<String>,
    pub action: Option<(String, serde_json::Value)>,
    pub final_answer: Option<String>,
}

/// Parse one model response into thought / action / final answer.
pub fn parse_react(text: &str) -> ReactStep {
    let mut step = ReactStep::default();

    if let Some(idx) = text.find("Final Answer:") {
        step.final_answer = Some(text[idx + "Final Answer:".len()..].trim().to_string());
    }

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Thought:") {
            step.thought = Some(rest.trim().to_string());
        }
    }

    // Action wins only without a final answer on the same turn.
    if step.final_answer.is_none() {
        let action_name = text
            .lines()
            .find_map(|l| l.trim().strip_prefix("Action:"))
            .map(|s| s.trim().to_string());
        if let Some(name) = action_name.filter(|n| !n.is_empty()) {
            let input = text
                .find("Action Input:")
                .map(|idx| text[idx + "Action Input:".len()..].trim())
                .map(|raw| {
                    // The input may be followed by further prose; parse the
                    // leading JSON value when possible.
                    serde_json::Deserializer::from_str(raw)
                        .into_iter::<serde_json::Value>()
                        .next()
                        .and_then(|r| r.ok())
                        .unwrap_or_else(|| serde_json::Value::String(raw.to_string()))
                })
                .unwrap_or(serde_json::Value::Null);
            step.action = Some((name, input));
        }
    }

    step
}
