//! The end-to-end chat-turn pipeline.
//!
//! One call takes a user utterance through block creation, routing, agent
//! or orchestrator execution, event tee-ing (caller + store), and block
//! completion with stats and cost. Rapid follow-up inputs fold into the
//! active block instead of opening a new turn.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use av_blocks::{BlockMode, BlockOutcome, BlockStatus, BlockStore, NewBlock, UserInput};
use av_context::{ContextStore, RecentTurn};
use av_domain::event::{answer_text, AgentEvent, StoredEvent, EVENT_ANSWER, EVENT_ERROR};
use av_domain::llm::Message;
use av_domain::pricing::PricingTable;
use av_domain::stats::TokenUsage;
use av_domain::{EventCallback, Result, SessionStats, TurnContext};
use av_orchestrator::{AggregationUsage, Orchestrator};
use av_parrots::ExpertRegistry;
use av_router::{ChatRouter, RouteDecision};
use av_runner::CodeRunner;

/// Everything the turn service needs, constructed once at startup and
/// injected (no globals).
pub struct TurnServiceDeps {
    pub blocks: Arc<BlockStore>,
    pub contexts: Arc<ContextStore>,
    pub router: Arc<ChatRouter>,
    pub registry: Arc<ExpertRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    /// Prices the orchestrator's synthesis calls into block cost.
    pub pricing: Arc<PricingTable>,
    /// Runner instances used only to derive `cc_session_id` per mode.
    pub geek_runner: Option<Arc<CodeRunner>>,
    pub evolution_runner: Option<Arc<CodeRunner>>,
}

pub struct TurnService {
    deps: TurnServiceDeps,
}

/// The outcome handed back to the transport layer.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub block_id: i64,
    pub assistant_content: String,
    /// True when the input was folded into an already-active block and no
    /// new turn ran.
    pub appended: bool,
}

/// What one routed execution produced: the answer text, the agents that
/// actually ran (accounting scope), and any synthesis-call usage.
struct RoutedOutcome {
    answer: String,
    dispatched: Vec<String>,
    aggregation: Option<AggregationUsage>,
}

impl TurnService {
    pub fn new(deps: TurnServiceDeps) -> Self {
        Self { deps }
    }

    /// Startup pass: abandon blocks interrupted by a crash.
    pub fn recover_interrupted(&self) -> Result<usize> {
        self.deps.blocks.recover_interrupted()
    }

    /// Handle one user turn end to end.
    pub async fn handle_turn(
        &self,
        ctx: &TurnContext,
        text: &str,
        callback: EventCallback,
    ) -> Result<TurnResult> {
        let blocks = &self.deps.blocks;

        // A non-terminal block means a turn is still running: fold the
        // input into it instead of opening a new round.
        if let Some(active) = blocks.get_latest_block(&ctx.conversation_id)? {
            if !active.status.is_terminal() {
                blocks.append_user_input(active.id, UserInput::now(text))?;
                tracing::debug!(
                    conversation_id = %ctx.conversation_id,
                    block_id = active.id,
                    "appended input to active block"
                );
                return Ok(TurnResult {
                    block_id: active.id,
                    assistant_content: String::new(),
                    appended: true,
                });
            }
        }

        let context = self
            .deps
            .contexts
            .resolve_or_create(&ctx.conversation_id, &ctx.user_id);

        let decision = self
            .deps
            .router
            .route(&ctx.cancel, Some(&context), &ctx.user_id, text)
            .await;

        let (mode, cc_session_id) = self.mode_for(&decision, &ctx.conversation_id);
        let block = blocks.create_block({
            let mut new = NewBlock::message(&ctx.conversation_id, text).with_mode(mode);
            if let Some(session_id) = &cc_session_id {
                new = new.with_session(session_id.clone());
            }
            new
        })?;

        // Tee: every event reaches the caller and the stored stream, in
        // the same order; the first event flips the block to streaming.
        let tee = EventTee::new(blocks.clone(), block.id, callback);
        let tee_callback = tee.callback();

        let history = conversation_history(&context);
        let outcome = self
            .execute_routed(ctx, &decision, text, &history, tee_callback.clone())
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tee_callback(AgentEvent::json(
                    EVENT_ERROR,
                    &serde_json::json!({ "message": err.to_string() }),
                ));
                tee.ensure_streaming();
                blocks.fail_block(block.id, &err.to_string())?;
                return Err(err);
            }
        };

        tee.ensure_streaming();

        let (session_stats, token_usage, cost_milli_cents, model_version) =
            self.collect_accounting(&outcome.dispatched, outcome.aggregation.as_ref(), mode);

        blocks.complete_block(
            block.id,
            &BlockOutcome {
                assistant_content: outcome.answer.clone(),
                session_stats,
                token_usage,
                cost_milli_cents,
                model_version,
            },
        )?;

        context.push_turn(RecentTurn {
            user_text: text.to_string(),
            assistant_text: outcome.answer.clone(),
            route: (!decision.route.is_empty()).then(|| decision.route.clone()),
            at_ms: av_domain::now_ms(),
        });

        Ok(TurnResult {
            block_id: block.id,
            assistant_content: outcome.answer,
            appended: false,
        })
    }

    async fn execute_routed(
        &self,
        ctx: &TurnContext,
        decision: &RouteDecision,
        text: &str,
        history: &[Message],
        callback: EventCallback,
    ) -> Result<RoutedOutcome> {
        if !decision.needs_orchestration && !decision.route.is_empty() {
            if let Some(agent) = self.deps.registry.get(&decision.route) {
                let collector = AnswerCollector::default();
                let collecting = collector.wrap(callback);
                agent.execute(ctx, text, history, collecting).await?;
                return Ok(RoutedOutcome {
                    answer: collector.take(),
                    dispatched: vec![decision.route.clone()],
                    aggregation: None,
                });
            }
            tracing::warn!(route = %decision.route, "routed agent not registered; orchestrating");
        }

        let result = self
            .deps
            .orchestrator
            .run(ctx, text, callback)
            .await?;
        let dispatched = result.plan.tasks.iter().map(|t| t.agent.clone()).collect();
        Ok(RoutedOutcome {
            answer: result.final_response,
            dispatched,
            aggregation: result.aggregation,
        })
    }

    fn mode_for(
        &self,
        decision: &RouteDecision,
        conversation_id: &str,
    ) -> (BlockMode, Option<String>) {
        match decision.route.as_str() {
            "geek" => {
                let session = self
                    .deps
                    .geek_runner
                    .as_ref()
                    .map(|r| r.derive_session_id(conversation_id));
                (BlockMode::Geek, session)
            }
            "evolution" => {
                let session = self
                    .deps
                    .evolution_runner
                    .as_ref()
                    .map(|r| r.derive_session_id(conversation_id));
                (BlockMode::Evolution, session)
            }
            _ => (BlockMode::Normal, None),
        }
    }

    /// Tokens and cost for the completed block. Session stats persist only
    /// for runner-backed modes; normal turns carry tokens/cost from the
    /// agents' accumulators.
    ///
    /// Only agents in `dispatched` — the ones this turn actually ran —
    /// contribute. Agent snapshots are "last completed turn" state on
    /// shared instances, so an unscoped sum would pick up stale stats
    /// from unrelated conversations.
    fn collect_accounting(
        &self,
        dispatched: &[String],
        aggregation: Option<&AggregationUsage>,
        mode: BlockMode,
    ) -> (Option<SessionStats>, Option<TokenUsage>, i64, Option<String>) {
        let mut merged: Option<SessionStats> = None;
        let mut seen = BTreeSet::new();
        for name in dispatched {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let Some(stats) = self
                .deps
                .registry
                .get(name)
                .and_then(|agent| agent.session_stats())
            else {
                continue;
            };
            merged = Some(match merged {
                None => stats,
                Some(mut acc) => {
                    acc.tokens.input_tokens += stats.tokens.input_tokens;
                    acc.tokens.output_tokens += stats.tokens.output_tokens;
                    acc.tokens.cache_read_tokens += stats.tokens.cache_read_tokens;
                    acc.tokens.cache_write_tokens += stats.tokens.cache_write_tokens;
                    acc.cost_milli_cents += stats.cost_milli_cents;
                    acc.cost_usd += stats.cost_usd;
                    acc
                }
            });
        }

        let mut tokens = merged.as_ref().map(|s| s.tokens.clone());
        let mut cost = merged.as_ref().map(|s| s.cost_milli_cents).unwrap_or(0);
        let mut model = merged
            .as_ref()
            .and_then(|s| (!s.model_name.is_empty()).then(|| s.model_name.clone()));

        // The synthesis call is a genuine per-LLM-call contribution.
        if let Some(agg) = aggregation {
            let usage = tokens.get_or_insert_with(TokenUsage::default);
            usage.input_tokens += agg.stats.prompt_tokens;
            usage.output_tokens += agg.stats.completion_tokens;
            usage.cache_read_tokens += agg.stats.cache_read_tokens;
            usage.cache_write_tokens += agg.stats.cache_write_tokens;
            cost += self.deps.pricing.cost_milli_cents(
                &agg.model,
                agg.stats.prompt_tokens,
                agg.stats.completion_tokens,
            );
            if model.is_none() {
                model = Some(agg.model.clone());
            }
        }

        let session_stats = merged.filter(|_| mode.uses_runner());
        (session_stats, tokens, cost, model)
    }
}

/// Recent turns projected into provider messages, oldest first.
fn conversation_history(context: &av_context::ConversationContext) -> Vec<Message> {
    let mut history = Vec::new();
    for turn in context.recent_turns() {
        history.push(Message::user(turn.user_text));
        if !turn.assistant_text.is_empty() {
            history.push(Message::assistant(turn.assistant_text));
        }
    }
    history
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event tee
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forwards events to the caller and persists them on the block, keeping
/// both streams identically ordered. The first event moves the block
/// `pending → streaming`.
struct EventTee {
    blocks: Arc<BlockStore>,
    block_id: i64,
    streaming: Arc<AtomicBool>,
    caller: EventCallback,
}

impl EventTee {
    fn new(blocks: Arc<BlockStore>, block_id: i64, caller: EventCallback) -> Arc<Self> {
        Arc::new(Self {
            blocks,
            block_id,
            streaming: Arc::new(AtomicBool::new(false)),
            caller,
        })
    }

    fn callback(self: &Arc<Self>) -> EventCallback {
        let tee = self.clone();
        Arc::new(move |event: AgentEvent| {
            tee.mark_streaming();
            if let Err(err) = tee.blocks.append_event(tee.block_id, &StoredEvent::from_event(&event)) {
                tracing::warn!(block_id = tee.block_id, error = %err, "failed to persist event");
            }
            (tee.caller)(event);
        })
    }

    fn mark_streaming(&self) {
        if !self.streaming.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.blocks.update_status(self.block_id, BlockStatus::Streaming) {
                tracing::warn!(block_id = self.block_id, error = %err, "streaming transition failed");
            }
        }
    }

    /// A turn that produced no events still has to pass through
    /// streaming before its terminal state.
    fn ensure_streaming(&self) {
        self.mark_streaming();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Answer collection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collects the answer text flowing through a callback chain.
#[derive(Default)]
struct AnswerCollector {
    buf: Arc<Mutex<String>>,
}

impl AnswerCollector {
    fn wrap(&self, inner: EventCallback) -> EventCallback {
        let buf = self.buf.clone();
        Arc::new(move |event: AgentEvent| {
            if event.event_type == EVENT_ANSWER {
                if let Some(text) = answer_text(&event.data) {
                    buf.lock().push_str(&text);
                }
            }
            inner(event);
        })
    }

    fn take(&self) -> String {
        std::mem::take(&mut self.buf.lock())
    }
}
