//! The routing pipeline.
//!
//! Layers, short-circuiting on the first confident answer:
//! 1. sticky reuse (in-memory, short confirmations only)
//! 2. persisted sticky (TTL-live metadata entry, confirmation or
//!    last-intent keyword match)
//! 3. rule matcher
//! 4. history matcher
//! 5. LLM classifier
//!
//! Routing is fast-fail: no layer retries, and any error resolves to the
//! orchestration fallback instead of propagating.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use av_context::ConversationContext;
use av_domain::config::RouterConfig;
use av_domain::TraceEvent;

use crate::classifier::{LlmClassifier, RouteCandidate};
use crate::history::{HistoryMatcher, RoutedUtterance};
use crate::normalize::is_short_confirmation;
use crate::rules::RuleMatcher;
use crate::sticky::{matches_intent_keywords, IntentKeywordProvider, StickyEntry, StickyStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMethod {
    Sticky,
    PersistedSticky,
    Rule,
    History,
    Llm,
    Fallback,
}

impl RouteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sticky => "sticky",
            Self::PersistedSticky => "persisted_sticky",
            Self::Rule => "rule",
            Self::History => "history",
            Self::Llm => "llm",
            Self::Fallback => "fallback",
        }
    }
}

/// The router's answer. An empty route means: escalate to the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: String,
    pub confidence: f64,
    pub method: RouteMethod,
    pub needs_orchestration: bool,
}

impl RouteDecision {
    fn fallback() -> Self {
        Self {
            route: String::new(),
            confidence: 0.5,
            method: RouteMethod::Fallback,
            needs_orchestration: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChatRouter {
    config: RouterConfig,
    rules: RuleMatcher,
    history: HistoryMatcher,
    sticky_store: Arc<dyn StickyStore>,
    keywords: Arc<dyn IntentKeywordProvider>,
    classifier: Option<LlmClassifier>,
    /// Agents the classifier may pick from.
    candidates: Vec<RouteCandidate>,
}

impl ChatRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        rules: RuleMatcher,
        history: HistoryMatcher,
        sticky_store: Arc<dyn StickyStore>,
        keywords: Arc<dyn IntentKeywordProvider>,
        classifier: Option<LlmClassifier>,
        candidates: Vec<RouteCandidate>,
    ) -> Self {
        Self {
            config,
            rules,
            history,
            sticky_store,
            keywords,
            classifier,
            candidates,
        }
    }

    pub fn rules(&self) -> &RuleMatcher {
        &self.rules
    }

    /// Route one utterance. Never fails: errors resolve to the
    /// orchestration fallback.
    pub async fn route(
        &self,
        cancel: &CancellationToken,
        ctx: Option<&ConversationContext>,
        user_id: &str,
        input: &str,
    ) -> RouteDecision {
        let (decision, intent) = match self.route_inner(cancel, ctx, user_id, input).await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(error = %err, "routing failed, falling back to orchestration");
                (RouteDecision::fallback(), None)
            }
        };

        if !decision.route.is_empty() {
            self.persist_sticky(ctx, &decision, intent);
        }

        TraceEvent::RouteResolved {
            conversation_id: ctx.map(|c| c.conversation_id().to_string()).unwrap_or_default(),
            route: decision.route.clone(),
            method: decision.method.as_str().to_string(),
            confidence: decision.confidence,
            needs_orchestration: decision.needs_orchestration,
        }
        .emit();

        decision
    }

    async fn route_inner(
        &self,
        cancel: &CancellationToken,
        ctx: Option<&ConversationContext>,
        user_id: &str,
        input: &str,
    ) -> av_domain::Result<(RouteDecision, Option<String>)> {
        // 1. Sticky reuse: a short confirmation inside the live window
        //    re-enters the previous route without any matching work.
        if let Some(ctx) = ctx {
            if let Some(sticky) = ctx.sticky_within(self.config.sticky_window_ms) {
                if is_short_confirmation(input) {
                    return Ok((
                        RouteDecision {
                            route: sticky.route,
                            confidence: 0.95,
                            method: RouteMethod::Sticky,
                            needs_orchestration: false,
                        },
                        sticky.intent,
                    ));
                }
            }
        }

        // 2. Persisted sticky: survives context eviction; also accepts
        //    inputs matching the last intent's keyword set.
        if let Some(ctx) = ctx {
            if let Some(entry) = self.sticky_store.load(ctx.conversation_id()) {
                if entry.is_live(self.config.persisted_sticky_ttl_ms) && self.reusable(&entry, input)
                {
                    return Ok((
                        RouteDecision {
                            route: entry.route,
                            confidence: entry.confidence,
                            method: RouteMethod::PersistedSticky,
                            needs_orchestration: false,
                        },
                        entry.intent,
                    ));
                }
            }
        }

        // 3. Deterministic rules.
        if let Some(m) = self.rules.match_input(user_id, input) {
            if m.confidence >= self.config.min_rule_confidence {
                return Ok((
                    RouteDecision {
                        route: m.route,
                        confidence: m.confidence,
                        method: RouteMethod::Rule,
                        needs_orchestration: false,
                    },
                    Some(m.intent),
                ));
            }
        }

        // 4. Similarity against recently routed utterances.
        if let Some(ctx) = ctx {
            let history: Vec<RoutedUtterance> = ctx
                .recent_turns()
                .into_iter()
                .filter_map(|turn| {
                    turn.route.map(|route| RoutedUtterance {
                        text: turn.user_text,
                        route,
                    })
                })
                .collect();
            if let Some(m) = self
                .history
                .best_match(input, &history, self.config.min_history_similarity)
                .await?
            {
                return Ok((
                    RouteDecision {
                        route: m.route,
                        confidence: m.similarity,
                        method: RouteMethod::History,
                        needs_orchestration: false,
                    },
                    None,
                ));
            }
        }

        // 5. Last resort: ask the model.
        if let Some(classifier) = &self.classifier {
            let decision = classifier.classify(cancel, input, &self.candidates).await?;
            if let Some(route) = decision.route {
                return Ok((
                    RouteDecision {
                        route,
                        confidence: decision.confidence,
                        method: RouteMethod::Llm,
                        needs_orchestration: decision.needs_orchestration,
                    },
                    None,
                ));
            }
        }

        Ok((RouteDecision::fallback(), None))
    }

    fn reusable(&self, entry: &StickyEntry, input: &str) -> bool {
        if is_short_confirmation(input) {
            return true;
        }
        match &entry.intent {
            Some(intent) => {
                let keywords = self.keywords.keywords_for(intent);
                matches_intent_keywords(input, &keywords)
            }
            None => false,
        }
    }

    fn persist_sticky(
        &self,
        ctx: Option<&ConversationContext>,
        decision: &RouteDecision,
        intent: Option<String>,
    ) {
        let Some(ctx) = ctx else { return };
        ctx.set_sticky(decision.route.clone(), intent.clone(), decision.confidence);
        self.sticky_store.save(
            ctx.conversation_id(),
            StickyEntry {
                route: decision.route.clone(),
                intent,
                confidence: decision.confidence,
                set_at_ms: av_domain::now_ms(),
            },
        );
    }
}
