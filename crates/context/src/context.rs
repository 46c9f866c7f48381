//! In-memory per-conversation state.
//!
//! Holds a bounded ring of recent turns, the sticky route with its
//! validity window, the user's timezone, and an opaque extensions map for
//! domain plug-ins. The full history is restorable from the block store;
//! this is only the hot working set.

use std::collections::{HashMap, VecDeque};

use chrono_tz::Tz;
use parking_lot::RwLock;

/// One recent turn kept in the ring.
#[derive(Debug, Clone)]
pub struct RecentTurn {
    pub user_text: String,
    pub assistant_text: String,
    /// The route that served this turn, when one was resolved.
    pub route: Option<String>,
    pub at_ms: i64,
}

/// The sticky route: the last confident routing decision, reusable for
/// short confirmations while its window is live.
#[derive(Debug, Clone)]
pub struct StickyRoute {
    pub route: String,
    pub intent: Option<String>,
    pub confidence: f64,
    pub set_at_ms: i64,
}

#[derive(Debug)]
struct ContextInner {
    timezone: Tz,
    turns: VecDeque<RecentTurn>,
    sticky: Option<StickyRoute>,
    extensions: HashMap<String, serde_json::Value>,
    last_active_ms: i64,
}

/// Thread-safe per-conversation context. Cheap to share (`Arc`) across the
/// router, agents and orchestrator.
#[derive(Debug)]
pub struct ConversationContext {
    conversation_id: String,
    user_id: String,
    max_turns: usize,
    inner: RwLock<ContextInner>,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>, max_turns: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            max_turns: max_turns.max(1),
            inner: RwLock::new(ContextInner {
                timezone: chrono_tz::UTC,
                turns: VecDeque::new(),
                sticky: None,
                extensions: HashMap::new(),
                last_active_ms: av_domain::now_ms(),
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn timezone(&self) -> Tz {
        self.inner.read().timezone
    }

    pub fn set_timezone(&self, tz: Tz) {
        self.inner.write().timezone = tz;
    }

    // ── Turn ring ──────────────────────────────────────────────────

    /// Record a completed turn; the ring drops the oldest entry beyond
    /// the configured capacity.
    pub fn push_turn(&self, turn: RecentTurn) {
        let mut inner = self.inner.write();
        inner.turns.push_back(turn);
        while inner.turns.len() > self.max_turns {
            inner.turns.pop_front();
        }
        inner.last_active_ms = av_domain::now_ms();
    }

    /// Copy of the recent turns, oldest first.
    pub fn recent_turns(&self) -> Vec<RecentTurn> {
        self.inner.read().turns.iter().cloned().collect()
    }

    // ── Sticky route ───────────────────────────────────────────────

    pub fn set_sticky(&self, route: impl Into<String>, intent: Option<String>, confidence: f64) {
        let mut inner = self.inner.write();
        inner.sticky = Some(StickyRoute {
            route: route.into(),
            intent,
            confidence,
            set_at_ms: av_domain::now_ms(),
        });
    }

    /// The sticky route if it is still within `window_ms`.
    pub fn sticky_within(&self, window_ms: u64) -> Option<StickyRoute> {
        let inner = self.inner.read();
        let sticky = inner.sticky.as_ref()?;
        let age = av_domain::now_ms().saturating_sub(sticky.set_at_ms);
        if age >= 0 && (age as u64) < window_ms {
            Some(sticky.clone())
        } else {
            None
        }
    }

    /// Drop the sticky route (significant context change).
    pub fn clear_sticky(&self) {
        self.inner.write().sticky = None;
    }

    // ── Extensions ─────────────────────────────────────────────────

    pub fn set_extension(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().extensions.insert(key.into(), value);
    }

    pub fn extension(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().extensions.get(key).cloned()
    }

    // ── Liveness ───────────────────────────────────────────────────

    pub fn touch(&self) {
        self.inner.write().last_active_ms = av_domain::now_ms();
    }

    pub fn last_active_ms(&self) -> i64 {
        self.inner.read().last_active_ms
    }

    #[cfg(test)]
    pub(crate) fn backdate_sticky(&self, ms: i64) {
        if let Some(sticky) = self.inner.write().sticky.as_mut() {
            sticky.set_at_ms -= ms;
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, ms: i64) {
        self.inner.write().last_active_ms -= ms;
    }
}
