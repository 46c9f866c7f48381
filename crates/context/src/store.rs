//! In-memory context store with TTL eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use av_domain::config::ContextConfig;

use crate::context::ConversationContext;

/// How often the background sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Owns every live [`ConversationContext`]. One mutex guards the map;
/// eviction is a linear sweep against an age threshold.
pub struct ContextStore {
    config: ContextConfig,
    contexts: Mutex<HashMap<String, Arc<ConversationContext>>>,
}

impl ContextStore {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the context for a conversation, creating it on first use.
    pub fn resolve_or_create(&self, conversation_id: &str, user_id: &str) -> Arc<ConversationContext> {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(conversation_id) {
            ctx.touch();
            return ctx.clone();
        }

        let ctx = Arc::new(ConversationContext::new(
            conversation_id,
            user_id,
            self.config.max_turns,
        ));
        contexts.insert(conversation_id.to_string(), ctx.clone());
        tracing::debug!(conversation_id, "conversation context created");
        ctx
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationContext>> {
        self.contexts.lock().get(conversation_id).cloned()
    }

    /// Start the background eviction sweeper. Must be called from within
    /// a tokio runtime; the task stops when `shutdown` is cancelled, so
    /// nothing outlives the owner's teardown.
    pub fn spawn_eviction_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                store.evict_expired();
            }
            tracing::debug!("context eviction sweeper stopped");
        });
    }

    /// Evict contexts idle longer than the configured TTL. Returns the
    /// number removed. O(n) over live contexts.
    pub fn evict_expired(&self) -> usize {
        let cutoff = av_domain::now_ms() - self.config.ttl_ms as i64;
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, ctx| ctx.last_active_ms() >= cutoff);
        let evicted = before - contexts.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = contexts.len(), "evicted idle contexts");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContextStore {
        ContextStore::new(ContextConfig {
            max_turns: 10,
            ttl_ms: 60_000,
        })
    }

    #[test]
    fn resolve_returns_same_context() {
        let store = store();
        let a = store.resolve_or_create("c1", "u1");
        let b = store.resolve_or_create("c1", "u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn distinct_conversations_are_isolated() {
        let store = store();
        let a = store.resolve_or_create("c1", "u1");
        let b = store.resolve_or_create("c2", "u1");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn eviction_drops_idle_contexts_only() {
        let store = store();
        let idle = store.resolve_or_create("idle", "u1");
        store.resolve_or_create("fresh", "u1");

        idle.backdate_activity(120_000);
        let evicted = store.evict_expired();
        assert_eq!(evicted, 1);
        assert!(store.get("idle").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_on_its_interval_and_stops_on_shutdown() {
        let store = Arc::new(store());
        let shutdown = CancellationToken::new();
        store.spawn_eviction_sweeper(shutdown.clone());

        let idle = store.resolve_or_create("idle", "u1");
        idle.backdate_activity(120_000);

        // Past one sweep interval the idle context is gone.
        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.get("idle").is_none());

        shutdown.cancel();
    }
}
