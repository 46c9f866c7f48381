//! Persisted sticky routing state.
//!
//! Beyond the in-memory sticky route on the conversation context, the
//! router keeps a per-conversation metadata entry that survives context
//! eviction. It is reusable while its TTL is live, for short confirmations
//! or inputs matching the last intent's keyword set.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A persisted routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickyEntry {
    pub route: String,
    pub intent: Option<String>,
    pub confidence: f64,
    pub set_at_ms: i64,
}

impl StickyEntry {
    pub fn is_live(&self, ttl_ms: u64) -> bool {
        let age = av_domain::now_ms().saturating_sub(self.set_at_ms);
        age >= 0 && (age as u64) < ttl_ms
    }
}

/// Storage for persisted sticky entries.
pub trait StickyStore: Send + Sync {
    fn load(&self, conversation_id: &str) -> Option<StickyEntry>;
    fn save(&self, conversation_id: &str, entry: StickyEntry);
    fn clear(&self, conversation_id: &str);
}

/// Supplies the keyword set for an intent, used to extend sticky reuse
/// beyond bare confirmations.
pub trait IntentKeywordProvider: Send + Sync {
    fn keywords_for(&self, intent: &str) -> Vec<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory sticky store.
#[derive(Default)]
pub struct MemoryStickyStore {
    entries: Mutex<HashMap<String, StickyEntry>>,
}

impl MemoryStickyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StickyStore for MemoryStickyStore {
    fn load(&self, conversation_id: &str) -> Option<StickyEntry> {
        self.entries.lock().get(conversation_id).cloned()
    }

    fn save(&self, conversation_id: &str, entry: StickyEntry) {
        self.entries.lock().insert(conversation_id.to_string(), entry);
    }

    fn clear(&self, conversation_id: &str) {
        self.entries.lock().remove(conversation_id);
    }
}

/// Static intent → keywords table.
pub struct StaticKeywordProvider {
    keywords: HashMap<String, Vec<String>>,
}

impl StaticKeywordProvider {
    pub fn new(keywords: HashMap<String, Vec<String>>) -> Self {
        Self { keywords }
    }

    pub fn empty() -> Self {
        Self {
            keywords: HashMap::new(),
        }
    }
}

impl IntentKeywordProvider for StaticKeywordProvider {
    fn keywords_for(&self, intent: &str) -> Vec<String> {
        self.keywords.get(intent).cloned().unwrap_or_default()
    }
}

/// Whether `input` matches the intent's keyword set (case-insensitive
/// substring).
pub fn matches_intent_keywords(input: &str, keywords: &[String]) -> bool {
    let lower = input.to_lowercase();
    keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ttl() {
        let live = StickyEntry {
            route: "schedule".into(),
            intent: None,
            confidence: 0.9,
            set_at_ms: av_domain::now_ms() - 1_000,
        };
        assert!(live.is_live(300_000));

        let stale = StickyEntry {
            set_at_ms: av_domain::now_ms() - 600_000,
            ..live
        };
        assert!(!stale.is_live(300_000));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStickyStore::new();
        assert!(store.load("c1").is_none());

        store.save(
            "c1",
            StickyEntry {
                route: "note".into(),
                intent: Some("note".into()),
                confidence: 0.8,
                set_at_ms: av_domain::now_ms(),
            },
        );
        assert_eq!(store.load("c1").unwrap().route, "note");

        store.clear("c1");
        assert!(store.load("c1").is_none());
    }

    #[test]
    fn keyword_matching_is_case_insensitive() {
        let keywords = vec!["Meeting".to_string(), "日程".to_string()];
        assert!(matches_intent_keywords("move my MEETING", &keywords));
        assert!(matches_intent_keywords("明天的日程怎么样", &keywords));
        assert!(!matches_intent_keywords("unrelated", &keywords));
    }
}
