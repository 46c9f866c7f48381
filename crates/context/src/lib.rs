//! Conversation context for Aviary.
//!
//! Keeps the hot per-conversation working set in memory: a bounded ring of
//! recent turns, the sticky route, timezone, and plug-in extensions. Full
//! histories live in the block store and are restorable on demand.

pub mod context;
pub mod store;

pub use context::{ConversationContext, RecentTurn, StickyRoute};
pub use store::ContextStore;
