//! The parrot capability contract.
//!
//! A parrot is a polymorphic specialist. Variants satisfy the same
//! operation set; the stats accumulator is shared by composition, not
//! inheritance.

use av_domain::llm::Message;
use av_domain::{EventCallback, Result, SessionStats, TurnContext};

use crate::cognition::Cognition;

#[async_trait::async_trait]
pub trait Parrot: Send + Sync {
    /// Stable agent identifier, also the routing target.
    fn name(&self) -> &str;

    /// Self-description for registries, classifiers and handoff.
    fn self_describe(&self) -> Cognition;

    /// Execute one turn, streaming events to `callback`. The partial
    /// event stream emitted before a failure stands.
    async fn execute(
        &self,
        ctx: &TurnContext,
        user_input: &str,
        history: &[Message],
        callback: EventCallback,
    ) -> Result<()>;

    /// Stats for the most recently completed turn, if any.
    fn session_stats(&self) -> Option<SessionStats>;
}
