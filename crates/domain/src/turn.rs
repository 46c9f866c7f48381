//! Per-request execution context passed down through router, agents and
//! orchestrator.

use tokio_util::sync::CancellationToken;

/// Context for one chat turn. Cancelling the token aborts downstream LLM
/// and tool work and the event stream, but never a runner session.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: String,
    pub user_id: String,
    /// Correlates every event and log line of this turn.
    pub trace_id: String,
    /// Admin turns may bypass the danger gate and use evolution agents.
    pub is_admin: bool,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            is_admin: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    /// Derive a child context whose cancellation follows this one.
    pub fn child(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            trace_id: self.trace_id.clone(),
            is_admin: self.is_admin,
            cancel: self.cancel.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_token_follows_parent_cancellation() {
        let ctx = TurnContext::new("c1", "u1");
        let child = ctx.child();
        assert!(!child.cancel.is_cancelled());
        ctx.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn cancelling_child_leaves_parent_alive() {
        let ctx = TurnContext::new("c1", "u1");
        let child = ctx.child();
        child.cancel.cancel();
        assert!(!ctx.cancel.is_cancelled());
    }
}
