//! The self-modification parrot.
//!
//! Like the geek parrot, but physically isolated: it runs on a dedicated
//! runner instance whose namespace gives different session ids for the
//! same conversation, and only admin turns may use it.

use std::sync::Arc;

use parking_lot::Mutex;

use av_domain::llm::Message;
use av_domain::{Error, EventCallback, ParrotError, Result, SessionStats, TurnContext};
use av_runner::{CodeRunner, ExecuteConfig};

use crate::cognition::Cognition;
use crate::parrot::Parrot;

pub struct EvolutionParrot {
    runner: Arc<CodeRunner>,
    last_stats: Mutex<Option<SessionStats>>,
}

impl EvolutionParrot {
    pub const NAME: &'static str = "evolution";

    /// `runner` must be the evolution-namespace instance, not the geek one.
    pub fn new(runner: Arc<CodeRunner>) -> Self {
        Self {
            runner,
            last_stats: Mutex::new(None),
        }
    }

    fn wrap(err: Error) -> Error {
        Error::Parrot(ParrotError::wrap(Self::NAME, "execute", err))
    }
}

#[async_trait::async_trait]
impl Parrot for EvolutionParrot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn self_describe(&self) -> Cognition {
        Cognition::new(
            Self::NAME,
            "a system-evolution specialist",
            "Modifies the assistant's own configuration and capabilities inside an \
             isolated session. Admin only.",
        )
        .with_capabilities(vec!["self_modification".into(), "code_execution".into()])
    }

    async fn execute(
        &self,
        ctx: &TurnContext,
        user_input: &str,
        _history: &[Message],
        callback: EventCallback,
    ) -> Result<()> {
        if !ctx.is_admin {
            return Err(Self::wrap(Error::Unauthorized(
                "evolution agent requires an admin turn".into(),
            )));
        }

        let config = ExecuteConfig {
            conversation_id: ctx.conversation_id.clone(),
            user_id: ctx.user_id.clone(),
            ..ExecuteConfig::default()
        };

        self.runner
            .execute(&ctx.cancel, config, user_input, callback)
            .await
            .map_err(Self::wrap)?;

        let session_id = self.runner.derive_session_id(&ctx.conversation_id);
        *self.last_stats.lock() = self.runner.session_stats(&session_id);
        Ok(())
    }

    fn session_stats(&self) -> Option<SessionStats> {
        self.last_stats.lock().clone()
    }
}
