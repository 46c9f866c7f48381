//! The code-execution parrot: a thin wrapper over the runner.
//!
//! All reasoning happens inside the subprocess session; the parrot only
//! derives the execute config from the turn context, forwards the stream,
//! and keeps the final stats snapshot. The subprocess manages its own
//! transcript, so history is not forwarded.

use std::sync::Arc;

use parking_lot::Mutex;

use av_domain::llm::Message;
use av_domain::{Error, EventCallback, ParrotError, Result, SessionStats, TurnContext};
use av_runner::{CodeRunner, ExecuteConfig};

use crate::cognition::Cognition;
use crate::parrot::Parrot;

pub struct GeekParrot {
    runner: Arc<CodeRunner>,
    last_stats: Mutex<Option<SessionStats>>,
}

impl GeekParrot {
    pub const NAME: &'static str = "geek";

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
impl Parrot for GeekParrot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn self_describe(&self) -> Cognition {
        Cognition::new(
            Self::NAME,
            "a code-execution specialist",
            "Writes and runs code inside a persistent sandboxed session; use for \
             programming, debugging, scripting and file manipulation tasks.",
        )
        .with_capabilities(vec!["code_execution".into(), "file_edit".into(), "shell".into()])
    }

    async fn execute(
        &self,
        ctx: &TurnContext,
        user_input: &str,
        _history: &[Message],
        callback: EventCallback,
    ) -> Result<()> {
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
