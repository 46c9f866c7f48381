//! The block data model — the canonical record of one conversational turn.

use serde::{Deserialize, Serialize};

use av_domain::event::StoredEvent;
use av_domain::stats::{SessionStats, TokenUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Message,
    ContextSeparator,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ContextSeparator => "context_separator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "context_separator" => Some(Self::ContextSeparator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    Normal,
    Geek,
    Evolution,
}

impl BlockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Geek => "geek",
            Self::Evolution => "evolution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "geek" => Some(Self::Geek),
            "evolution" => Some(Self::Evolution),
            _ => None,
        }
    }

    /// Modes backed by a runner session carry session stats on completion.
    pub fn uses_runner(&self) -> bool {
        matches!(self, Self::Geek | Self::Evolution)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Streaming,
    Completed,
    Error,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Strictly forward transitions: `pending → streaming → {completed,
    /// error}`. An interrupted block may go `pending → error` directly
    /// (crash recovery); nothing ever transitions backwards.
    pub fn can_transition_to(&self, next: BlockStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, BlockStatus::Streaming)
                | (Self::Pending, BlockStatus::Error)
                | (Self::Streaming, BlockStatus::Completed)
                | (Self::Streaming, BlockStatus::Error)
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One user input on a block. A block may receive several before it
/// completes (rapid follow-up messages fold into the active turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub content: String,
    pub at_ms: i64,
}

impl UserInput {
    pub fn now(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            at_ms: av_domain::now_ms(),
        }
    }
}

/// The canonical record of one conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub uid: String,
    pub conversation_id: String,
    pub round_number: i64,
    pub block_type: BlockType,
    pub mode: BlockMode,
    pub user_inputs: Vec<UserInput>,
    pub assistant_content: String,
    pub event_stream: Vec<StoredEvent>,
    pub session_stats: Option<SessionStats>,
    pub cc_session_id: Option<String>,
    pub status: BlockStatus,
    pub parent_block_id: Option<i64>,
    pub branch_path: String,
    pub token_usage: Option<TokenUsage>,
    pub cost_milli_cents: i64,
    pub model_version: Option<String>,
    pub user_feedback: Option<String>,
    pub regenerate_count: i64,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub archived_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Parameters for inserting a block. Round number and branch path are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub conversation_id: String,
    pub block_type: BlockType,
    pub mode: BlockMode,
    pub first_input: Option<UserInput>,
    pub cc_session_id: Option<String>,
    pub parent_block_id: Option<i64>,
}

impl NewBlock {
    pub fn message(conversation_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            block_type: BlockType::Message,
            mode: BlockMode::Normal,
            first_input: Some(UserInput::now(input)),
            cc_session_id: None,
            parent_block_id: None,
        }
    }

    pub fn separator(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            block_type: BlockType::ContextSeparator,
            mode: BlockMode::Normal,
            first_input: None,
            cc_session_id: None,
            parent_block_id: None,
        }
    }

    pub fn with_mode(mut self, mode: BlockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_session(mut self, cc_session_id: impl Into<String>) -> Self {
        self.cc_session_id = Some(cc_session_id.into());
        self
    }

    pub fn with_parent(mut self, parent_block_id: i64) -> Self {
        self.parent_block_id = Some(parent_block_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_forward_transitions() {
        use BlockStatus::*;
        assert!(Pending.can_transition_to(Streaming));
        assert!(Pending.can_transition_to(Error));
        assert!(Streaming.can_transition_to(Completed));
        assert!(Streaming.can_transition_to(Error));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Streaming.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Streaming));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Error.can_transition_to(Pending));
    }

    #[test]
    fn enum_string_round_trips() {
        for status in [
            BlockStatus::Pending,
            BlockStatus::Streaming,
            BlockStatus::Completed,
            BlockStatus::Error,
        ] {
            assert_eq!(BlockStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BlockType::parse("context_separator"), Some(BlockType::ContextSeparator));
        assert_eq!(BlockMode::parse("evolution"), Some(BlockMode::Evolution));
        assert_eq!(BlockMode::parse("bogus"), None);
    }

    #[test]
    fn runner_modes() {
        assert!(!BlockMode::Normal.uses_runner());
        assert!(BlockMode::Geek.uses_runner());
        assert!(BlockMode::Evolution.uses_runner());
    }
}
