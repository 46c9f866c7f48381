//! Read-only compatibility view projecting blocks into legacy
//! `{role, content}` message pairs.

use serde::{Deserialize, Serialize};

use av_domain::error::Result;

use crate::model::{Block, BlockStatus, BlockType};
use crate::store::BlockStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMessage {
    pub role: String,
    pub content: String,
}

/// Project a conversation into the legacy message format: one user message
/// (from `user_inputs[0]`) and one assistant message per completed
/// `message` block, ordered by round. Separators and archived blocks are
/// excluded.
pub fn legacy_messages(store: &BlockStore, conversation_id: &str) -> Result<Vec<LegacyMessage>> {
    let blocks = store.list_blocks(conversation_id)?;
    let mut messages = Vec::new();
    for block in &blocks {
        if !projects_to_legacy(block) {
            continue;
        }
        if let Some(first) = block.user_inputs.first() {
            messages.push(LegacyMessage {
                role: "user".into(),
                content: first.content.clone(),
            });
        }
        if !block.assistant_content.is_empty() {
            messages.push(LegacyMessage {
                role: "assistant".into(),
                content: block.assistant_content.clone(),
            });
        }
    }
    Ok(messages)
}

fn projects_to_legacy(block: &Block) -> bool {
    block.block_type == BlockType::Message
        && block.status == BlockStatus::Completed
        && block.archived_at_ms.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewBlock;
    use crate::store::BlockOutcome;

    #[test]
    fn projects_completed_messages_only() {
        let store = BlockStore::open_in_memory().unwrap();

        let b0 = store.create_block(NewBlock::message("c1", "hello")).unwrap();
        store.update_status(b0.id, BlockStatus::Streaming).unwrap();
        store
            .complete_block(
                b0.id,
                &BlockOutcome {
                    assistant_content: "hi there".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        // A separator and an in-flight block must not appear.
        store.create_block(NewBlock::separator("c1")).unwrap();
        store.create_block(NewBlock::message("c1", "pending q")).unwrap();

        let messages = legacy_messages(&store, "c1").unwrap();
        assert_eq!(
            messages,
            vec![
                LegacyMessage {
                    role: "user".into(),
                    content: "hello".into()
                },
                LegacyMessage {
                    role: "assistant".into(),
                    content: "hi there".into()
                },
            ]
        );
    }

    #[test]
    fn archived_blocks_are_excluded() {
        let store = BlockStore::open_in_memory().unwrap();
        let b = store.create_block(NewBlock::message("c1", "q")).unwrap();
        store.update_status(b.id, BlockStatus::Streaming).unwrap();
        store
            .complete_block(
                b.id,
                &BlockOutcome {
                    assistant_content: "a".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        store.archive_block(b.id).unwrap();
        assert!(legacy_messages(&store, "c1").unwrap().is_empty());
    }
}
