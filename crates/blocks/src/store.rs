//! SQLite-backed block store.
//!
//! Round numbers are assigned inside the insert transaction
//! (`max(round_number)+1` per conversation, dense from 0), branch paths are
//! derived from the parent at insert, and status transitions enforce the
//! `pending → streaming → {completed, error}` machine. All JSON-typed
//! columns are serialised text read back through serde. Parameterised
//! queries only.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use av_domain::error::{Error, Result};
use av_domain::event::StoredEvent;
use av_domain::stats::{SessionStats, TokenUsage};
use av_domain::TraceEvent;

use crate::model::{Block, BlockMode, BlockStatus, BlockType, NewBlock, UserInput};

/// The block store. The connection is guarded by one mutex; every public
/// operation is a single transaction.
pub struct BlockStore {
    conn: Mutex<Connection>,
}

impl BlockStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("open {}: {e}", db_path.display())))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("open in-memory: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                round_number INTEGER NOT NULL,
                block_type TEXT NOT NULL DEFAULT 'message',
                mode TEXT NOT NULL DEFAULT 'normal',
                user_inputs TEXT NOT NULL DEFAULT '[]',
                assistant_content TEXT NOT NULL DEFAULT '',
                event_stream TEXT NOT NULL DEFAULT '[]',
                session_stats TEXT,
                cc_session_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                parent_block_id INTEGER,
                branch_path TEXT NOT NULL,
                token_usage TEXT,
                cost_milli_cents INTEGER NOT NULL DEFAULT 0,
                model_version TEXT,
                user_feedback TEXT,
                regenerate_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                archived_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                UNIQUE (conversation_id, round_number)
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_conv_round
                ON blocks(conversation_id, round_number DESC);
            CREATE INDEX IF NOT EXISTS idx_blocks_status
                ON blocks(status);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ── Inserts ────────────────────────────────────────────────────

    /// Insert a block. Assigns `round_number = max+1` for the conversation
    /// and derives `branch_path` from the parent, inside one transaction.
    /// Rejects the insert while the conversation still has a non-terminal
    /// block (at most one active turn per conversation).
    pub fn create_block(&self, new: NewBlock) -> Result<Block> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        if new.block_type == BlockType::Message {
            let active: Option<i64> = tx
                .query_row(
                    "SELECT id FROM blocks
                     WHERE conversation_id = ?1 AND status IN ('pending', 'streaming')
                     LIMIT 1",
                    params![new.conversation_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if let Some(id) = active {
                return Err(Error::Conflict {
                    message: format!(
                        "conversation {} already has active block {id}",
                        new.conversation_id
                    ),
                    action_hint: Some("append_user_input".into()),
                });
            }
        }

        let round: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(round_number) + 1, 0) FROM blocks
                 WHERE conversation_id = ?1",
                params![new.conversation_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let branch_path = match new.parent_block_id {
            Some(parent_id) => {
                let (parent_path, parent_round): (String, i64) = tx
                    .query_row(
                        "SELECT branch_path, round_number FROM blocks WHERE id = ?1",
                        params![parent_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(db_err)?
                    .ok_or_else(|| Error::Database(format!("parent block {parent_id} not found")))?;
                format!("{parent_path}/{parent_round}")
            }
            None => round.to_string(),
        };

        let uid = uuid::Uuid::new_v4().to_string();
        let now = av_domain::now_ms();
        let user_inputs: Vec<UserInput> = new.first_input.into_iter().collect();
        // Separators are inert records: born terminal, never streamed.
        let status = match new.block_type {
            BlockType::Message => BlockStatus::Pending,
            BlockType::ContextSeparator => BlockStatus::Completed,
        };

        tx.execute(
            r#"
            INSERT INTO blocks (
                uid, conversation_id, round_number, block_type, mode,
                user_inputs, cc_session_id, status, parent_block_id,
                branch_path, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                uid,
                new.conversation_id,
                round,
                new.block_type.as_str(),
                new.mode.as_str(),
                to_json(&user_inputs)?,
                new.cc_session_id,
                status.as_str(),
                new.parent_block_id,
                branch_path,
                now,
                now,
            ],
        )
        .map_err(db_err)?;

        let id = tx.last_insert_rowid();
        let block = Self::fetch_block(&tx, id)?;
        tx.commit().map_err(db_err)?;

        TraceEvent::BlockCreated {
            conversation_id: block.conversation_id.clone(),
            block_uid: block.uid.clone(),
            round_number: block.round_number,
            mode: block.mode.as_str().to_string(),
        }
        .emit();

        Ok(block)
    }

    // ── Appends ────────────────────────────────────────────────────

    /// Append a user input. Permitted only while the block has not
    /// completed.
    pub fn append_user_input(&self, block_id: i64, input: UserInput) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let (status_str, inputs_json): (String, String) = tx
            .query_row(
                "SELECT status, user_inputs FROM blocks WHERE id = ?1",
                params![block_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::Database(format!("block {block_id} not found")))?;

        if status_str == "completed" {
            return Err(Error::Conflict {
                message: format!("block {block_id} already completed"),
                action_hint: Some("create_block".into()),
            });
        }

        let mut inputs: Vec<UserInput> = from_json(&inputs_json)?;
        inputs.push(input);

        tx.execute(
            "UPDATE blocks SET user_inputs = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![to_json(&inputs)?, av_domain::now_ms(), block_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Append one event to the block's event stream.
    pub fn append_event(&self, block_id: i64, event: &StoredEvent) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let stream_json: String = tx
            .query_row(
                "SELECT event_stream FROM blocks WHERE id = ?1",
                params![block_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::Database(format!("block {block_id} not found")))?;

        let mut stream: Vec<StoredEvent> = from_json(&stream_json)?;
        stream.push(event.clone());

        tx.execute(
            "UPDATE blocks SET event_stream = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![to_json(&stream)?, av_domain::now_ms(), block_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    // ── Status transitions ─────────────────────────────────────────

    /// Move a block to `next`, enforcing the status machine.
    pub fn update_status(&self, block_id: i64, next: BlockStatus) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::transition(&tx, block_id, next)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn transition(tx: &rusqlite::Transaction<'_>, block_id: i64, next: BlockStatus) -> Result<()> {
        let current_str: String = tx
            .query_row(
                "SELECT status FROM blocks WHERE id = ?1",
                params![block_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::Database(format!("block {block_id} not found")))?;

        let current = BlockStatus::parse(&current_str)
            .ok_or_else(|| Error::Database(format!("block {block_id} has bad status {current_str}")))?;

        if !current.can_transition_to(next) {
            return Err(Error::Conflict {
                message: format!(
                    "illegal status transition {} -> {} on block {block_id}",
                    current.as_str(),
                    next.as_str()
                ),
                action_hint: None,
            });
        }

        tx.execute(
            "UPDATE blocks SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![next.as_str(), av_domain::now_ms(), block_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Complete a block: assistant content, stats, tokens, cost, and model
    /// version are persisted together with the terminal transition.
    pub fn complete_block(&self, block_id: i64, outcome: &BlockOutcome) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::transition(&tx, block_id, BlockStatus::Completed)?;

        let uid: String = tx
            .query_row(
                "SELECT uid FROM blocks WHERE id = ?1",
                params![block_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        tx.execute(
            r#"
            UPDATE blocks SET
                assistant_content = ?1,
                session_stats = ?2,
                token_usage = ?3,
                cost_milli_cents = ?4,
                model_version = ?5,
                updated_at_ms = ?6
            WHERE id = ?7
            "#,
            params![
                outcome.assistant_content,
                outcome
                    .session_stats
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                outcome.token_usage.as_ref().map(to_json).transpose()?,
                outcome.cost_milli_cents,
                outcome.model_version,
                av_domain::now_ms(),
                block_id,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        TraceEvent::BlockCompleted {
            block_uid: uid,
            status: "completed".into(),
            cost_milli_cents: outcome.cost_milli_cents,
            total_tokens: outcome
                .token_usage
                .as_ref()
                .map(TokenUsage::total)
                .unwrap_or(0),
        }
        .emit();
        Ok(())
    }

    /// Mark a block failed with an error message.
    pub fn fail_block(&self, block_id: i64, error_message: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::transition(&tx, block_id, BlockStatus::Error)?;
        tx.execute(
            "UPDATE blocks SET error_message = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![error_message, av_domain::now_ms(), block_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_block(&self, block_id: i64) -> Result<Option<Block>> {
        let conn = self.conn.lock();
        let block = conn
            .query_row(
                &format!("{SELECT_BLOCK} WHERE id = ?1"),
                params![block_id],
                row_to_block,
            )
            .optional()
            .map_err(db_err)?;
        Ok(block)
    }

    pub fn get_block_by_uid(&self, uid: &str) -> Result<Option<Block>> {
        let conn = self.conn.lock();
        let block = conn
            .query_row(
                &format!("{SELECT_BLOCK} WHERE uid = ?1"),
                params![uid],
                row_to_block,
            )
            .optional()
            .map_err(db_err)?;
        Ok(block)
    }

    /// The block with the largest round number for a conversation.
    pub fn get_latest_block(&self, conversation_id: &str) -> Result<Option<Block>> {
        let conn = self.conn.lock();
        let block = conn
            .query_row(
                &format!(
                    "{SELECT_BLOCK} WHERE conversation_id = ?1
                     ORDER BY round_number DESC LIMIT 1"
                ),
                params![conversation_id],
                row_to_block,
            )
            .optional()
            .map_err(db_err)?;
        Ok(block)
    }

    /// All non-terminal blocks ordered by creation time ascending.
    /// Used by crash recovery.
    pub fn get_pending_blocks(&self) -> Result<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_BLOCK} WHERE status IN ('pending', 'streaming')
                 ORDER BY created_at_ms ASC"
            ))
            .map_err(db_err)?;
        let blocks = stmt
            .query_map([], row_to_block)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(blocks)
    }

    /// All blocks of a conversation ordered by round number ascending.
    pub fn list_blocks(&self, conversation_id: &str) -> Result<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_BLOCK} WHERE conversation_id = ?1
                 ORDER BY round_number ASC"
            ))
            .map_err(db_err)?;
        let blocks = stmt
            .query_map(params![conversation_id], row_to_block)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(blocks)
    }

    // ── Post-completion updates ────────────────────────────────────

    pub fn set_user_feedback(&self, block_id: i64, feedback: &str) -> Result<()> {
        self.simple_update(
            "UPDATE blocks SET user_feedback = ?1, updated_at_ms = ?2 WHERE id = ?3",
            block_id,
            feedback,
        )
    }

    pub fn increment_regenerate_count(&self, block_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE blocks SET regenerate_count = regenerate_count + 1,
                 updated_at_ms = ?1 WHERE id = ?2",
                params![av_domain::now_ms(), block_id],
            )
            .map_err(db_err)?;
        ensure_found(changed, block_id)
    }

    pub fn archive_block(&self, block_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let now = av_domain::now_ms();
        let changed = conn
            .execute(
                "UPDATE blocks SET archived_at_ms = ?1, updated_at_ms = ?1 WHERE id = ?2",
                params![now, block_id],
            )
            .map_err(db_err)?;
        ensure_found(changed, block_id)
    }

    fn simple_update(&self, sql: &str, block_id: i64, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(sql, params![value, av_domain::now_ms(), block_id])
            .map_err(db_err)?;
        ensure_found(changed, block_id)
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Startup pass: every block left pending/streaming by a crash is
    /// marked `error` with an "interrupted" message. Returns the count.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE blocks SET status = 'error', error_message = 'interrupted',
                 updated_at_ms = ?1 WHERE status IN ('pending', 'streaming')",
                params![av_domain::now_ms()],
            )
            .map_err(db_err)?;
        if changed > 0 {
            tracing::warn!(blocks = changed, "marked interrupted blocks as error");
        }
        TraceEvent::RecoveryCompleted {
            interrupted_blocks: changed,
        }
        .emit();
        Ok(changed)
    }

    fn fetch_block(tx: &rusqlite::Transaction<'_>, id: i64) -> Result<Block> {
        tx.query_row(&format!("{SELECT_BLOCK} WHERE id = ?1"), params![id], row_to_block)
            .map_err(db_err)
    }
}

/// Everything that lands on a block at completion.
#[derive(Debug, Clone, Default)]
pub struct BlockOutcome {
    pub assistant_content: String,
    pub session_stats: Option<SessionStats>,
    pub token_usage: Option<TokenUsage>,
    pub cost_milli_cents: i64,
    pub model_version: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SELECT_BLOCK: &str = r#"
    SELECT id, uid, conversation_id, round_number, block_type, mode,
           user_inputs, assistant_content, event_stream, session_stats,
           cc_session_id, status, parent_block_id, branch_path, token_usage,
           cost_milli_cents, model_version, user_feedback, regenerate_count,
           error_message, metadata, archived_at_ms, created_at_ms,
           updated_at_ms
    FROM blocks
"#;

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
    let block_type_str: String = row.get(4)?;
    let mode_str: String = row.get(5)?;
    let status_str: String = row.get(11)?;
    let user_inputs_json: String = row.get(6)?;
    let event_stream_json: String = row.get(8)?;
    let session_stats_json: Option<String> = row.get(9)?;
    let token_usage_json: Option<String> = row.get(14)?;
    let metadata_json: String = row.get(20)?;

    Ok(Block {
        id: row.get(0)?,
        uid: row.get(1)?,
        conversation_id: row.get(2)?,
        round_number: row.get(3)?,
        block_type: BlockType::parse(&block_type_str).unwrap_or(BlockType::Message),
        mode: BlockMode::parse(&mode_str).unwrap_or(BlockMode::Normal),
        user_inputs: serde_json::from_str(&user_inputs_json).unwrap_or_default(),
        assistant_content: row.get(7)?,
        event_stream: serde_json::from_str(&event_stream_json).unwrap_or_default(),
        session_stats: session_stats_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        cc_session_id: row.get(10)?,
        status: BlockStatus::parse(&status_str).unwrap_or(BlockStatus::Error),
        parent_block_id: row.get(12)?,
        branch_path: row.get(13)?,
        token_usage: token_usage_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        cost_milli_cents: row.get(15)?,
        model_version: row.get(16)?,
        user_feedback: row.get(17)?,
        regenerate_count: row.get(18)?,
        error_message: row.get(19)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        archived_at_ms: row.get(21)?,
        created_at_ms: row.get(22)?,
        updated_at_ms: row.get(23)?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

fn ensure_found(changed: usize, block_id: i64) -> Result<()> {
    if changed == 0 {
        Err(Error::Database(format!("block {block_id} not found")))
    } else {
        Ok(())
    }
}
