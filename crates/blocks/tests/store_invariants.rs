use av_blocks::{BlockOutcome, BlockStatus, BlockStore, NewBlock, UserInput};
use av_domain::event::StoredEvent;
use av_domain::stats::TokenUsage;

fn complete(store: &BlockStore, block_id: i64, content: &str) {
    store.update_status(block_id, BlockStatus::Streaming).unwrap();
    store
        .complete_block(
            block_id,
            &BlockOutcome {
                assistant_content: content.into(),
                ..Default::default()
            },
        )
        .unwrap();
}

#[test]
fn round_numbers_are_dense_from_zero() {
    let store = BlockStore::open_in_memory().unwrap();
    for i in 0..5 {
        let block = store
            .create_block(NewBlock::message("c1", format!("turn {i}")))
            .unwrap();
        assert_eq!(block.round_number, i);
        complete(&store, block.id, "ok");
    }

    let blocks = store.list_blocks("c1").unwrap();
    let rounds: Vec<i64> = blocks.iter().map(|b| b.round_number).collect();
    assert_eq!(rounds, vec![0, 1, 2, 3, 4]);
}

#[test]
fn round_numbers_are_per_conversation() {
    let store = BlockStore::open_in_memory().unwrap();
    let a = store.create_block(NewBlock::message("conv-a", "x")).unwrap();
    let b = store.create_block(NewBlock::message("conv-b", "y")).unwrap();
    assert_eq!(a.round_number, 0);
    assert_eq!(b.round_number, 0);
}

#[test]
fn separators_take_a_round_number() {
    let store = BlockStore::open_in_memory().unwrap();
    let m = store.create_block(NewBlock::message("c1", "q")).unwrap();
    complete(&store, m.id, "a");
    let sep = store.create_block(NewBlock::separator("c1")).unwrap();
    assert_eq!(sep.round_number, 1);
    assert_eq!(sep.status, BlockStatus::Completed);
    // The round counter keeps going; no gap, no duplicate.
    let next = store.create_block(NewBlock::message("c1", "q2")).unwrap();
    assert_eq!(next.round_number, 2);
}

#[test]
fn at_most_one_active_block_per_conversation() {
    let store = BlockStore::open_in_memory().unwrap();
    store.create_block(NewBlock::message("c1", "first")).unwrap();
    let err = store.create_block(NewBlock::message("c1", "second"));
    assert!(err.is_err(), "second active block must be rejected");
}

#[test]
fn status_machine_is_enforced_by_the_store() {
    let store = BlockStore::open_in_memory().unwrap();
    let block = store.create_block(NewBlock::message("c1", "q")).unwrap();

    // pending -> completed skips streaming: rejected.
    assert!(store
        .complete_block(block.id, &BlockOutcome::default())
        .is_err());

    store.update_status(block.id, BlockStatus::Streaming).unwrap();
    store
        .complete_block(block.id, &BlockOutcome::default())
        .unwrap();

    // No back-transitions from a terminal state.
    assert!(store.update_status(block.id, BlockStatus::Streaming).is_err());
    assert!(store.update_status(block.id, BlockStatus::Error).is_err());
}

#[test]
fn append_user_input_before_completion_only() {
    let store = BlockStore::open_in_memory().unwrap();
    let block = store.create_block(NewBlock::message("c1", "first")).unwrap();
    store.update_status(block.id, BlockStatus::Streaming).unwrap();

    // Scenario: a second input arrives while streaming — it folds into the
    // same block, no new block is created.
    store
        .append_user_input(block.id, UserInput::now("follow-up"))
        .unwrap();
    let reread = store.get_block(block.id).unwrap().unwrap();
    assert_eq!(reread.user_inputs.len(), 2);
    assert_eq!(reread.user_inputs[1].content, "follow-up");

    store
        .complete_block(block.id, &BlockOutcome::default())
        .unwrap();
    assert!(store
        .append_user_input(block.id, UserInput::now("too late"))
        .is_err());

    // After completion a fresh input becomes a new block at round + 1.
    let next = store.create_block(NewBlock::message("c1", "next turn")).unwrap();
    assert_eq!(next.round_number, block.round_number + 1);
}

#[test]
fn event_stream_preserves_order() {
    let store = BlockStore::open_in_memory().unwrap();
    let block = store.create_block(NewBlock::message("c1", "q")).unwrap();

    for i in 0..10 {
        store
            .append_event(
                block.id,
                &StoredEvent {
                    event_type: "progress".into(),
                    data: format!("{i}"),
                    at_ms: i,
                },
            )
            .unwrap();
    }

    let reread = store.get_block(block.id).unwrap().unwrap();
    let order: Vec<String> = reread.event_stream.iter().map(|e| e.data.clone()).collect();
    assert_eq!(order, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
}

#[test]
fn branch_paths_derive_from_parent() {
    let store = BlockStore::open_in_memory().unwrap();
    let root = store.create_block(NewBlock::message("c1", "root")).unwrap();
    complete(&store, root.id, "a");
    assert_eq!(root.branch_path, "0");

    let child = store
        .create_block(NewBlock::message("c1", "branch").with_parent(root.id))
        .unwrap();
    assert_eq!(child.branch_path, "0/0");
    complete(&store, child.id, "b");

    let grandchild = store
        .create_block(NewBlock::message("c1", "deeper").with_parent(child.id))
        .unwrap();
    assert_eq!(grandchild.branch_path, "0/0/1");
}

#[test]
fn latest_block_is_highest_round() {
    let store = BlockStore::open_in_memory().unwrap();
    for i in 0..3 {
        let b = store
            .create_block(NewBlock::message("c1", format!("t{i}")))
            .unwrap();
        complete(&store, b.id, "ok");
    }
    let latest = store.get_latest_block("c1").unwrap().unwrap();
    assert_eq!(latest.round_number, 2);
    assert!(store.get_latest_block("missing").unwrap().is_none());
}

#[test]
fn pending_blocks_ordered_by_creation() {
    let store = BlockStore::open_in_memory().unwrap();
    let a = store.create_block(NewBlock::message("c1", "a")).unwrap();
    let b = store.create_block(NewBlock::message("c2", "b")).unwrap();
    store.update_status(b.id, BlockStatus::Streaming).unwrap();

    let pending = store.get_pending_blocks().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, a.id);
    assert_eq!(pending[1].id, b.id);
}

#[test]
fn recovery_marks_interrupted_blocks() {
    let store = BlockStore::open_in_memory().unwrap();
    let a = store.create_block(NewBlock::message("c1", "a")).unwrap();
    let b = store.create_block(NewBlock::message("c2", "b")).unwrap();
    store.update_status(b.id, BlockStatus::Streaming).unwrap();
    let done = store.create_block(NewBlock::message("c3", "c")).unwrap();
    complete(&store, done.id, "finished");

    let recovered = store.recover_interrupted().unwrap();
    assert_eq!(recovered, 2);

    for id in [a.id, b.id] {
        let block = store.get_block(id).unwrap().unwrap();
        assert_eq!(block.status, BlockStatus::Error);
        assert_eq!(block.error_message.as_deref(), Some("interrupted"));
    }
    let untouched = store.get_block(done.id).unwrap().unwrap();
    assert_eq!(untouched.status, BlockStatus::Completed);
}

#[test]
fn completion_persists_tokens_and_cost() {
    let store = BlockStore::open_in_memory().unwrap();
    let block = store.create_block(NewBlock::message("c1", "q")).unwrap();
    store.update_status(block.id, BlockStatus::Streaming).unwrap();

    store
        .complete_block(
            block.id,
            &BlockOutcome {
                assistant_content: "answer".into(),
                session_stats: None,
                token_usage: Some(TokenUsage {
                    input_tokens: 1200,
                    output_tokens: 340,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                }),
                cost_milli_cents: 27,
                model_version: Some("deepseek-chat".into()),
            },
        )
        .unwrap();

    let reread = store.get_block(block.id).unwrap().unwrap();
    assert_eq!(reread.assistant_content, "answer");
    assert_eq!(reread.cost_milli_cents, 27);
    assert_eq!(reread.token_usage.unwrap().total(), 1540);
    assert_eq!(reread.model_version.as_deref(), Some("deepseek-chat"));
}

#[test]
fn feedback_regenerate_and_archive() {
    let store = BlockStore::open_in_memory().unwrap();
    let block = store.create_block(NewBlock::message("c1", "q")).unwrap();
    complete(&store, block.id, "a");

    store.set_user_feedback(block.id, "helpful").unwrap();
    store.increment_regenerate_count(block.id).unwrap();
    store.increment_regenerate_count(block.id).unwrap();
    store.archive_block(block.id).unwrap();

    let reread = store.get_block(block.id).unwrap().unwrap();
    assert_eq!(reread.user_feedback.as_deref(), Some("helpful"));
    assert_eq!(reread.regenerate_count, 2);
    assert!(reread.archived_at_ms.is_some());
}

#[test]
fn store_survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks.db");

    {
        let store = BlockStore::open(&path).unwrap();
        let block = store.create_block(NewBlock::message("c1", "persisted")).unwrap();
        complete(&store, block.id, "saved");
    }

    let store = BlockStore::open(&path).unwrap();
    let latest = store.get_latest_block("c1").unwrap().unwrap();
    assert_eq!(latest.assistant_content, "saved");
    assert_eq!(latest.user_inputs[0].content, "persisted");
}
