//! Integration tests against a fake line-framed CLI (a small shell loop
//! that answers every prompt with an assistant + result envelope pair).

#![cfg(unix)]

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use av_domain::config::{RunnerConfig, RunnerNamespaces};
use av_domain::event::AgentEvent;
use av_domain::EventCallback;
use av_runner::{CodeRunner, ExecuteConfig};

/// Answers each stdin line with one assistant and one result envelope;
/// exits on the shutdown sentinel.
const FAKE_CLI: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
  esac
  printf '%s\n' '{"type":"thinking","text":"hm"}'
  printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}'
  printf '%s\n' '{"type":"telemetry","lag_ms":1}'
  printf '%s\n' '{"type":"result","total_cost_usd":0.01,"input_tokens":10,"output_tokens":5,"tools_used":["exec"],"model":"fake-cli"}'
done
"#;

fn fake_config(work_dir: &std::path::Path) -> RunnerConfig {
    RunnerConfig {
        command: "sh".into(),
        args: vec!["-c".into(), FAKE_CLI.into()],
        work_dir: work_dir.to_path_buf(),
        ..RunnerConfig::default()
    }
}

fn collecting_callback() -> (EventCallback, Arc<Mutex<Vec<AgentEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));
    (callback, seen)
}

#[tokio::test]
async fn hot_session_reuse_spawns_one_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let ns = RunnerNamespaces::default();
    let runner = CodeRunner::new(ns.geek, fake_config(dir.path()), None);
    let cancel = CancellationToken::new();

    let expected_id = runner.derive_session_id("42");

    for turn in 0..2 {
        let (callback, seen) = collecting_callback();
        let config = ExecuteConfig {
            conversation_id: "42".into(),
            user_id: "u1".into(),
            ..ExecuteConfig::default()
        };
        let result = runner
            .execute(&cancel, config, &format!("turn {turn}"), callback)
            .await
            .unwrap();

        assert!((result.total_cost_usd - 0.01).abs() < 1e-9);
        let events = seen.lock();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["thinking", "answer", "telemetry", "session_stats"],
            "events arrive in order, unknown types pass through"
        );

        // Exactly one entry in the session map, under the derived id.
        assert_eq!(runner.session_count(), 1);
        assert!(runner.session_stats(&expected_id).is_some());
    }

    // Stats accumulated across both turns of the same subprocess.
    let stats = runner.session_stats(&expected_id).unwrap();
    assert_eq!(stats.tokens.input_tokens, 20);
    assert_eq!(stats.tokens.output_tokens, 10);
    assert_eq!(stats.cost_milli_cents, 2_000);
    assert_eq!(stats.model_name, "fake-cli");
    assert!(stats.tool_names.contains("exec"));

    runner.close().await;
    assert_eq!(runner.session_count(), 0);
}

#[tokio::test]
async fn answer_text_prefers_nested_message_content() {
    let dir = tempfile::tempdir().unwrap();
    let ns = RunnerNamespaces::default();
    let runner = CodeRunner::new(ns.geek, fake_config(dir.path()), None);
    let cancel = CancellationToken::new();

    let (callback, seen) = collecting_callback();
    runner
        .execute(
            &cancel,
            ExecuteConfig {
                conversation_id: "7".into(),
                ..ExecuteConfig::default()
            },
            "hello",
            callback,
        )
        .await
        .unwrap();

    let events = seen.lock();
    let answer = events.iter().find(|e| e.event_type == "answer").unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&answer.data).unwrap();
    assert_eq!(envelope["data"]["content"], "done");
    assert_eq!(envelope["meta"]["session_id"], runner.derive_session_id("7"));

    runner.close().await;
}

#[tokio::test]
async fn caller_cancellation_leaves_the_session_alive() {
    let dir = tempfile::tempdir().unwrap();
    let ns = RunnerNamespaces::default();
    let runner = CodeRunner::new(ns.geek, fake_config(dir.path()), None);

    // First turn completes normally so the session exists.
    let cancel = CancellationToken::new();
    let (callback, _) = collecting_callback();
    runner
        .execute(
            &cancel,
            ExecuteConfig {
                conversation_id: "9".into(),
                ..ExecuteConfig::default()
            },
            "warm up",
            callback,
        )
        .await
        .unwrap();

    // A cancelled caller detaches but must not kill the subprocess.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let (callback, _) = collecting_callback();
    let err = runner
        .execute(
            &cancelled,
            ExecuteConfig {
                conversation_id: "9".into(),
                ..ExecuteConfig::default()
            },
            "never observed",
            callback,
        )
        .await;
    assert!(err.is_err());
    assert_eq!(runner.session_count(), 1, "session survives caller cancellation");

    // Give the detached turn's output time to arrive as stale events.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    // The session still serves later turns.
    let (callback, seen) = collecting_callback();
    runner
        .execute(
            &cancel,
            ExecuteConfig {
                conversation_id: "9".into(),
                ..ExecuteConfig::default()
            },
            "back again",
            callback,
        )
        .await
        .unwrap();
    assert!(seen.lock().iter().any(|e| e.event_type == "session_stats"));

    runner.close().await;
}

#[tokio::test]
async fn explicit_stop_removes_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let ns = RunnerNamespaces::default();
    let runner = CodeRunner::new(ns.geek, fake_config(dir.path()), None);
    let cancel = CancellationToken::new();

    let (callback, _) = collecting_callback();
    runner
        .execute(
            &cancel,
            ExecuteConfig {
                conversation_id: "13".into(),
                ..ExecuteConfig::default()
            },
            "hi",
            callback,
        )
        .await
        .unwrap();
    assert_eq!(runner.session_count(), 1);

    let session_id = runner.derive_session_id("13");
    runner.stop(&session_id, "operator request").await.unwrap();
    assert_eq!(runner.session_count(), 0);

    runner.close().await;
}

#[tokio::test]
async fn startup_timeout_marks_the_session_errored() {
    let dir = tempfile::tempdir().unwrap();
    let ns = RunnerNamespaces::default();
    // A CLI that swallows input and never answers.
    let config = RunnerConfig {
        command: "sh".into(),
        args: vec!["-c".into(), "while IFS= read -r line; do :; done".into()],
        work_dir: dir.path().to_path_buf(),
        startup_timeout_ms: 300,
        drain_timeout_ms: 300,
        ..RunnerConfig::default()
    };
    let runner = CodeRunner::new(ns.geek, config, None);
    let cancel = CancellationToken::new();

    let (callback, _) = collecting_callback();
    let err = runner
        .execute(
            &cancel,
            ExecuteConfig {
                conversation_id: "silent".into(),
                ..ExecuteConfig::default()
            },
            "hello?",
            callback,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, av_domain::Error::Timeout(_)));

    runner.close().await;
}
