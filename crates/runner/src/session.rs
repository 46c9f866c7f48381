//! One hot subprocess session.
//!
//! A session wraps a long-running external CLI process speaking the
//! line-framed JSON protocol. It is owned exclusively by the runner;
//! agents borrow it through the session id. Caller cancellation never
//! kills the process — only an explicit stop or idle expiry does.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use av_domain::config::RunnerConfig;
use av_domain::event::AgentEvent;
use av_domain::{Error, EventCallback, Result, TraceEvent};

use crate::protocol::{
    self, EventMeta, EventWithMeta, PromptMessage, ResultPayload, SubprocessEvent,
};
use crate::stats::SessionAccumulator;

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Draining,
    Closed,
    Errored,
}

struct SessionIo {
    stdin: ChildStdin,
    child: Child,
    events: mpsc::UnboundedReceiver<Result<SubprocessEvent>>,
    pid: Option<u32>,
}

pub struct Session {
    id: String,
    config: RunnerConfig,
    work_dir: PathBuf,
    state: Mutex<SessionState>,
    io: tokio::sync::Mutex<Option<SessionIo>>,
    /// Serialises Execute calls on this session.
    exec_lock: tokio::sync::Mutex<()>,
    stats: Arc<SessionAccumulator>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    task_instructions: Mutex<Option<String>>,
    device_context: Mutex<Option<String>>,
    last_active_ms: AtomicI64,
    sequence: AtomicU64,
    turns: AtomicU64,
    /// Unknown envelope types seen (counted, never an error).
    unknown_events: AtomicU64,
}

impl Session {
    pub fn new(id: String, config: RunnerConfig, work_dir: PathBuf) -> Self {
        Self {
            id,
            config,
            work_dir,
            state: Mutex::new(SessionState::Idle),
            io: tokio::sync::Mutex::new(None),
            exec_lock: tokio::sync::Mutex::new(()),
            stats: Arc::new(SessionAccumulator::new()),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            task_instructions: Mutex::new(None),
            device_context: Mutex::new(None),
            last_active_ms: AtomicI64::new(av_domain::now_ms()),
            sequence: AtomicU64::new(0),
            turns: AtomicU64::new(0),
            unknown_events: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn stats_snapshot(&self) -> av_domain::SessionStats {
        self.stats.snapshot()
    }

    pub fn unknown_event_count(&self) -> u64 {
        self.unknown_events.load(Ordering::SeqCst)
    }

    /// Session-persistent task instructions: the first non-empty set wins.
    pub fn set_task_instructions_once(&self, instructions: &str) {
        let mut slot = self.task_instructions.lock();
        if slot.is_none() && !instructions.is_empty() {
            *slot = Some(instructions.to_string());
        }
    }

    pub fn set_device_context_once(&self, device_context: &str) {
        let mut slot = self.device_context.lock();
        if slot.is_none() && !device_context.is_empty() {
            *slot = Some(device_context.to_string());
        }
    }

    // ── Execute ────────────────────────────────────────────────────

    /// Run one turn: write the prompt, stream parsed events to `callback`
    /// in order, return when the terminal `result` arrives.
    ///
    /// `cancel` detaches this caller from the stream; the subprocess keeps
    /// running and its stats keep accumulating.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        callback: &EventCallback,
    ) -> Result<ResultPayload> {
        let _turn = self.exec_lock.lock().await;
        self.touch();

        let mut io = self.io.lock().await;
        if io.is_none() {
            *io = Some(self.spawn()?);
            *self.state.lock() = SessionState::Starting;
        }
        // Anything short of Running (fresh spawn, or an earlier failed
        // handshake) re-arms the startup deadline.
        let starting = self.state() != SessionState::Running;
        let io = io.as_mut().expect("io populated above");

        // Stale events from a previous, cancelled turn: account for them
        // (the reader already folded their stats) but do not re-dispatch.
        while let Ok(stale) = io.events.try_recv() {
            tracing::debug!(session_id = %self.id, "discarding stale event from cancelled turn");
            drop(stale);
        }

        // First turn on a fresh process carries the session header.
        let framed = if self.turns.load(Ordering::SeqCst) == 0 {
            self.compose_first_prompt(prompt)
        } else {
            prompt.to_string()
        };

        let message = serde_json::to_string(&PromptMessage::user(&framed))?;
        io.stdin.write_all(message.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        self.turns.fetch_add(1, Ordering::SeqCst);

        // Event loop. The handshake deadline applies until the first event
        // of a fresh process; afterwards the turn runs unbounded (the
        // orchestrating caller owns the overall deadline).
        let startup = Duration::from_millis(self.config.startup_timeout_ms);
        let mut first_event_pending = starting;

        loop {
            let next = if first_event_pending {
                match tokio::time::timeout(startup, recv_or_cancel(&mut io.events, cancel)).await {
                    Ok(next) => next,
                    Err(_) => {
                        *self.state.lock() = SessionState::Errored;
                        self.stats.note_error("startup handshake timed out");
                        return Err(Error::Timeout(format!(
                            "session {} did not answer within {}ms",
                            self.id, self.config.startup_timeout_ms
                        )));
                    }
                }
            } else {
                recv_or_cancel(&mut io.events, cancel).await
            };

            let event = match next {
                Received::Cancelled => {
                    tracing::debug!(session_id = %self.id, "caller cancelled; session stays alive");
                    return Err(Error::Cancelled);
                }
                Received::Closed => {
                    *self.state.lock() = SessionState::Errored;
                    let tail = self.stderr_excerpt();
                    self.stats.note_error("subprocess exited mid-turn");
                    return Err(Error::Session {
                        session_id: self.id.clone(),
                        message: format!("subprocess exited mid-turn; stderr: {tail}"),
                    });
                }
                Received::Event(Err(err)) => {
                    *self.state.lock() = SessionState::Errored;
                    self.stats.note_error(&err.to_string());
                    return Err(Error::Session {
                        session_id: self.id.clone(),
                        message: format!("protocol error: {err}"),
                    });
                }
                Received::Event(Ok(event)) => event,
            };

            if first_event_pending {
                *self.state.lock() = SessionState::Running;
                first_event_pending = false;
                TraceEvent::SessionResolved {
                    session_id: self.id.clone(),
                    is_new: true,
                }
                .emit();
            }
            self.touch();

            if let SubprocessEvent::Unknown { kind, .. } = &event {
                self.unknown_events.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(session_id = %self.id, kind = %kind, "unknown envelope type");
            }

            self.dispatch(&event, callback);

            if let SubprocessEvent::Result(payload) = event {
                return Ok(payload);
            }
        }
    }

    fn dispatch(&self, event: &SubprocessEvent, callback: &EventCallback) {
        let meta = EventMeta {
            session_id: self.id.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            at_ms: av_domain::now_ms(),
        };
        let wrapped = EventWithMeta {
            event_type: event.event_type().to_string(),
            data: protocol::event_data(event),
            meta,
        };
        let event_type = wrapped.event_type.clone();
        let data = serde_json::to_string(&wrapped).unwrap_or_default();
        callback(AgentEvent::new(event_type, data));
    }

    fn compose_first_prompt(&self, prompt: &str) -> String {
        let mut header = String::new();
        if let Some(device) = self.device_context.lock().as_deref() {
            header.push_str(device);
            header.push_str("\n\n");
        }
        if let Some(instructions) = self.task_instructions.lock().as_deref() {
            header.push_str(instructions);
            header.push_str("\n\n");
        }
        if header.is_empty() {
            prompt.to_string()
        } else {
            format!("{header}{prompt}")
        }
    }

    // ── Process management ─────────────────────────────────────────

    fn spawn(&self) -> Result<SessionIo> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg("--session-id")
            .arg(&self.id)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::Session {
            session_id: self.id.clone(),
            message: format!("spawn '{}': {e}", self.config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::Session {
            session_id: self.id.clone(),
            message: "failed to capture subprocess stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Session {
            session_id: self.id.clone(),
            message: "failed to capture subprocess stdout".into(),
        })?;
        let stderr = child.stderr.take();
        let pid = child.id();

        // Stdout reader: parse every line and fold stats immediately so a
        // cancelled caller never loses accounting.
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = self.id.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let parsed = protocol::parse_line(&line).transpose();
                        let Some(parsed) = parsed else { continue };
                        if let Ok(event) = &parsed {
                            stats.record_event(event);
                        }
                        if tx.send(parsed).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Io(e)));
                        break;
                    }
                }
            }
            tracing::debug!(session_id = %session_id, "stdout reader finished");
        });

        // Stderr: sampled at 100% into debug logs plus a bounded tail for
        // diagnostics.
        if let Some(stderr) = stderr {
            let session_id = self.id.clone();
            let tail = self.stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, stderr = %line, "subprocess stderr");
                    let mut buf = tail.lock();
                    buf.push_back(line);
                    while buf.len() > STDERR_TAIL_LINES {
                        buf.pop_front();
                    }
                }
            });
        }

        tracing::info!(session_id = %self.id, pid = ?pid, "subprocess session spawned");

        Ok(SessionIo {
            stdin,
            child,
            events: rx,
            pid,
        })
    }

    /// Drain and close this session: sentinel, bounded wait, then a
    /// process-group kill.
    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closed) {
                return;
            }
            *state = SessionState::Draining;
        }

        let mut io_slot = self.io.lock().await;
        if let Some(mut io) = io_slot.take() {
            let _ = io.stdin.write_all(protocol::SHUTDOWN_SENTINEL.as_bytes()).await;
            let _ = io.stdin.write_all(b"\n").await;
            let _ = io.stdin.flush().await;
            drop(io.stdin);

            let deadline = Duration::from_millis(self.config.drain_timeout_ms);
            match tokio::time::timeout(deadline, io.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(session_id = %self.id, ?status, "subprocess exited cleanly");
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %self.id, error = %e, "error waiting for subprocess");
                }
                Err(_) => {
                    tracing::warn!(session_id = %self.id, "subprocess ignored shutdown, killing group");
                    kill_process_group(io.pid);
                    let _ = io.child.kill().await;
                }
            }
        }

        *self.state.lock() = SessionState::Closed;
        TraceEvent::SessionClosed {
            session_id: self.id.clone(),
            reason: reason.to_string(),
        }
        .emit();
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn touch(&self) {
        self.last_active_ms.store(av_domain::now_ms(), Ordering::SeqCst);
    }

    fn stderr_excerpt(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().rev().take(5).rev().cloned().collect::<Vec<_>>().join(" | ")
    }
}

enum Received {
    Event(Result<SubprocessEvent>),
    Cancelled,
    Closed,
}

async fn recv_or_cancel(
    events: &mut mpsc::UnboundedReceiver<Result<SubprocessEvent>>,
    cancel: &CancellationToken,
) -> Received {
    tokio::select! {
        _ = cancel.cancelled() => Received::Cancelled,
        next = events.recv() => match next {
            Some(event) => Received::Event(event),
            None => Received::Closed,
        },
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child was spawned as its own process group leader.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
