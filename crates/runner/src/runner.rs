//! The hot-multiplexed subprocess runner (CCR).
//!
//! One runner instance per mode namespace, constructed at startup and
//! injected into every collaborator. Identical session ids resolve to the
//! same live subprocess; different conversations are physically isolated.
//! Teardown is explicit via [`CodeRunner::close`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use av_domain::config::RunnerConfig;
use av_domain::event::{AgentEvent, EVENT_DANGER_BLOCK};
use av_domain::{DangerLevel, Error, EventCallback, Result, SessionStats, TraceEvent};

use crate::danger::DangerDetector;
use crate::protocol::ResultPayload;
use crate::session::Session;

/// Permission mode that disables the danger gate for admin callers.
pub const PERMISSION_BYPASS: &str = "bypassPermissions";

/// Per-call configuration for [`CodeRunner::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteConfig {
    /// Explicit session id; derived from the conversation id when absent.
    pub session_id: Option<String>,
    pub conversation_id: String,
    pub user_id: String,
    /// Working directory override for fresh sessions.
    pub work_dir: Option<PathBuf>,
    /// Session-persistent task instructions; the first set wins.
    pub task_instructions: Option<String>,
    /// Device context merged into the header prompt at session creation.
    pub device_context: Option<String>,
    /// `"bypassPermissions"` requires the admin token.
    pub permission_mode: Option<String>,
    /// Admin token presented by the caller.
    pub admin_token: Option<String>,
}

pub struct CodeRunner {
    namespace: Uuid,
    config: RunnerConfig,
    admin_token: Option<String>,
    danger: DangerDetector,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Runner-wide flag flipped by an authorised bypass call.
    bypass_enabled: AtomicBool,
    shutdown: CancellationToken,
}

impl CodeRunner {
    /// Construct the runner and start its idle sweeper. Must be called
    /// from within a tokio runtime.
    pub fn new(namespace: Uuid, config: RunnerConfig, admin_token: Option<String>) -> Arc<Self> {
        let runner = Arc::new(Self {
            namespace,
            config,
            admin_token,
            danger: DangerDetector::new(),
            sessions: RwLock::new(HashMap::new()),
            bypass_enabled: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        runner.clone().spawn_idle_sweeper();
        runner
    }

    /// Deterministic session id for a conversation under this runner's
    /// namespace.
    pub fn derive_session_id(&self, conversation_id: &str) -> String {
        let name = format!("aviary:conversation:{conversation_id}");
        Uuid::new_v5(&self.namespace, name.as_bytes()).to_string()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Stats snapshot for a live session.
    pub fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.stats_snapshot())
    }

    // ── Execute ────────────────────────────────────────────────────

    /// Run one turn against the session for `config`'s conversation,
    /// creating the subprocess on first use. Events stream to `callback`
    /// in order; returns when the subprocess reports its terminal result.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        config: ExecuteConfig,
        prompt: &str,
        callback: EventCallback,
    ) -> Result<ResultPayload> {
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| self.derive_session_id(&config.conversation_id));

        // Bypass is only honoured with the correct admin token, and flips
        // a runner-wide flag before the call proceeds.
        if config.permission_mode.as_deref() == Some(PERMISSION_BYPASS) {
            let authorised = match (&self.admin_token, &config.admin_token) {
                (Some(expected), Some(presented)) => expected == presented,
                _ => false,
            };
            if !authorised {
                return Err(Error::Unauthorized(
                    "bypassPermissions requires the admin token".into(),
                ));
            }
            self.bypass_enabled.store(true, Ordering::SeqCst);
        }

        // Danger gate: critical operations never reach the subprocess.
        let bypass = self.bypass_enabled.load(Ordering::SeqCst);
        if let Some(hit) = self.danger.check(prompt) {
            if hit.level == DangerLevel::Critical && !bypass {
                TraceEvent::DangerBlocked {
                    session_id: session_id.clone(),
                    category: format!("{:?}", hit.category).to_lowercase(),
                    level: "critical".into(),
                    pattern: hit.pattern_matched.clone(),
                }
                .emit();
                let blocked = hit.into_blocked(prompt, self.admin_token.is_some());
                callback(AgentEvent::json(EVENT_DANGER_BLOCK, &blocked));
                return Err(Error::DangerBlocked(blocked));
            }
            tracing::warn!(
                session_id = %session_id,
                level = ?hit.level,
                category = ?hit.category,
                bypassed = bypass && hit.level == DangerLevel::Critical,
                "dangerous operation allowed through"
            );
        }

        let (session, is_new) = self.resolve_session(&session_id, &config);
        if !is_new {
            TraceEvent::SessionResolved {
                session_id: session_id.clone(),
                is_new: false,
            }
            .emit();
        }
        if let Some(instructions) = &config.task_instructions {
            session.set_task_instructions_once(instructions);
        }
        if let Some(device) = &config.device_context {
            session.set_device_context_once(device);
        }

        session.execute(cancel, prompt, &callback).await
    }

    fn resolve_session(&self, session_id: &str, config: &ExecuteConfig) -> (Arc<Session>, bool) {
        // Fast path under the read lock.
        if let Some(session) = self.sessions.read().get(session_id) {
            return (session.clone(), false);
        }

        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(session_id) {
            return (session.clone(), false);
        }
        let work_dir = config
            .work_dir
            .clone()
            .unwrap_or_else(|| self.config.work_dir.clone());
        let session = Arc::new(Session::new(
            session_id.to_string(),
            self.config.clone(),
            work_dir,
        ));
        sessions.insert(session_id.to_string(), session.clone());
        (session, true)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Stop one session explicitly. Callers' context cancellation never
    /// reaches here; this is the only per-session kill switch.
    pub async fn stop(&self, session_id: &str, reason: &str) -> Result<()> {
        let session = self.sessions.write().remove(session_id);
        match session {
            Some(session) => {
                session.close(reason).await;
                Ok(())
            }
            None => Err(Error::Session {
                session_id: session_id.to_string(),
                message: "no such session".into(),
            }),
        }
    }

    /// Graceful shutdown: drain every session within the configured
    /// deadline; no task outlives this call.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close("runner shutdown").await;
        }
    }

    fn spawn_idle_sweeper(self: Arc<Self>) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let cutoff = av_domain::now_ms() - self.config.idle_timeout_ms as i64;
                let expired: Vec<(String, Arc<Session>)> = {
                    let mut map = self.sessions.write();
                    let ids: Vec<String> = map
                        .iter()
                        .filter(|(_, s)| s.last_active_ms() < cutoff)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| map.remove(&id).map(|s| (id, s)))
                        .collect()
                };
                for (id, session) in expired {
                    tracing::info!(session_id = %id, "closing idle session");
                    session.close("idle timeout").await;
                }
            }
            tracing::debug!("idle sweeper stopped");
        });
    }
}
