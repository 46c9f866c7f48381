use serde::Serialize;

/// Structured trace events emitted across all Aviary crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    RouteResolved {
        conversation_id: String,
        route: String,
        method: String,
        confidence: f64,
        needs_orchestration: bool,
    },
    BlockCreated {
        conversation_id: String,
        block_uid: String,
        round_number: i64,
        mode: String,
    },
    BlockCompleted {
        block_uid: String,
        status: String,
        cost_milli_cents: i64,
        total_tokens: u64,
    },
    SessionResolved {
        session_id: String,
        is_new: bool,
    },
    SessionClosed {
        session_id: String,
        reason: String,
    },
    DangerBlocked {
        session_id: String,
        category: String,
        level: String,
        pattern: String,
    },
    PlanAccepted {
        trace_id: String,
        task_count: usize,
        parallel: bool,
        aggregate: bool,
    },
    TaskDispatched {
        trace_id: String,
        task_id: String,
        agent: String,
    },
    TaskHandoff {
        trace_id: String,
        task_id: String,
        from_agent: String,
        to_agent: String,
        depth: u32,
    },
    LlmCall {
        model: String,
        duration_ms: u64,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    RecoveryCompleted {
        interrupted_blocks: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "av_event");
    }
}
