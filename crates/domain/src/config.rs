use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::pricing::PricingEntry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub blocks: BlocksConfig,
    /// Model-name → pricing table. Empty means built-in defaults.
    #[serde(default)]
    pub pricing: Vec<PricingEntry>,
    /// Admin token required for danger-gate bypass and evolution agents.
    #[serde(default)]
    pub admin_token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default timeout applied to every provider call.
    #[serde(default = "d_60000")]
    pub default_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subprocess runner (CCR)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Command line of the external CLI agent. The session id is appended
    /// as `--session-id <uuid>`.
    #[serde(default = "d_runner_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "d_work_dir")]
    pub work_dir: PathBuf,
    /// Startup handshake deadline.
    #[serde(default = "d_30000")]
    pub startup_timeout_ms: u64,
    /// Idle sessions are drained and closed after this long.
    #[serde(default = "d_1800000")]
    pub idle_timeout_ms: u64,
    /// Ceiling on waiting for pending callbacks at shutdown.
    #[serde(default = "d_5000")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub namespaces: RunnerNamespaces,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: d_runner_command(),
            args: Vec::new(),
            work_dir: d_work_dir(),
            startup_timeout_ms: 30_000,
            idle_timeout_ms: 1_800_000,
            drain_timeout_ms: 5_000,
            namespaces: RunnerNamespaces::default(),
        }
    }
}

/// UUIDv5 namespaces per mode. Normal/geek/evolution instances must give
/// different session ids for the same conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerNamespaces {
    pub normal: Uuid,
    pub geek: Uuid,
    pub evolution: Uuid,
}

impl Default for RunnerNamespaces {
    fn default() -> Self {
        Self {
            normal: Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"aviary.runner.normal"),
            geek: Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"aviary.runner.geek"),
            evolution: Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"aviary.runner.evolution"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for one full orchestration run.
    #[serde(default = "d_600000")]
    pub max_total_ms: u64,
    /// Hard maximum handoff recursion depth.
    #[serde(default = "d_3")]
    pub handoff_max_depth: u32,
    /// Per-task accumulated result cap.
    #[serde(default = "d_result_cap")]
    pub task_result_cap_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_total_ms: 600_000,
            handoff_max_depth: 3,
            task_result_cap_bytes: d_result_cap(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Recent turns kept in memory per conversation.
    #[serde(default = "d_10")]
    pub max_turns: usize,
    /// Contexts idle longer than this are evicted.
    #[serde(default = "d_3600000")]
    pub ttl_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            ttl_ms: 3_600_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Window within which the sticky route may be reused.
    #[serde(default = "d_300000")]
    pub sticky_window_ms: u64,
    /// TTL of the persisted per-conversation sticky entry.
    #[serde(default = "d_300000")]
    pub persisted_sticky_ttl_ms: u64,
    /// Rule matches below this confidence do not short-circuit.
    #[serde(default = "d_conf_rule")]
    pub min_rule_confidence: f64,
    /// History matches below this similarity do not short-circuit.
    #[serde(default = "d_conf_history")]
    pub min_history_similarity: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sticky_window_ms: 300_000,
            persisted_sticky_ttl_ms: 300_000,
            min_rule_confidence: 0.7,
            min_history_similarity: 0.8,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Block store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksConfig {
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
}

impl Default for BlocksConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
        }
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_3() -> u32 {
    3
}
fn d_10() -> usize {
    10
}
fn d_5000() -> u64 {
    5_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_60000() -> u64 {
    60_000
}
fn d_300000() -> u64 {
    300_000
}
fn d_600000() -> u64 {
    600_000
}
fn d_1800000() -> u64 {
    1_800_000
}
fn d_3600000() -> u64 {
    3_600_000
}
fn d_result_cap() -> usize {
    10 * 1024 * 1024
}
fn d_conf_rule() -> f64 {
    0.7
}
fn d_conf_history() -> f64 {
    0.8
}
fn d_runner_command() -> String {
    "claude".into()
}
fn d_work_dir() -> PathBuf {
    PathBuf::from("./workspace")
}
fn d_db_path() -> PathBuf {
    PathBuf::from("./data/blocks.db")
}
