//! The `aviary` binary: a local REPL front end over the turn service.
//!
//! HTTP transport is a separate concern; this binary wires the core
//! together for development and operations (chat, crash recovery, config
//! inspection).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use av_blocks::BlockStore;
use av_context::ContextStore;
use av_core::{TurnService, TurnServiceDeps};
use av_domain::config::Config;
use av_domain::event::AgentEvent;
use av_domain::pricing::PricingTable;
use av_domain::{EventCallback, TurnContext};
use tokio_util::sync::CancellationToken;
use av_orchestrator::{Aggregator, Decomposer, Orchestrator};
use av_parrots::{EvolutionParrot, ExpertRegistry, GeekParrot};
use av_router::{
    ChatRouter, HistoryMatcher, LlmClassifier, MemoryStickyStore, RouteCandidate, RuleMatcher,
    StaticKeywordProvider,
};
use av_runner::CodeRunner;

mod provider;

#[derive(Parser)]
#[command(name = "aviary", about = "Multi-agent conversational assistant core")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = "aviary.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat REPL (default).
    Chat {
        /// Conversation id to resume or start.
        #[arg(long, default_value = "local")]
        conversation: String,
        /// Acting user id.
        #[arg(long, default_value = "operator")]
        user: String,
        /// Mark turns as admin (enables the evolution agent).
        #[arg(long)]
        admin: bool,
    },
    /// Mark blocks interrupted by a crash and exit.
    Recover,
    /// Print the effective configuration.
    ConfigShow,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        None => {
            init_tracing();
            run_chat(config, "local".into(), "operator".into(), false).await
        }
        Some(Command::Chat {
            conversation,
            user,
            admin,
        }) => {
            init_tracing();
            run_chat(config, conversation, user, admin).await
        }
        Some(Command::Recover) => {
            init_tracing();
            let blocks = BlockStore::open(&config.blocks.db_path)?;
            let recovered = blocks.recover_interrupted()?;
            println!("marked {recovered} interrupted block(s) as error");
            Ok(())
        }
        Some(Command::ConfigShow) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("aviary {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured tracing to stderr so the REPL output stays readable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,av_core=debug")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

async fn run_chat(
    config: Config,
    conversation: String,
    user: String,
    admin: bool,
) -> anyhow::Result<()> {
    tracing::info!("aviary starting");

    // ── Persistent stores ────────────────────────────────────────────
    let blocks = Arc::new(BlockStore::open(&config.blocks.db_path)?);
    let recovered = blocks.recover_interrupted()?;
    if recovered > 0 {
        tracing::warn!(recovered, "abandoned interrupted blocks from a previous run");
    }
    let contexts = Arc::new(ContextStore::new(config.context.clone()));
    let shutdown = CancellationToken::new();
    contexts.spawn_eviction_sweeper(shutdown.clone());

    // ── Runner singletons, one per mode namespace ────────────────────
    let geek_runner = CodeRunner::new(
        config.runner.namespaces.geek,
        config.runner.clone(),
        config.admin_token.clone(),
    );
    let evolution_runner = CodeRunner::new(
        config.runner.namespaces.evolution,
        config.runner.clone(),
        config.admin_token.clone(),
    );

    // ── Agents ───────────────────────────────────────────────────────
    let registry = Arc::new(ExpertRegistry::new());
    registry.register(Arc::new(GeekParrot::new(geek_runner.clone())));
    registry.register(Arc::new(EvolutionParrot::new(evolution_runner.clone())));

    // ── LLM-backed layers ────────────────────────────────────────────
    let provider = provider::from_env();
    let candidates: Vec<RouteCandidate> = registry
        .cognitions()
        .into_iter()
        .map(|c| RouteCandidate {
            name: c.name,
            description: c.description,
        })
        .collect();

    let router = Arc::new(ChatRouter::new(
        config.router.clone(),
        RuleMatcher::with_default_rules(),
        HistoryMatcher::new(None),
        Arc::new(MemoryStickyStore::new()),
        Arc::new(StaticKeywordProvider::empty()),
        Some(LlmClassifier::new(
            provider.clone(),
            config.llm.default_timeout_ms,
        )),
        candidates,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Decomposer::new(provider.clone(), config.llm.default_timeout_ms),
        Aggregator::new(provider, config.llm.default_timeout_ms),
        registry.clone(),
        None,
        config.orchestrator.clone(),
        config.runner.drain_timeout_ms,
    ));

    let service = TurnService::new(TurnServiceDeps {
        blocks,
        contexts,
        router,
        registry,
        orchestrator,
        pricing: Arc::new(PricingTable::from_entries(config.pricing.clone())),
        geek_runner: Some(geek_runner.clone()),
        evolution_runner: Some(evolution_runner.clone()),
    });

    // ── REPL ─────────────────────────────────────────────────────────
    let mut editor = rustyline::DefaultEditor::new()?;
    println!("aviary ready — conversation '{conversation}' (ctrl-d to exit)");

    loop {
        let line = match editor.readline("you> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        editor.add_history_entry(text)?;

        let ctx = TurnContext::new(conversation.clone(), user.clone()).with_admin(admin);
        match service.handle_turn(&ctx, text, print_callback()).await {
            Ok(result) if result.appended => {
                println!("(added to the turn already in progress)");
            }
            Ok(_) => {}
            Err(err) => eprintln!("error: {err}"),
        }
    }

    // ── Explicit teardown ────────────────────────────────────────────
    println!("closing sessions…");
    shutdown.cancel();
    geek_runner.close().await;
    evolution_runner.close().await;
    tracing::info!("aviary stopped");
    Ok(())
}

/// Render events as they stream.
fn print_callback() -> EventCallback {
    Arc::new(|event: AgentEvent| match event.event_type.as_str() {
        "thinking" => eprintln!("  … thinking"),
        "tool_use" => eprintln!("  → tool {}", summary(&event.data, "name")),
        "tool_result" => eprintln!("  ← tool result"),
        "answer" => {
            if let Some(text) = av_domain::event::answer_text(&event.data) {
                println!("assistant> {text}");
            }
        }
        "danger_block" => eprintln!("  ✗ blocked: {}", summary(&event.data, "reason")),
        "error" => eprintln!("  ✗ {}", summary(&event.data, "message")),
        _ => {}
    })
}

fn summary(data: &str, field: &str) -> String {
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| {
            v.get(field)
                .or_else(|| v.pointer(&format!("/data/{field}")))
                .and_then(|f| f.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default()
}
