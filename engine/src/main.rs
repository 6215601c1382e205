//! `agent-hub`: the CLI entrypoint that wires the coordination kernel
//! (storage, bus, audit, budget, breaker, degradation, router, sandbox,
//! contract, pipeline supervisor) together and exposes the tool surface.
//!
//! Process-wide singletons are modeled as explicit context constructed once
//! here and injected into whichever subcommand runs (design notes: process-
//! wide singletons), rather than as global statics.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use agent_hub_audit::AuditLog;
use agent_hub_breaker::ComponentBreaker;
use agent_hub_budget::{BudgetManager, DEFAULT_DAILY_BUDGET_USD, DEFAULT_SESSION_BUDGET_USD};
use agent_hub_bus::{FileBus, MessageBus, SqliteBus};
use agent_hub_contract::{CheckpointCapability, GitCheckpoint, NoopCheckpoint};
use agent_hub_degradation::{DegradationManager, DEFAULT_CLOUD_FALLBACK_MODEL, DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS, DEFAULT_OLLAMA_BASE_URL};
use agent_hub_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use agent_hub_pipeline::{PipelineSupervisor, ProcessStageRunner, StageRunner, SupervisorConfig};
use agent_hub_providers::{HttpInferenceClient, InferenceClient};
use agent_hub_router::{ModelRouter, RouterConfig};
use agent_hub_server::{serve, AppState};
use agent_hub_storage::WorkspaceLayout;
use anyhow::Context;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "agent-hub")]
#[command(about = "Agent Hub coordination kernel: task watchdog, message bus, model router, sandboxed draft gate")]
struct Cli {
    /// Workspace root beneath which `_handoff/` and `data/` live.
    #[arg(long, env = "AGENT_HUB_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tool surface over HTTP and the pipeline supervisor loop.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
        /// Skip starting the pipeline supervisor loop (tool surface only).
        #[arg(long, default_value_t = false)]
        no_supervisor: bool,
    },
    /// Run the tool surface over line-delimited JSON on stdin/stdout.
    Stdio,
    /// Run only the pipeline supervisor loop (no tool surface).
    Supervisor,
    /// Print the circuit-breaker component state and exit.
    BreakerStatus,
    /// Clear all component failure counters and lift a halt.
    BreakerReset,
    /// Print the budget manager's current session/day accounting.
    BudgetStatus,
    /// Probe the local inference endpoint and print low-power-mode status.
    DegradationProbe,
    /// Route a single chat completion through the model router and print
    /// the model that served it.
    Route {
        #[arg(long, default_value = "default")]
        task_type: String,
        #[arg(long)]
        preferred: Option<String>,
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let layout = WorkspaceLayout::new(&cli.workspace);

    let process_kind = match cli.command {
        Command::Serve { .. } => ProcessKind::Server,
        Command::Supervisor => ProcessKind::Supervisor,
        _ => ProcessKind::Worker,
    };
    let logs_dir = canonical_logs_dir_from_root(&cli.workspace);
    let _log_guard = init_process_logging(process_kind, &logs_dir, 14)
        .context("failed to initialize logging")?
        .0;

    match cli.command {
        Command::Serve { hostname, port, no_supervisor } => {
            let ctx = build_context(&layout).await?;
            let state = AppState::new(
                layout.clone(),
                ctx.bus.clone(),
                ctx.budget.clone(),
                ctx.breaker.clone(),
                ctx.audit.clone(),
            );

            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            tracing::info!(%addr, "starting agent-hub tool surface");

            if no_supervisor {
                serve(addr, state).await?;
            } else {
                let supervisor = Arc::new(build_supervisor(&layout, &ctx)?);
                let supervisor_handle = tokio::spawn(supervisor.run());
                tokio::select! {
                    result = serve(addr, state) => result?,
                    result = supervisor_handle => { result??; }
                }
            }
        }
        Command::Stdio => {
            let ctx = build_context(&layout).await?;
            let state = AppState::new(
                layout.clone(),
                ctx.bus.clone(),
                ctx.budget.clone(),
                ctx.breaker.clone(),
                ctx.audit.clone(),
            );
            let stdin = tokio::io::stdin();
            let stdout = tokio::io::stdout();
            agent_hub_server::run_stdio(&state, stdin, stdout).await?;
        }
        Command::Supervisor => {
            let ctx = build_context(&layout).await?;
            let supervisor = Arc::new(build_supervisor(&layout, &ctx)?);
            supervisor.run().await?;
        }
        Command::BreakerStatus => {
            let ctx = build_context(&layout).await?;
            let snapshot = ctx.breaker.snapshot().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::BreakerReset => {
            let ctx = build_context(&layout).await?;
            ctx.breaker.reset().await?;
            println!("circuit breaker reset");
        }
        Command::BudgetStatus => {
            let ctx = build_context(&layout).await?;
            let status = ctx.budget.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::DegradationProbe => {
            let ctx = build_context(&layout).await?;
            let healthy = ctx.degradation.probe().await?;
            println!(
                "{}",
                serde_json::json!({ "healthy": healthy, "low_power_mode": ctx.degradation.is_low_power_mode() })
            );
        }
        Command::Route { task_type, preferred, prompt } => {
            let ctx = build_context(&layout).await?;
            let messages = [agent_hub_providers::ChatMessage { role: "user".to_string(), content: prompt }];
            let outcome = ctx
                .router
                .route(&task_type, preferred.as_deref(), &messages, None)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!(
                "{}",
                serde_json::json!({ "model": outcome.model, "fallback_used": outcome.fallback_used, "text": outcome.text })
            );
        }
    }

    Ok(())
}

/// The process-wide components (design notes: process-wide singletons),
/// constructed once per invocation and passed to whichever subcommand needs
/// them.
struct Context {
    bus: Arc<dyn MessageBus>,
    audit: Arc<AuditLog>,
    budget: Arc<BudgetManager>,
    breaker: Arc<ComponentBreaker>,
    degradation: Arc<DegradationManager>,
    router: Arc<ModelRouter>,
}

async fn build_context(layout: &WorkspaceLayout) -> anyhow::Result<Context> {
    tokio::fs::create_dir_all(layout.data_dir()).await?;
    tokio::fs::create_dir_all(layout.handoff_dir()).await?;
    tokio::fs::create_dir_all(layout.sandbox_dir()).await?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let audit = Arc::new(AuditLog::new(layout.data_dir().join("audit.ndjson"), session_id.clone()));

    let breaker = Arc::new(
        ComponentBreaker::load_or_init(
            layout.data_dir().join("circuit_breaker_state.json"),
            layout.halt_sentinel_path(),
            env_u32("UAS_ROUTER_FAILURE_LIMIT", 5),
            env_u32("UAS_SQLITE_FAILURE_LIMIT", 3),
            env_u32("UAS_OLLAMA_FAILURE_LIMIT", 3),
        )
        .await
        .context("failed to load circuit breaker state")?,
    );

    let budget = Arc::new(
        BudgetManager::load_or_init(
            layout.data_dir().join("budget_state.json"),
            session_id.clone(),
            env_f64("UAS_SESSION_BUDGET", DEFAULT_SESSION_BUDGET_USD),
            env_f64("UAS_DAILY_BUDGET", DEFAULT_DAILY_BUDGET_USD),
        )
        .await
        .context("failed to load budget state")?,
    );

    let bus: Arc<dyn MessageBus> = if env_bool("UAS_SQLITE_BUS", false) {
        Arc::new(SqliteBus::open(&layout.data_dir().join("hub.db")).await.context("failed to open sqlite bus")?)
    } else {
        Arc::new(
            FileBus::open(layout.data_dir().join("hub_messages.json"))
                .await
                .context("failed to open file bus")?,
        )
    };

    let ollama_base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_string());
    let degradation = Arc::new(DegradationManager::new(
        ollama_base_url.clone(),
        env_u64("UAS_HEALTH_CHECK_TIMEOUT", DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS),
        layout.data_dir().join("LOW_POWER_MODE.txt"),
        DEFAULT_CLOUD_FALLBACK_MODEL,
        breaker.clone(),
        audit.clone(),
    ));

    let inference: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(ollama_base_url, None));
    let router = Arc::new(ModelRouter::new(
        RouterConfig::default(),
        degradation.clone(),
        budget.clone(),
        breaker.clone(),
        audit.clone(),
        inference,
    ));

    Ok(Context { bus, audit, budget, breaker, degradation, router })
}

fn build_supervisor(layout: &WorkspaceLayout, ctx: &Context) -> anyhow::Result<PipelineSupervisor> {
    let stage_executable = std::env::var("AGENT_HUB_STAGE_EXECUTABLE").unwrap_or_else(|_| "agent-hub-stage".to_string());
    let stage_runner: Arc<dyn StageRunner> = Arc::new(ProcessStageRunner::new(stage_executable));

    let checkpoint: Arc<dyn CheckpointCapability> = if layout.workspace_root.join(".git").exists() {
        Arc::new(GitCheckpoint)
    } else {
        Arc::new(NoopCheckpoint)
    };

    Ok(PipelineSupervisor::new(
        SupervisorConfig::default(),
        layout.clone(),
        ctx.bus.clone(),
        stage_runner,
        checkpoint,
        ctx.breaker.clone(),
        ctx.audit.clone(),
    ))
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
