use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowgate::config::EngineConfig;
use flowgate::correlation::InMemoryCorrelationStore;
use flowgate::flow::FlowDefinition;
use flowgate::node::EchoConnector;
use flowgate::pipeline::Orchestrator;
use flowgate::queue::memory::InMemoryQueue;
use flowgate::storage::{FlowStore, InMemoryFlowStore};
use flowgate::webhook::{AppState, WebhookRouter};
use flowgate::worker::WorkerPool;

#[derive(Parser, Debug)]
#[command(
    name = "flowgate",
    about = "Queue-fed workflow engine with joins and dynamic webhooks",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine
    Run(RunArgs),

    /// Validate a flow file without running it
    Validate { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run every node in emulation mode (deterministic mocks, no external
    /// side effects)
    #[arg(long)]
    emulation: bool,

    /// Flow directory override
    #[arg(long)]
    flow_dir: Option<PathBuf>,

    /// HTTP port override
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Validate { file }) => validate(&file),
        Some(Commands::Run(args)) => run(args).await,
        None => run(RunArgs {
            log_level: "info".into(),
            emulation: false,
            flow_dir: None,
            http_port: None,
        })
        .await,
    }
}

fn validate(file: &PathBuf) -> anyhow::Result<()> {
    match FlowDefinition::load_from_file(file) {
        Ok(flow) => {
            println!(
                "ok: flow `{}` with {} nodes, entry `{}`",
                flow.id,
                flow.nodes.len(),
                flow.entry().unwrap_or("-")
            );
            Ok(())
        }
        Err(e) => bail!("invalid flow file {}: {e}", file.display()),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(&args.log_level);

    let mut config = EngineConfig::from_env();
    if let Some(dir) = args.flow_dir {
        config.flow_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    config.ensure_supported_backend()?;

    let store = InMemoryFlowStore::new();
    let flows = FlowDefinition::load_all_from_dir(&config.flow_dir);
    info!(count = flows.len(), dir = %config.flow_dir.display(), "flows loaded");
    for flow in flows {
        store.upsert_flow(flow).await?;
    }

    let orchestrator = Orchestrator::new(
        store.clone(),
        InMemoryCorrelationStore::new(),
        EchoConnector::new(),
        args.emulation,
    );

    let webhooks = WebhookRouter::new(store.clone());
    webhooks.sync_from_store().await;

    let queue = InMemoryQueue::new(config.worker.max_retries);
    let worker = WorkerPool::new(
        queue,
        orchestrator.clone(),
        store.clone(),
        config.worker.clone(),
    );
    worker.start().await?;

    let app = flowgate::webhook::http_router(AppState {
        router: webhooks,
        orchestrator,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "webhook endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, draining worker");
    worker.stop().await;
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for shutdown signal: {e}");
    }
}
