//! A thin `serve` entry point exercising the analyzer, risk scorer,
//! policy engine, chaos scheduler, and event store as one running
//! process, in front of a real PostgreSQL instance.
//!
//! Grounded on `mockforge-cli`'s `main.rs`: a top-level `clap` parser
//! with a global `--log-level` flag, `tracing-subscriber` installed
//! once at the very top of `main`, then a `match` over the subcommand.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chaostrace_analyzer::StatementAnalyzer;
use chaostrace_chaos::{ChaosHooks, ChaosScheduler};
use chaostrace_model::{ChaosScenario, RunId};
use chaostrace_policy::PolicyEngine;
use chaostrace_proxy::ProxyPipeline;
use chaostrace_risk::RiskScorer;
use chaostrace_store::EventStore;
use tracing::info;

#[derive(Parser)]
#[command(name = "chaostrace")]
#[command(about = "Sandboxed safety harness for database-touching agents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Set log level (error, warn, info, debug, trace).
    #[arg(short = 'v', long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind the proxy listener and run until interrupted.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Address the proxy accepts agent connections on.
    #[arg(long, default_value = "127.0.0.1:6432")]
    listen: SocketAddr,

    /// Address of the real PostgreSQL instance behind the proxy.
    #[arg(long)]
    upstream: SocketAddr,

    /// YAML policy profile to enforce.
    #[arg(long)]
    policy: PathBuf,

    /// Optional YAML chaos scenario to run alongside the proxied
    /// connections.
    #[arg(long)]
    chaos: Option<PathBuf>,

    /// PostgreSQL connection string chaos hooks use to run their own
    /// administrative statements (`LOCK TABLE`, `REVOKE`, DDL). Required
    /// when `--chaos` is given.
    #[arg(long)]
    database_url: Option<String>,

    /// Database role chaos's `REVOKE_CREDENTIALS` action rotates.
    #[arg(long, default_value = "agent")]
    agent_role: String,

    /// SQLite file the event store persists to. Omit to keep events
    /// in memory for the life of the process.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Per-run event cap before oldest-10% eviction kicks in.
    #[arg(long, default_value_t = chaostrace_store::DEFAULT_MAX_EVENTS_PER_RUN)]
    max_events_per_run: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let run_id = RunId::new();
    info!(%run_id, listen = %args.listen, upstream = %args.upstream, "starting chaostrace proxy");

    let policy = PolicyEngine::load(&args.policy)
        .with_context(|| format!("loading policy profile from {}", args.policy.display()))?;

    let store = match &args.store {
        Some(path) => EventStore::open(path, args.max_events_per_run)
            .await
            .with_context(|| format!("opening event store at {}", path.display()))?,
        None => EventStore::open_in_memory(args.max_events_per_run)
            .await
            .context("opening in-memory event store")?,
    };

    let (chaos_hooks, chaos_scheduler) = match &args.chaos {
        Some(scenario_path) => {
            let database_url = args
                .database_url
                .as_deref()
                .context("--database-url is required when --chaos is given")?;
            let raw = std::fs::read_to_string(scenario_path)
                .with_context(|| format!("reading chaos scenario from {}", scenario_path.display()))?;
            let scenario: ChaosScenario = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing chaos scenario from {}", scenario_path.display()))?;

            let hooks = Arc::new(
                ChaosHooks::connect(database_url, args.agent_role.clone())
                    .await
                    .context("connecting chaos hooks to the sandbox database")?,
            );
            let scheduler = ChaosScheduler::new(scenario, Arc::clone(&hooks))
                .map_err(anyhow::Error::msg)
                .context("validating chaos scenario")?;

            let store_for_callback = store.clone();
            scheduler.start(run_id, move |event| {
                store_for_callback.emit(chaostrace_model::Event::Chaos(event));
            });

            (Some(hooks), Some(scheduler))
        }
        None => (None, None),
    };

    let pipeline = Arc::new(ProxyPipeline {
        run_id,
        analyzer: StatementAnalyzer::new(),
        risk_scorer: RiskScorer::new(),
        policy: Arc::new(policy),
        chaos_hooks,
        chaos_scheduler,
        store,
    });

    chaostrace_proxy::serve(args.listen, args.upstream, pipeline)
        .await
        .context("proxy listener failed")?;
    Ok(())
}
