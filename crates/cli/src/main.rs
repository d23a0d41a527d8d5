//! `blueprint` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`  — run pending database migrations.
//! - `worker`   — run the SLA / approval-expiry sweeper against Postgres.
//! - `validate` — validate a blueprint graph JSON file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use actions::builtin::{TracingHandler, STANDARD_ACTION_TYPES};
use actions::{ActionHandler, ActionRegistry};
use engine::{BlueprintEngine, BlueprintGraph, EngineConfig, Sweeper};

#[derive(Parser)]
#[command(name = "blueprint", about = "Blueprint workflow engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Periodically fire due SLA escalations and auto-reject stale approvals.
    Worker {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// Seconds between sweeps.
        #[arg(long, env = "BLUEPRINT_SWEEP_INTERVAL_SECS", default_value_t = 60)]
        sweep_interval_secs: u64,
        /// Retries for a retryable escalation action failure.
        #[arg(long, env = "BLUEPRINT_MAX_ACTION_RETRIES", default_value_t = 3)]
        max_action_retries: u32,
        #[arg(long, default_value_t = 5)]
        max_connections: u32,
    },
    /// Validate a blueprint graph JSON file.
    Validate {
        /// Path to the blueprint JSON file.
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Migrate { database_url } => {
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied successfully");
        }
        Command::Worker { database_url, sweep_interval_secs, max_action_retries, max_connections } => {
            let pool = db::pool::create_pool(&database_url, max_connections)
                .await
                .context("failed to connect to database")?;
            let store = Arc::new(db::PgStore::new(pool));

            let config = EngineConfig {
                max_action_retries,
                sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
                ..EngineConfig::default()
            };
            let engine = Arc::new(
                BlueprintEngine::builder(store)
                    .registry(standard_registry())
                    .config(config)
                    .build(),
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let worker = tokio::spawn(Sweeper::new(engine).run(shutdown_rx));

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            if shutdown_tx.send(true).is_err() {
                warn!("sweeper already stopped");
            }
            worker.await.context("sweeper task panicked")?;
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let graph: BlueprintGraph = serde_json::from_str(&content).context("invalid blueprint JSON")?;

            match engine::validate_graph(&graph) {
                Ok(report) => {
                    for w in &report.warnings {
                        println!("warning: {w}");
                    }
                    println!(
                        "blueprint '{}' is valid: {} states, {} transitions, {} SLAs",
                        graph.blueprint.name,
                        graph.states.len(),
                        graph.transitions.len(),
                        graph.slas.len()
                    );
                }
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// One `TracingHandler` per standard action type.
fn standard_registry() -> ActionRegistry {
    STANDARD_ACTION_TYPES
        .iter()
        .map(|t| {
            let handler: Arc<dyn ActionHandler> = Arc::new(TracingHandler::new(*t));
            (t.to_string(), handler)
        })
        .collect()
}
