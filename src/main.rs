use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use perf_action_engine::{
    config::{Config, LogFormat},
    engine::{
        execute_command, ActionEngine, ActionRegistry, BatchScheduler, EngineCommands,
        SqliteMetricSource, WebhookExecutor,
    },
    storage::SqliteStorage,
};

/// Adaptive performance-action engine
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C (default)
    Serve,

    #[command(flatten)]
    Engine(EngineCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Performance action engine starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    let registry = if config.webhook.base_url.is_some() {
        let executor = WebhookExecutor::new(&config.webhook)?;
        ActionRegistry::with_default_catalog(Arc::new(executor))
    } else {
        warn!("ACTION_WEBHOOK_URL not set, no actions can run");
        ActionRegistry::new()
    };

    let metrics = SqliteMetricSource::new(storage.pool().clone());
    let engine = Arc::new(ActionEngine::new(
        Arc::new(storage),
        Arc::new(metrics),
        Arc::new(registry),
        config.engine.clone(),
    )?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(engine).await,
        Command::Engine(command) => {
            let result = execute_command(command, &engine).await;
            println!("{}", result.message);
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
            Ok(())
        }
    }
}

async fn serve(engine: Arc<ActionEngine>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = BatchScheduler::spawn(Arc::clone(&engine), shutdown_rx);

    info!("Scheduler running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }

    info!("Shutting down...");
    shutdown_tx.send_replace(true);
    if let Err(e) = handle.await {
        error!(error = %e, "Scheduler task failed");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
