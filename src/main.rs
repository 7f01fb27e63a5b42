// llmtap - transparent capture proxy for LLM traffic
//
// Sits between AI agents and their inference providers (OpenAI-compatible,
// Anthropic, Ollama), forwards every request byte-for-byte, and records each
// interaction - streaming responses included - in a local SQLite database.
//
// Architecture:
// - Proxy server (axum): classifies and forwards HTTP traffic
// - Stream tee: relays upstream chunks while feeding per-provider parsers
// - Providers: decode three wire formats into one Interaction model
// - Store: single writer thread over SQLite, pooled readers
// - Admin API under /_interceptor/, CLI for queries and export

mod cli;
mod config;
mod export;
mod model;
mod providers;
mod proxy;
mod redact;
mod store;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands, StartArgs};
use config::Config;
use store::{query::StoreQuery, InteractionStore, StoreConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit 1; --help/--version exit 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0u8,
                _ => 1u8,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    match cli.command {
        None => run_start(config, StartArgs::default()).await,
        Some(Commands::Start(args)) => run_start(config, args).await,
        Some(Commands::Replay { id }) => report(cli::handle_replay(&config, &id)),
        Some(Commands::Export(args)) => report(cli::handle_export(&config, &args)),
        Some(Commands::Stats) => report(cli::handle_stats(&config)),
        Some(Commands::Sessions) => report(cli::handle_sessions(&config)),
        Some(Commands::Save { path }) => report(cli::handle_save(&config, &path)),
        Some(Commands::Config { show, path, reset }) => {
            report(cli::handle_config(&config, show, path, reset))
        }
    }
}

/// Runtime errors exit 2
fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Run the proxy until interrupted. A first Ctrl-C starts the graceful
/// drain; a second one during the drain forces an immediate exit (130).
async fn run_start(mut config: Config, args: StartArgs) -> ExitCode {
    args.apply(&mut config);

    // Precedence: RUST_LOG env var > verbosity flags > default "info"
    let default_level = if config.verbose {
        "debug"
    } else if config.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("llmtap={}", default_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Ensure the config template exists (helps users discover options)
    Config::ensure_config_exists();

    match serve(config).await {
        Ok(forced) if forced => ExitCode::from(130),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns true when shutdown was forced by a second interrupt
async fn serve(config: Config) -> Result<bool> {
    let store = Arc::new(
        InteractionStore::open(StoreConfig {
            db_path: config.db_path.clone(),
            store_chunks: config.store_chunks,
            ..Default::default()
        })
        .context("Failed to open interaction store")?,
    );
    let query = Arc::new(
        StoreQuery::new(&config.db_path).context("Failed to open store query pool")?,
    );

    tracing::info!(
        db = %config.db_path.display(),
        redact = config.redact,
        store_chunks = config.store_chunks,
        "Interaction store ready"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let config = Arc::new(config);
    let proxy_handle = tokio::spawn(proxy::start_proxy(
        config.clone(),
        store.clone(),
        query,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(());

    let forced = tokio::select! {
        result = proxy_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Proxy error during shutdown: {:#}", e),
                Err(e) => tracing::error!("Proxy task panicked: {}", e),
            }
            false
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Forced shutdown");
            true
        }
    };

    if !forced {
        // Flush pending writes; the writer joins quickly once drained
        let store_for_shutdown = store.clone();
        tokio::task::spawn_blocking(move || store_for_shutdown.shutdown())
            .await
            .ok();
        tracing::info!("Shutdown complete");
    }

    Ok(forced)
}
