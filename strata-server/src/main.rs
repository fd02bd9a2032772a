use std::sync::Arc;

use clap::Parser;
use strata_core::StrataConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use strata_server::http::{self, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "strata.toml")]
    config: String,

    /// Check the backend and print graph stats, then exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match StrataConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let state = match HttpState::from_config(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open graph backend: {}", e);
            std::process::exit(1);
        }
    };

    let backend = state.provider.backend();
    if let Err(e) = backend.initialize().await {
        eprintln!("Failed to initialize {} backend: {}", backend.name(), e);
        std::process::exit(1);
    }

    if args.health {
        match backend.get_stats().await {
            Ok(stats) => {
                println!("✅ Backend {} reachable", stats.storage_backend);
                println!("✅ {} nodes, {} edges", stats.total_nodes, stats.total_edges);
            }
            Err(e) => {
                println!("❌ Backend check failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if !state.config.http.enabled {
        tracing::warn!("HTTP API disabled in config; nothing to serve");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        backend = backend.name(),
        provider = state.provider.kind(),
        "Strata graph store starting"
    );

    let result = http::start_http_server(Arc::new(state), tx.subscribe()).await;

    if let Err(e) = backend.close().await {
        tracing::warn!(error = %e, "Backend close failed");
    }
    result
}
