//! Ridgeline daemon - HTTP, TCP and UDP front ends over one database

mod api;
mod config;
mod protocol;
mod tcp;
mod udp;

use anyhow::Context;
use clap::Parser;
use config::{Config, LoggingConfig};
use ridgeline_core::storage::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ridgeline", version, about = "Ridgeline time-series daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "ridgeline.toml")]
    config: PathBuf,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).pretty())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    init_logging(&config.logging);

    info!("Starting Ridgeline {}", ridgeline_core::VERSION);
    let db_config = config.database();
    info!("Data directory: {:?}", db_config.path);

    let db = tokio::task::spawn_blocking(move || Database::open(db_config))
        .await?
        .context("failed to open database, create it with `ridgeline-cli create`")?;
    let db = Arc::new(db);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if let Some(addr) = config.server.http {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", addr))?;
        info!("HTTP server: http://{}", addr);
        let app = api::create_router(db.clone());
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
        }));
    }

    if let Some(addr) = config.server.tcp {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {}", addr))?;
        tasks.push(tokio::spawn(tcp::serve(listener, db.clone(), shutdown_rx.clone())));
    }

    let mut udp = match config.server.udp {
        Some(addr) => Some(
            udp::UdpServer::start(addr, config.server.udp_workers, db.clone())
                .with_context(|| format!("failed to bind UDP listener on {}", addr))?,
        ),
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener failed: {}", e),
            Err(e) => error!("Listener task failed: {}", e),
        }
    }
    if let Some(udp) = udp.as_mut() {
        tokio::task::block_in_place(|| udp.stop());
    }

    tokio::task::spawn_blocking(move || db.close()).await??;
    info!("Ridgeline shutdown complete");
    Ok(())
}
