//! Tower Duel Server - authoritative two-player tower duel match server
//!
//! This is the main entry point. It handles:
//! - Line-protocol TCP connections for login and gameplay
//! - Matchmaking and per-match tick drivers
//! - Player record persistence on disk
//! - An optional HTTP status endpoint

mod app;
mod config;
mod game;
mod http;
mod matchmaking;
mod net;
mod store;
mod util;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::game::UnitTemplates;
use crate::http::build_router;
use crate::matchmaking::SessionRegistry;
use crate::store::FileStore;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    init_tracing(&config.log_level);
    init_server_time();

    info!("Starting Tower Duel Server");

    let templates = UnitTemplates::load(&config.troops_file, &config.towers_file)
        .with_context(|| {
            format!(
                "loading unit templates from {} and {}",
                config.troops_file.display(),
                config.towers_file.display()
            )
        })?;
    info!(
        troops = templates.troops().len(),
        towers = templates.towers().len(),
        "Unit templates loaded"
    );

    let store = FileStore::open(&config.data_dir)
        .with_context(|| format!("opening player store at {}", config.data_dir.display()))?;
    info!(dir = %store.dir().display(), "Player store ready");

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(templates),
        Arc::new(store),
        config.match_settings(),
    ));
    let state = AppState::new(config.clone(), registry.clone());

    // Waiting-match housekeeping
    tokio::spawn(registry.clone().run_janitor());

    if let Some(http_addr) = config.http_addr {
        let router = build_router(state.clone());
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("binding status endpoint on {http_addr}"))?;
        info!("Health check: http://{}/health", http_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router).await {
                error!(error = %e, "Status endpoint stopped");
            }
        });
    }

    let listener = TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("binding game listener on {}", config.server_addr))?;
    info!("Server listening on {}", config.server_addr);

    net::serve(listener, state, shutdown_signal()).await?;

    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
