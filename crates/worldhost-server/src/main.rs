//! # worldhost
//!
//! Main binary. Boots the engine, starts the configured worlds, serves the
//! control API and drains every session on shutdown.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use worldhost_api::{build_router, AppState};
use worldhost_session::engine::{InMemoryEngine, InMemoryEngineConfig};
use worldhost_session::{ManagerSettings, SessionManager, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "worldhost")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file name without extension
    #[arg(short, long, env = "WORLDHOST_CONFIG", default_value = "worldhost")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = worldhost_common::config::init(&cli.config)?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "worldhost=debug,tower_http=debug".into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting worldhost v{}", env!("CARGO_PKG_VERSION"));

    // === Engine ===
    let engine = Arc::new(InMemoryEngine::new(InMemoryEngineConfig {
        user_id: config.engine.user_id.clone(),
        init_delay: std::time::Duration::from_millis(config.engine.init_delay_ms),
        ..Default::default()
    }));
    if config.engine.user_id.is_none() {
        tracing::warn!("No engine identity configured; worlds can only be saved as presets");
    }

    let manager = SessionManager::new(
        engine,
        SessionRegistry::new(),
        ManagerSettings::from_config(&config.host),
    );

    // === Configured worlds ===
    for params in config.start_worlds.iter().filter(|p| p.is_enabled) {
        let name = params.session_name.clone().unwrap_or_default();
        match manager
            .start_world(params.clone(), manager.shutdown_token())
            .await
        {
            Ok(session) => tracing::info!(session = %session.id(), %name, "Started configured world"),
            Err(e) => tracing::error!(%name, error = %e, "Failed to start configured world"),
        }
    }

    // === Control API ===
    let router = build_router(AppState::new(manager.clone()));
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control API listening on http://{addr}");

    let shutdown = manager.shutdown_token();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Failed to listen for ctrl-c");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    // === Drain ===
    manager.shutdown();
    let deadline = CancellationToken::new();
    let timer = {
        let deadline = deadline.clone();
        let timeout = config.host.shutdown_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        })
    };
    manager.stop_all(deadline).await;
    timer.abort();

    tracing::info!("worldhost stopped");
    Ok(())
}
