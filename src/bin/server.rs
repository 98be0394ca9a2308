//! Social Markets Web Server
//!
//! REST API, WebSocket event feed and the background X monitor.

use anyhow::Result;
use chrono::Utc;
use social_markets::api::{create_app, AppState};
use social_markets::Config;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to info for this crate; override with RUST_LOG
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,social_markets=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║       SOCIAL MARKETS - WEB SERVER                            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  X Linking:  {:<47} ║", if config.x_oauth_enabled() { "ENABLED" } else { "DISABLED" });
    println!("║  X Monitor:  {:<47} ║", if config.monitor.enabled { "ENABLED" } else { "DISABLED" });
    println!("║  AI Drafts:  {:<47} ║", if config.ai.api_key.is_some() { "PROVIDER" } else { "LOCAL FALLBACK" });
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    info!("Initializing application state...");
    let state = AppState::new(config.clone()).await?;

    // Expiring stores sweep on a fixed interval; take() also drops expired entries
    let sweep_every = Duration::from_secs(config.auth.sweep_interval_seconds);
    tokio::spawn(state.oauth_states.clone().run_sweeper(sweep_every));
    tokio::spawn(state.sign_in_nonces.clone().run_sweeper(sweep_every));

    // Expired sessions
    let session_db = state.db.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            match session_db.cleanup_expired_sessions(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => debug!("Removed {} expired sessions", n),
                Err(e) => warn!("Session cleanup failed: {}", e),
            }
        }
    });

    let monitor_handle = if config.monitor.enabled {
        info!(
            "Starting X monitor (every {}s)...",
            config.monitor.poll_interval_seconds
        );
        Some(state.monitor.clone().spawn())
    } else {
        info!("X monitor disabled");
        None
    };

    let app = create_app(state);

    let addr = config.bind_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    println!();
    println!("  API:       http://{}/api", addr);
    println!("  WebSocket: ws://{}/ws", addr);
    println!("  Health:    http://{}/health", addr);
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = monitor_handle {
        handle.stop().await;
    }
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
