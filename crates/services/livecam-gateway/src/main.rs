//! Live Camera Gateway Binary
//!
//! Entry point for the live camera gateway service.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livecam_gateway::{
    api::{build_router, AppState},
    config::{Config, CONFIG_PATH_ENV},
    gateway::AccessGateway,
    registry::SessionRegistry,
    supervisor::{FfmpegEncoder, Supervisor},
    token::TokenCodec,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Live Camera Gateway...");

    // Load configuration
    let config = Config::load(std::env::var(CONFIG_PATH_ENV).ok())?;
    let config = Arc::new(config);

    if config.uses_dev_secret() {
        tracing::warn!("Playback URLs are signed with the built-in development secret; set LIVECAM_URL_SECRET");
    }
    if config.auth.control_secret.is_none() {
        tracing::warn!("No control secret configured; /stream endpoints are unauthenticated");
    }

    tracing::info!(
        "Configuration: HTTP port={}, output_root={}, encoder={}",
        config.server.http_port,
        config.storage.output_root.display(),
        config.encoder.program
    );

    tokio::fs::create_dir_all(&config.storage.output_root).await?;

    let codec = Arc::new(TokenCodec::new(
        &config.tokens.secret,
        config.tokens.max_ttl_seconds,
    ));

    // Encoder supervisor; its events drive session state
    let (supervisor, events) = Supervisor::new(
        Arc::new(FfmpegEncoder::from_config(&config.encoder)),
        Duration::from_millis(config.encoder.stop_grace_ms),
    );

    let registry = Arc::new(SessionRegistry::new(
        supervisor,
        codec.clone(),
        config.storage.output_root.clone(),
        config.encoder.manifest_name.clone(),
    ));
    let gateway = Arc::new(AccessGateway::new(
        codec,
        config.storage.output_root.clone(),
    ));

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let event_handle = {
        let registry = registry.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            registry.run_event_loop(events, shutdown_rx).await;
        })
    };

    // Create app state
    let state = AppState::new(registry.clone(), gateway, config.clone());

    // Build HTTP router
    let router = build_router(state);

    // Start HTTP server
    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        })
        .await?;

    // Stop every encoder before the event loop goes away
    registry.shutdown().await;

    let _ = shutdown_tx.send(());
    let _ = event_handle.await;

    tracing::info!("Live Camera Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
