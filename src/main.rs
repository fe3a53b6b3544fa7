//! mpd-remote - watch an MPD server and log typed change events.
//!
//! Usage: `mpd-remote [--json]`. Connection settings come from the config
//! file and environment (see `mpd_remote::config`).

use mpd_remote::bus::{create_bus, MpdEvent};
use mpd_remote::client::{MonitorTask, MpdClient, Supervisor};
use mpd_remote::config;

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mpd_remote=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let json = std::env::args().skip(1).any(|arg| arg == "--json");

    tracing::info!(
        "Starting mpd-remote v{} ({})",
        env!("MPDR_VERSION"),
        env!("MPDR_GIT_SHA")
    );

    let config = config::load_config()?;
    tracing::info!(
        "Configuration loaded, server: {}:{}",
        config.mpd.host,
        config.mpd.port
    );

    let bus = create_bus();
    let client = Arc::new(MpdClient::with_options(
        Arc::new(config.clone()),
        bus.clone(),
        config.subsystems()?,
    ));

    // Event logger
    let mut events = bus.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event, json),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event logger lagged, {} events lost", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::new(MonitorTask::new(client.clone()), shutdown.clone());
    let retry = config.retry_config();
    let supervisor_handle = tokio::spawn(supervisor.run_with_retry(retry));

    shutdown_signal().await;
    shutdown.cancel();

    match supervisor_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Supervisor failed: {}", e),
        Err(e) => tracing::error!("Supervisor task panicked: {}", e),
    }
    client.disconnect().await;
    logger.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

fn log_event(event: &MpdEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Could not serialize {:?}: {}", event.kind(), e),
        }
    } else {
        tracing::info!("{:?}", event);
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
