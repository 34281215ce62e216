mod config;
mod gateway;
mod hub;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use kaba_client::{RestClient, SocketClient};
use kaba_registry::ConversationRegistry;

use crate::config::Config;
use crate::hub::Hub;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kaba_desk=debug,kaba_client=debug,kaba_registry=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;
    let session = Arc::new(config.session()?);
    info!(
        "Service identity {} (api {}, socket {})",
        session.service_id, session.api_url, session.socket_url
    );

    let rest = RestClient::new(session.clone())?;
    let hub = Hub::spawn(
        ConversationRegistry::new(config.service_id),
        rest.clone(),
        config.rollback_failed_deletes,
    );

    // Snapshot and live stream start together; the hub merges whichever lands first.
    let shutdown = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(256);
    let socket = SocketClient::new(session).spawn(events_tx, shutdown.clone());
    hub.refresh();
    tokio::spawn(hub::pump_socket_events(hub.clone(), events_rx));

    let app = routes::router(AppState {
        hub,
        rest,
        sender: socket.sender(),
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Kaba desk listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    socket.disconnect().await;
    info!("Kaba desk stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    shutdown.cancel();
}
