use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;

use ntunnel_relay::hub::{Hub, DEFAULT_BACKLOG};
use ntunnel_relay::metrics::Metrics;
use ntunnel_relay::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "ntunnel_relay=info".to_string()))
        .init();

    let port: u16 = std::env::var("PORT").unwrap_or_else(|_| "7447".to_string()).parse().unwrap_or(7447);
    let backlog: usize = std::env::var("BACKLOG_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_BACKLOG);

    let state = AppState::new(Hub::new(backlog, Metrics::new()));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("NTunnel Relay on ws://{} (backlog: {} messages)", addr, backlog);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}
