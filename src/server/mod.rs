//! HTTP adapter over the dispatcher (`server` feature).

pub mod routes;

pub use routes::{create_router, AppState};

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::runtime::Shutdown;

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(dispatcher: Dispatcher, port: u16, shutdown: Shutdown) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "keywarden listening");
    info!("  POST /keys                   - create key");
    info!("  GET  /keys/:key?path=        - extended public key");
    info!("  POST /keys/:key              - import wallet export");
    info!("  POST /keys/:key/wallet       - sign PSBT");

    axum::serve(listener, create_router(dispatcher))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .context("server error")?;
    info!("server stopped");
    Ok(())
}
