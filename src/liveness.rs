//! Liveness endpoint polled by the process supervisor.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /status` answers `{"status":"ok"}`; every other path is 404.
pub fn router() -> Router {
    Router::new().route("/status", get(status))
}

/// Bind `port` on all interfaces and serve the liveness router in the
/// background.
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn spawn(port: u16) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind liveness port {port}"))?;
    let address = listener.local_addr()?;
    info!(%address, "Liveness endpoint listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router()).await {
            error!(error = %e, "Liveness endpoint stopped");
        }
    });
    Ok((address, handle))
}
