//! # HTTP Servers
//!
//! Two small axum servers:
//!
//! - metrics: Prometheus text format at `/metrics` (default port 8000)
//! - health: JSON probes at `/health`, `/ready` and `/live` (default port
//!   8080)
//!
//! Readiness flips to true once startup initialization completes and back
//! to false during graceful shutdown, so the kubelet stops routing to a
//! terminating pod before in-flight reconciles are drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::observability::metrics;

/// Shared readiness flag, also owned by the shutdown path.
#[derive(Debug)]
pub struct ServerState {
    is_ready: AtomicBool,
}

impl ServerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            is_ready: AtomicBool::new(false),
        })
    }

    pub fn mark_ready(&self) {
        self.is_ready.store(true, Ordering::Relaxed);
        info!("controller marked as ready");
    }

    pub fn mark_not_ready(&self) {
        self.is_ready.store(false, Ordering::Relaxed);
        info!("controller marked as not ready");
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Relaxed)
    }
}

/// Serve `/metrics` on `port`. Runs until the process exits.
pub async fn start_metrics_server(port: u16) -> Result<(), anyhow::Error> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("metrics server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Serve the health probes on `port`. Runs until the process exits.
pub async fn start_health_server(
    port: u16,
    state: Arc<ServerState>,
) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/live", get(liveness_handler))
        .with_state(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("health server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("failed to encode metrics: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn readiness_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "reason": "controller initializing" })),
        )
    }
}

async fn liveness_handler() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_flag_round_trips() {
        let state = ServerState::new();
        assert!(!state.is_ready());
        state.mark_ready();
        assert!(state.is_ready());
        state.mark_not_ready();
        assert!(!state.is_ready());
    }
}
