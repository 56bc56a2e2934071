//! Liveness and readiness probes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tracing::info;

/// Flipped once plugins are initialised and workers run.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) { self.0.store(true, Ordering::Release) }
    pub fn is_ready(&self) -> bool { self.0.load(Ordering::Acquire) }
}

async fn readyz(State(ready): State<Readiness>) -> (StatusCode, &'static str) {
    if ready.is_ready() { (StatusCode::OK, "ready") } else { (StatusCode::SERVICE_UNAVAILABLE, "initialising") }
}

pub fn router(ready: Readiness) -> Router {
    Router::new().route("/healthz", get(|| async { "ok" })).route("/readyz", get(readyz)).with_state(ready)
}

pub async fn serve(addr: SocketAddr, ready: Readiness) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding health listener on {}", addr))?;
    info!(addr = %addr, "health server listening");
    axum::serve(listener, router(ready)).await.context("health server failed")
}
