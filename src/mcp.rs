//! MCP Tool Endpoint (C4).
//!
//! An HTTP server exposing exactly one tool, `submit_pr`, that a child coding
//! agent calls to hand its completion summary back to the tick loop. Built on
//! `axum`, the same HTTP stack the teacher uses for its analytics API server
//! (`src/analytics/api_server.rs`), but scoped to a single JSON-RPC-ish route
//! instead of a REST surface.
//!
//! The summary is a single-slot mailbox (§9): one writer (this handler), one
//! reader-clearer (the tick loop), guarded by a mutex. `SubmitPrSlot` wraps
//! an `Arc<Mutex<Option<String>>>` cloned into axum's `State` rather than a
//! process-wide static, so the orchestrator and the server task share the
//! same slot without either owning the other's lifetime.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SubmitPrSlot {
    inner: Arc<Mutex<Option<String>>>,
}

impl SubmitPrSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, summary: String) {
        *self.inner.lock().expect("submit_pr slot poisoned") = Some(summary);
    }

    /// Atomically reads and clears the stored summary. Empty string means no
    /// summary has been submitted since the last clear.
    pub fn consume(&self) -> String {
        self.inner
            .lock()
            .expect("submit_pr slot poisoned")
            .take()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        *self.inner.lock().expect("submit_pr slot poisoned") = None;
    }
}

#[derive(Debug, Deserialize)]
struct SubmitPrRequest {
    summary: String,
}

#[derive(Debug, Serialize)]
struct SubmitPrResponse {
    ok: bool,
}

async fn submit_pr(State(slot): State<SubmitPrSlot>, Json(req): Json<SubmitPrRequest>) -> Json<SubmitPrResponse> {
    info!(summary_len = req.summary.len(), "received submit_pr");
    slot.store(req.summary);
    Json(SubmitPrResponse { ok: true })
}

fn build_router(slot: SubmitPrSlot) -> Router {
    Router::new()
        .route("/mcp/submit_pr", post(submit_pr))
        .with_state(slot)
}

pub struct McpServerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl McpServerHandle {
    /// Signals the server task to stop accepting connections and waits for
    /// it to finish — coordinated via a `Notify` flag rather than a
    /// cross-task destructor, per §9's open-question resolution.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

/// Starts the MCP HTTP server on a background task bound to `addr`.
pub async fn spawn(addr: SocketAddr, slot: SubmitPrSlot) -> std::io::Result<McpServerHandle> {
    let app = build_router(slot);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "scriptorium MCP endpoint listening");

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);

    let join = tokio::spawn(async move {
        let graceful = async move {
            shutdown_signal.notified().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(graceful)
            .await
        {
            tracing::error!(error = %e, "MCP server exited with error");
        }
    });

    Ok(McpServerHandle { shutdown, join })
}
