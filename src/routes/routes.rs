//! Routes for the informational status surface.
//!
//! - `GET /health`  — liveness, reflecting worker error states
//! - `GET /metrics` — pipeline counters
//! - `GET /version` — crate version
//! - `GET /api/v1/status`  — pipeline status summary
//! - `GET /api/v1/workers` — per-worker status detail
//!
//! The surface is read-only; payloads enter through the ingest drop, never
//! through HTTP.

use axum::{routing::get, Router};

use crate::handlers::health_handlers::{
    health, metrics, pipeline_status, version, workers_detail,
};
use crate::handlers::AppState;

/// Build the router for the status surface. The router carries the shared
/// [`AppState`] to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .route("/api/v1/status", get(pipeline_status))
        .route("/api/v1/workers", get(workers_detail))
}
