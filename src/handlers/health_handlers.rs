//! Status-surface handlers.
//!
//! - GET /health          -> liveness; 503 when any worker is in error
//! - GET /metrics         -> pipeline counters
//! - GET /version         -> crate version
//! - GET /api/v1/status   -> pipeline status summary
//! - GET /api/v1/workers  -> per-worker status and last run

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::SecondsFormat;
use serde_json::{json, Map, Value};

use super::AppState;
use crate::workers::WorkerHandle;

/// `GET /health`
///
/// The system is unhealthy iff any worker's status begins with `error`.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = !state.workers.iter().any(WorkerHandle::is_errored);
    if healthy {
        (StatusCode::OK, Json(json!({ "status": "healthy" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        )
    }
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "metrics": state.metrics.snapshot() }))
}

/// `GET /version`
pub async fn version() -> impl IntoResponse {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// `GET /api/v1/status`
pub async fn pipeline_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut status = Map::new();
    status.insert(
        "validation_worker".into(),
        worker_status(state.worker("validation")),
    );
    status.insert(
        "transfer_worker".into(),
        worker_status(state.worker("transfer")),
    );
    status.insert(
        "cleanup_worker".into(),
        worker_status(state.worker("cleanup")),
    );
    status.insert(
        "last_validated".into(),
        last_run(state.worker("validation")),
    );
    status.insert(
        "last_transferred".into(),
        last_run(state.worker("transfer")),
    );
    status.insert("last_cleaned".into(), last_run(state.worker("cleanup")));
    if let Some(ftp) = state.worker("ftp-watcher") {
        status.insert("ftp_worker".into(), worker_status(Some(ftp)));
        status.insert("last_ftp_check".into(), last_run(Some(ftp)));
    }
    Json(json!({ "pipeline_status": status }))
}

/// `GET /api/v1/workers`
pub async fn workers_detail(State(state): State<AppState>) -> impl IntoResponse {
    let mut workers = Map::new();
    for (key, name) in [
        ("validation", "validation"),
        ("transfer", "transfer"),
        ("cleanup", "cleanup"),
        ("ftp", "ftp-watcher"),
    ] {
        let handle = state.worker(name);
        if name == "ftp-watcher" && handle.is_none() {
            continue;
        }
        workers.insert(
            key.into(),
            json!({
                "status": worker_status(handle),
                "last_run": last_run(handle),
            }),
        );
    }
    Json(json!({ "workers": workers }))
}

fn worker_status(handle: Option<&WorkerHandle>) -> Value {
    match handle {
        Some(handle) => Value::String(handle.status()),
        None => Value::String("not_initialized".into()),
    }
}

fn last_run(handle: Option<&WorkerHandle>) -> Value {
    match handle.and_then(WorkerHandle::last_run) {
        Some(at) => Value::String(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => Value::String("never".into()),
    }
}
