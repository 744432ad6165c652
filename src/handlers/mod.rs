//! HTTP handlers for the informational status surface.

pub mod health_handlers;

use std::sync::Arc;

use crate::metrics::Metrics;
use crate::workers::WorkerHandle;

/// Shared state for the status surface: the worker handles (in start order)
/// and the process metric registry.
#[derive(Clone)]
pub struct AppState {
    pub workers: Vec<WorkerHandle>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn worker(&self, name: &str) -> Option<&WorkerHandle> {
        self.workers.iter().find(|handle| handle.name() == name)
    }
}
