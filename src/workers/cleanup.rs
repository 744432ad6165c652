//! Cleanup worker: destroys transferred payloads behind a destruction
//! certificate.
//!
//! Work arrives on the cleanup queue; when the queue is empty the worker
//! instead scans the store for transferred payloads that outlived the
//! retention window, so a lost cleanup message never strands a payload. In
//! both paths the certificate write strictly precedes the delete, and nothing
//! is ever deleted unless its metadata says `transferred`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::models::payload::{KEY_REMOTE_DESTINATION, KEY_TRANSFER_STATUS, TRANSFER_TRANSFERRED};
use crate::services::audit::{AuditError, AuditRecorder};
use crate::services::blob_store::{BlobStore, StoreError};
use crate::services::work_queue::WorkQueue;
use crate::workers::Processor;

#[derive(Debug, Error)]
enum CleanupError {
    #[error("payload `{0}` has not been transferred yet")]
    NotTransferred(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

pub struct CleanupWorker {
    store: BlobStore,
    queue: WorkQueue,
    audit: AuditRecorder,
    cleanup_queue: String,
    retention: Duration,
    visibility: Duration,
    metrics: Arc<Metrics>,
}

impl CleanupWorker {
    pub fn new(
        store: BlobStore,
        queue: WorkQueue,
        audit: AuditRecorder,
        cleanup_queue: impl Into<String>,
        retention: Duration,
        visibility: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            audit,
            cleanup_queue: cleanup_queue.into(),
            retention,
            visibility,
            metrics,
        }
    }

    /// Certificate first, then delete. Refuses anything not yet transferred.
    async fn destroy_payload(&self, path: &str) -> Result<(), CleanupError> {
        let metadata = self.store.head_metadata(path).await?;

        let transfer_status = metadata.get(KEY_TRANSFER_STATUS).unwrap_or_default();
        if transfer_status != TRANSFER_TRANSFERRED {
            return Err(CleanupError::NotTransferred(path.to_string()));
        }
        let destination = metadata.get(KEY_REMOTE_DESTINATION).unwrap_or("unknown");

        self.audit.record(path, destination).await?;
        Metrics::incr(&self.metrics.certificates_written);

        match self.store.delete(path).await {
            Ok(()) => {}
            // A second attempt after a crash between certificate and delete.
            Err(err) if err.is_not_found() => {
                debug!("payload {path} already deleted");
            }
            Err(err) => return Err(err.into()),
        }
        Metrics::incr(&self.metrics.payloads_deleted);
        Ok(())
    }

    /// Fallback path: destroy transferred payloads older than the retention
    /// window even though their cleanup message never arrived.
    async fn process_expired(
        &self,
        shutdown: &CancellationToken,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        debug!("no cleanup messages found in queue, checking for expired payloads");
        let now = Utc::now();
        let retention =
            chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);

        let mut destroyed = 0;
        for entry in self.store.list(None).await? {
            if destroyed >= batch_size || shutdown.is_cancelled() {
                break;
            }
            let transferred = entry
                .metadata
                .get(KEY_TRANSFER_STATUS)
                .is_some_and(|status| status == TRANSFER_TRANSFERRED);
            if !transferred {
                continue;
            }
            if now.signed_duration_since(entry.last_modified) <= retention {
                continue;
            }
            match self.destroy_payload(&entry.path).await {
                Ok(()) => {
                    info!("expired payload {} destroyed", entry.path);
                    destroyed += 1;
                }
                Err(err) => warn!("failed to destroy expired payload {}: {err}", entry.path),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for CleanupWorker {
    async fn process(
        &self,
        shutdown: &CancellationToken,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        let messages = self
            .queue
            .dequeue(&self.cleanup_queue, batch_size, self.visibility)
            .await?;
        if messages.is_empty() {
            return self.process_expired(shutdown, batch_size).await;
        }
        debug!("received {} messages from cleanup queue", messages.len());

        for message in messages {
            if shutdown.is_cancelled() {
                break;
            }
            let path = message.body.as_str();

            let ack = match self.destroy_payload(path).await {
                Ok(()) => {
                    info!("payload {path} destroyed");
                    true
                }
                // Already gone: a duplicate delivery after a completed
                // destruction is a no-op.
                Err(CleanupError::Store(err)) if err.is_not_found() => {
                    debug!("payload {path} already gone, dropping cleanup message");
                    true
                }
                // Precondition failure or transient error: leave the message
                // to reappear.
                Err(err) => {
                    warn!("failed to destroy {path}: {err}");
                    false
                }
            };

            if ack {
                match self
                    .queue
                    .delete(&self.cleanup_queue, &message.id, &message.pop_receipt)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!("cleanup message for {path} already acknowledged"),
                    Err(err) => warn!("failed to delete cleanup message for {path}: {err}"),
                }
            }
        }
        Ok(())
    }
}
