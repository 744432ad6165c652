//! Transfer worker: relays validated payloads to the remote vessel-data
//! bucket and records the landing on the payload.
//!
//! An upload is only considered landed once the existence probe confirms it.
//! Failures leave the queue message to reappear, so transfers retry without
//! bound across ticks; re-uploading an already landed payload just overwrites
//! the same key.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::models::payload::{
    self, KEY_REMOTE_DESTINATION, KEY_REMOTE_ETAG, KEY_TRANSFER_STATUS, KEY_TRANSFER_TIMESTAMP,
    KEY_VALIDATION_STATUS, KEY_VESSEL_ID, TRANSFER_TRANSFERRED, VALIDATION_VALID,
};
use crate::services::blob_store::BlobStore;
use crate::services::remote_store::{self, RemoteError, RemoteStore};
use crate::services::work_queue::WorkQueue;
use crate::workers::Processor;

pub struct TransferWorker {
    store: BlobStore,
    queue: WorkQueue,
    remote: Arc<dyn RemoteStore>,
    transfer_queue: String,
    cleanup_queue: String,
    visibility: Duration,
    metrics: Arc<Metrics>,
}

impl TransferWorker {
    pub fn new(
        store: BlobStore,
        queue: WorkQueue,
        remote: Arc<dyn RemoteStore>,
        transfer_queue: impl Into<String>,
        cleanup_queue: impl Into<String>,
        visibility: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            transfer_queue: transfer_queue.into(),
            cleanup_queue: cleanup_queue.into(),
            visibility,
            metrics,
        }
    }

    /// Upload one validated payload and mark it transferred.
    async fn transfer_payload(&self, path: &str) -> anyhow::Result<()> {
        let metadata = self.store.head_metadata(path).await?;

        let validation_status = metadata.get(KEY_VALIDATION_STATUS).unwrap_or_default();
        if validation_status != VALIDATION_VALID {
            anyhow::bail!(
                "payload {path} has not been validated (status `{validation_status}`)"
            );
        }

        let vessel_id = metadata
            .get(KEY_VESSEL_ID)
            .or_else(|| payload::vessel_from_path(path))
            .context("vessel id not found in metadata or payload path")?
            .to_string();
        let file_name = payload::file_name(path);
        let key = remote_store::object_key(&vessel_id, file_name);

        let (bytes, _) = self.store.get(path).await?;
        let etag = self
            .remote
            .upload(&key, &bytes)
            .await
            .with_context(|| format!("uploading {path} to {key}"))?;

        // Second confirmation before anything is marked transferred.
        let landed = self
            .remote
            .exists(&key)
            .await
            .with_context(|| format!("verifying upload of {key}"))?;
        if !landed {
            anyhow::bail!("upload of {key} appeared to succeed but object was not found");
        }

        // Re-read so concurrent stage writes are not clobbered.
        let mut metadata = self.store.head_metadata(path).await?;
        metadata.insert(KEY_TRANSFER_STATUS, TRANSFER_TRANSFERRED);
        metadata.insert(
            KEY_TRANSFER_TIMESTAMP,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        metadata.insert(
            KEY_REMOTE_DESTINATION,
            format!("{}/{}", self.remote.bucket(), key),
        );
        if let Some(etag) = etag.filter(|etag| !etag.is_empty()) {
            metadata.insert(KEY_REMOTE_ETAG, etag);
        }
        self.store.set_metadata(path, &metadata).await?;
        Ok(())
    }
}

#[async_trait]
impl Processor for TransferWorker {
    async fn process(
        &self,
        shutdown: &CancellationToken,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        let messages = self
            .queue
            .dequeue(&self.transfer_queue, batch_size, self.visibility)
            .await?;
        if messages.is_empty() {
            debug!("no transfer messages found in queue");
            return Ok(());
        }
        debug!("received {} messages from transfer queue", messages.len());

        for message in messages {
            if shutdown.is_cancelled() {
                break;
            }
            let path = message.body.as_str();

            if let Err(err) = self.transfer_payload(path).await {
                // Authorization failures need operator action; failing the
                // tick parks the worker in an error status the health probe
                // can see.
                let is_auth = err.chain().any(|cause| {
                    matches!(cause.downcast_ref::<RemoteError>(), Some(RemoteError::Auth(_)))
                });
                if is_auth {
                    return Err(err);
                }
                // Otherwise the message stays claimed until its visibility
                // expires, then retries on a later tick.
                warn!("failed to transfer {path}: {err:#}");
                continue;
            }

            match self
                .queue
                .delete(&self.transfer_queue, &message.id, &message.pop_receipt)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("transfer message for {path} already acknowledged"),
                Err(err) => {
                    warn!("failed to delete transfer message for {path}: {err}");
                    continue;
                }
            }

            Metrics::incr(&self.metrics.payloads_transferred);
            info!("payload {path} transferred to remote store");

            if let Err(err) = self.queue.enqueue(&self.cleanup_queue, path).await {
                // The retention scan will still pick the payload up.
                warn!("failed to queue cleanup for {path}: {err}");
            }
        }
        Ok(())
    }
}
