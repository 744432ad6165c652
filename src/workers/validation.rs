//! Validation worker: recomputes each admitted payload's digest against the
//! checksum it was admitted with and records the verdict on the payload.
//!
//! The verdict is recorded on the object either way; only valid payloads
//! advance to the transfer queue. Invalid payloads stay put for operator
//! action.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::models::payload::{
    KEY_CHECKSUM, KEY_CHECKSUM_ALGORITHM, KEY_VALIDATION_STATUS, KEY_VALIDATION_TIMESTAMP,
    VALIDATION_INVALID, VALIDATION_VALID,
};
use crate::services::blob_store::{BlobStore, StoreError};
use crate::services::checksum::{self, Algorithm, ChecksumError};
use crate::services::work_queue::WorkQueue;
use crate::workers::Processor;

#[derive(Debug, Error)]
enum ValidationError {
    #[error("checksum not found in metadata for `{0}`")]
    MissingChecksum(String),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ValidationWorker {
    store: BlobStore,
    queue: WorkQueue,
    validation_queue: String,
    transfer_queue: String,
    visibility: Duration,
    metrics: Arc<Metrics>,
}

impl ValidationWorker {
    pub fn new(
        store: BlobStore,
        queue: WorkQueue,
        validation_queue: impl Into<String>,
        transfer_queue: impl Into<String>,
        visibility: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            validation_queue: validation_queue.into(),
            transfer_queue: transfer_queue.into(),
            visibility,
            metrics,
        }
    }

    /// Recompute the digest and write the verdict onto the payload metadata.
    async fn validate_payload(&self, path: &str) -> Result<bool, ValidationError> {
        let mut metadata = self.store.head_metadata(path).await?;

        let expected = metadata
            .get(KEY_CHECKSUM)
            .map(str::to_string)
            .ok_or_else(|| {
                debug!("metadata keys for {path}: {}", metadata.keys());
                ValidationError::MissingChecksum(path.to_string())
            })?;
        let algorithm =
            Algorithm::from_label(metadata.get(KEY_CHECKSUM_ALGORITHM).unwrap_or_default())?;

        let (bytes, _) = self.store.get(path).await?;
        let computed = checksum::digest(algorithm, &bytes);
        let is_valid = checksum::digests_match(&computed, &expected);
        debug!(
            "checksum comparison for {path}: calculated={computed}, expected={expected}, algorithm={algorithm}"
        );

        metadata.insert(
            KEY_VALIDATION_STATUS,
            if is_valid { VALIDATION_VALID } else { VALIDATION_INVALID },
        );
        metadata.insert(
            KEY_VALIDATION_TIMESTAMP,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        self.store.set_metadata(path, &metadata).await?;
        Ok(is_valid)
    }
}

#[async_trait]
impl Processor for ValidationWorker {
    async fn process(
        &self,
        shutdown: &CancellationToken,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        let messages = self
            .queue
            .dequeue(&self.validation_queue, batch_size, self.visibility)
            .await?;
        if messages.is_empty() {
            debug!("no validation messages found in queue");
            return Ok(());
        }
        debug!("received {} messages from validation queue", messages.len());

        for message in messages {
            if shutdown.is_cancelled() {
                break;
            }
            let path = message.body.as_str();

            let ack = match self.validate_payload(path).await {
                Ok(is_valid) => {
                    if is_valid {
                        Metrics::incr(&self.metrics.payloads_validated);
                        info!("payload {path} validated, queueing for transfer");
                        if let Err(err) =
                            self.queue.enqueue(&self.transfer_queue, path).await
                        {
                            warn!("failed to queue transfer for {path}: {err}");
                        }
                    } else {
                        Metrics::incr(&self.metrics.validation_failures);
                        warn!("payload {path} failed checksum validation");
                    }
                    true
                }
                // Bad data: acknowledge so the message stops retrying, leave
                // the payload unadvanced for operator action.
                Err(ValidationError::Checksum(err)) => {
                    error!("cannot validate {path}: {err}");
                    true
                }
                Err(ValidationError::Store(err)) if err.is_not_found() => {
                    warn!("payload {path} is gone, dropping validation message");
                    true
                }
                // Transient or missing-checksum failures: leave the message
                // to reappear after its visibility timeout.
                Err(err) => {
                    warn!("failed to validate {path}: {err}");
                    false
                }
            };

            if ack {
                match self
                    .queue
                    .delete(&self.validation_queue, &message.id, &message.pop_receipt)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!("validation message for {path} already acknowledged"),
                    Err(err) => warn!("failed to delete validation message for {path}: {err}"),
                }
            }
        }
        Ok(())
    }
}
