//! End-to-end pipeline scenarios: drop directory → ingest → validation →
//! transfer → cleanup, against file-backed SQLite in a temp directory and an
//! in-memory remote store double.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use usv_pipeline::metrics::Metrics;
use usv_pipeline::models::payload::Metadata;
use usv_pipeline::services::audit::AuditRecorder;
use usv_pipeline::services::blob_store::BlobStore;
use usv_pipeline::services::checksum::{self, Algorithm};
use usv_pipeline::services::remote_store::{RemoteError, RemoteStore};
use usv_pipeline::services::work_queue::WorkQueue;
use usv_pipeline::workers::cleanup::CleanupWorker;
use usv_pipeline::workers::ingest::{IngestWorker, LocalDrop};
use usv_pipeline::workers::transfer::TransferWorker;
use usv_pipeline::workers::validation::ValidationWorker;
use usv_pipeline::workers::Processor;

const VALIDATION_QUEUE: &str = "validation-queue";
const TRANSFER_QUEUE: &str = "transfer-queue";
const CLEANUP_QUEUE: &str = "cleanup-queue";
const BUCKET: &str = "revelare-vessel-data";
const BATCH: usize = 10;

/// In-memory remote store; can be told to fail the next N uploads or to
/// reject everything with an authorization error.
#[derive(Default)]
struct MemoryRemoteStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicU32,
    reject_auth: AtomicBool,
}

impl MemoryRemoteStore {
    fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    fn reject_with_auth_error(&self, on: bool) {
        self.reject_auth.store(on, Ordering::SeqCst);
    }

    fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    fn insert(&self, key: &str, data: &[u8]) {
        self.objects.lock().insert(key.to_string(), data.to_vec());
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn bucket(&self) -> &str {
        BUCKET
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<Option<String>, RemoteError> {
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(RemoteError::Auth("injected credential rejection".into()));
        }
        if self
            .fail_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RemoteError::Transient("injected upload failure".into()));
        }
        let etag = checksum::digest(Algorithm::Md5, data);
        self.objects.lock().insert(key.to_string(), data.to_vec());
        Ok(Some(etag))
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        Ok(self.contains(key))
    }
}

struct Pipeline {
    _tmp: TempDir,
    db: SqlitePool,
    store: BlobStore,
    queue: WorkQueue,
    audit: AuditRecorder,
    remote: Arc<MemoryRemoteStore>,
    metrics: Arc<Metrics>,
    watch_dir: PathBuf,
    ingest: IngestWorker,
    validation: ValidationWorker,
    transfer: TransferWorker,
    cleanup: CleanupWorker,
    shutdown: CancellationToken,
}

async fn pipeline() -> Pipeline {
    pipeline_with_retention(Duration::from_secs(7 * 24 * 60 * 60)).await
}

async fn pipeline_with_retention(retention: Duration) -> Pipeline {
    let tmp = tempfile::tempdir().expect("tempdir");
    let options = SqliteConnectOptions::new()
        .filename(tmp.path().join("pipeline.db"))
        .create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("connect");

    let store = BlobStore::new(db.clone(), tmp.path().join("payloads"), "usvdata")
        .await
        .expect("store");
    let queue = WorkQueue::new(db.clone()).await.expect("queue");
    let audit = AuditRecorder::new(db.clone()).await.expect("audit");
    let remote = Arc::new(MemoryRemoteStore::default());
    let metrics = Arc::new(Metrics::default());
    let watch_dir = tmp.path().join("drop");

    let ingest = IngestWorker::new(
        store.clone(),
        queue.clone(),
        Arc::new(LocalDrop),
        watch_dir.clone(),
        VALIDATION_QUEUE,
        Arc::clone(&metrics),
    );
    let validation = ValidationWorker::new(
        store.clone(),
        queue.clone(),
        VALIDATION_QUEUE,
        TRANSFER_QUEUE,
        Duration::ZERO,
        Arc::clone(&metrics),
    );
    let transfer = TransferWorker::new(
        store.clone(),
        queue.clone(),
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        TRANSFER_QUEUE,
        CLEANUP_QUEUE,
        Duration::ZERO,
        Arc::clone(&metrics),
    );
    let cleanup = CleanupWorker::new(
        store.clone(),
        queue.clone(),
        audit.clone(),
        CLEANUP_QUEUE,
        retention,
        Duration::ZERO,
        Arc::clone(&metrics),
    );

    Pipeline {
        _tmp: tmp,
        db,
        store,
        queue,
        audit,
        remote,
        metrics,
        watch_dir,
        ingest,
        validation,
        transfer,
        cleanup,
        shutdown: CancellationToken::new(),
    }
}

impl Pipeline {
    /// Write a payload and its `.md5` companion into the drop directory.
    async fn drop_pair(&self, name: &str, data: &[u8]) {
        tokio::fs::create_dir_all(&self.watch_dir).await.unwrap();
        let digest = checksum::digest(Algorithm::Md5, data);
        tokio::fs::write(self.watch_dir.join(name), data).await.unwrap();
        tokio::fs::write(
            self.watch_dir.join(format!("{name}.md5")),
            format!("{digest}  {name}\n"),
        )
        .await
        .unwrap();
    }

    /// Admit a payload directly into the store and queue it for validation,
    /// bypassing the drop.
    async fn admit(&self, path: &str, data: &[u8], checksum_value: &str) {
        let mut meta = Metadata::new();
        meta.insert("checksum", checksum_value);
        meta.insert("checksumAlgorithm", "MD5");
        if let Some(vessel) = path.split('/').next() {
            meta.insert("vesselId", vessel);
        }
        meta.insert("timestamp", Utc::now().to_rfc3339());
        self.store.put(path, data, &meta).await.unwrap();
        self.queue.enqueue(VALIDATION_QUEUE, path).await.unwrap();
    }

    async fn run_ingest(&self) {
        self.ingest.process(&self.shutdown, BATCH).await.unwrap();
    }

    async fn run_validation(&self) {
        self.validation.process(&self.shutdown, BATCH).await.unwrap();
    }

    async fn run_transfer(&self) {
        self.transfer.process(&self.shutdown, BATCH).await.unwrap();
    }

    async fn run_cleanup(&self) {
        self.cleanup.process(&self.shutdown, BATCH).await.unwrap();
    }

    async fn metadata(&self, path: &str) -> Metadata {
        self.store.head_metadata(path).await.unwrap()
    }

    async fn depth(&self, queue: &str) -> i64 {
        self.queue.depth(queue).await.unwrap()
    }

    /// Backdate a payload's last-modified instant, as if it had been sitting
    /// in the store for `days` days.
    async fn backdate(&self, path: &str, days: i64) {
        sqlx::query("UPDATE payloads SET last_modified = ? WHERE path = ?")
            .bind(Utc::now() - chrono::Duration::days(days))
            .bind(path)
            .execute(&self.db)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn happy_path_ingest_to_certificate() {
    let p = pipeline().await;
    let data = b"survey payload bytes";
    p.drop_pair("VESSEL001_survey_1.bin", data).await;

    p.run_ingest().await;
    let path = "VESSEL001/VESSEL001_survey_1.bin";
    let meta = p.metadata(path).await;
    assert_eq!(meta.get("checksum"), Some(checksum::digest(Algorithm::Md5, data).as_str()));
    assert_eq!(meta.get("checksumalgorithm"), Some("MD5"));
    assert_eq!(meta.get("vesselid"), Some("VESSEL001"));
    assert!(meta.get("timestamp").is_some());
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 1);
    // Both source artefacts moved aside.
    assert!(p.watch_dir.join("processed/VESSEL001_survey_1.bin").exists());
    assert!(p.watch_dir.join("processed/VESSEL001_survey_1.bin.md5").exists());

    p.run_validation().await;
    let meta = p.metadata(path).await;
    assert_eq!(meta.get("validationStatus"), Some("valid"));
    assert!(meta.get("validationTimestamp").is_some());
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 0);
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 1);

    p.run_transfer().await;
    let remote_key = "VESSEL001/data/VESSEL001_survey_1.bin";
    assert!(p.remote.contains(remote_key));
    let meta = p.metadata(path).await;
    assert_eq!(meta.get("transferStatus"), Some("transferred"));
    assert_eq!(
        meta.get("remoteDestination"),
        Some(format!("{BUCKET}/{remote_key}").as_str())
    );
    assert_eq!(
        meta.get("remoteEtag"),
        Some(checksum::digest(Algorithm::Md5, data).as_str())
    );
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 0);
    assert_eq!(p.depth(CLEANUP_QUEUE).await, 1);

    p.run_cleanup().await;
    assert!(p.store.head_metadata(path).await.unwrap_err().is_not_found());
    let certs = p.audit.records_for(path).await.unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0].s3_destination, format!("{BUCKET}/{remote_key}"));
    assert_eq!(p.depth(CLEANUP_QUEUE).await, 0);

    let snapshot = p.metrics.snapshot();
    assert_eq!(snapshot.files_ingested, 1);
    assert_eq!(snapshot.payloads_validated, 1);
    assert_eq!(snapshot.payloads_transferred, 1);
    assert_eq!(snapshot.payloads_deleted, 1);
    assert_eq!(snapshot.certificates_written, 1);
}

#[tokio::test]
async fn bad_checksum_never_advances() {
    let p = pipeline().await;
    let path = "VESSEL001/data_20250101_2.bin";
    p.admit(path, b"payload bytes", "00000000000000000000000000000000")
        .await;

    p.run_validation().await;
    let meta = p.metadata(path).await;
    assert_eq!(meta.get("validationStatus"), Some("invalid"));
    // The verdict is recorded and the message acknowledged, but nothing
    // advances.
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 0);
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 0);

    // Even a stray cleanup request must refuse to destroy it.
    p.queue.enqueue(CLEANUP_QUEUE, path).await.unwrap();
    p.run_cleanup().await;
    assert!(p.store.head_metadata(path).await.is_ok());
    assert!(p.audit.records_for(path).await.unwrap().is_empty());
    // The refused message reappears for a later tick.
    assert_eq!(p.depth(CLEANUP_QUEUE).await, 1);
}

#[tokio::test]
async fn transfer_retries_until_upload_succeeds() {
    let p = pipeline().await;
    let data = b"retry payload";
    let path = "VESSEL003/survey.bin";
    p.admit(path, data, &checksum::digest(Algorithm::Md5, data)).await;
    p.run_validation().await;

    p.remote.fail_next_uploads(2);
    p.run_transfer().await;
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 1);
    assert!(p.metadata(path).await.get("transferStatus").is_none());

    p.run_transfer().await;
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 1);

    // Third delivery succeeds.
    p.run_transfer().await;
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 0);
    assert_eq!(p.metadata(path).await.get("transferStatus"), Some("transferred"));
    assert!(p.remote.contains("VESSEL003/data/survey.bin"));
    assert_eq!(p.depth(CLEANUP_QUEUE).await, 1);
}

#[tokio::test]
async fn auth_failure_fails_the_transfer_tick() {
    let p = pipeline().await;
    let data = b"rejected payload";
    let path = "VESSEL011/survey.bin";
    p.admit(path, data, &checksum::digest(Algorithm::Md5, data)).await;
    p.run_validation().await;

    p.remote.reject_with_auth_error(true);
    let result = p.transfer.process(&p.shutdown, BATCH).await;
    assert!(result.is_err());
    // Nothing advanced and the message is still queued for when the
    // credentials are fixed.
    assert!(p.metadata(path).await.get("transferStatus").is_none());
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 1);

    p.remote.reject_with_auth_error(false);
    p.run_transfer().await;
    assert_eq!(p.metadata(path).await.get("transferStatus"), Some("transferred"));
}

#[tokio::test]
async fn transfer_rerun_after_crash_between_upload_and_metadata_write() {
    let p = pipeline().await;
    let data = b"crash payload";
    let path = "VESSEL004/survey.bin";
    p.admit(path, data, &checksum::digest(Algorithm::Md5, data)).await;
    p.run_validation().await;

    // Simulate a crash after the upload landed but before the metadata write:
    // the object already exists remotely, the transfer message is still
    // queued.
    p.remote.insert("VESSEL004/data/survey.bin", b"stale bytes");

    p.run_transfer().await;
    let meta = p.metadata(path).await;
    assert_eq!(meta.get("transferStatus"), Some("transferred"));
    // The re-run overwrote the remote object.
    assert_eq!(
        p.remote.objects.lock().get("VESSEL004/data/survey.bin").unwrap(),
        &data.to_vec()
    );
    assert_eq!(p.depth(CLEANUP_QUEUE).await, 1);
}

#[tokio::test]
async fn retention_scan_destroys_payload_with_lost_cleanup_message() {
    let p = pipeline_with_retention(Duration::from_secs(7 * 24 * 60 * 60)).await;
    let data = b"forgotten payload";
    let path = "VESSEL005/survey.bin";
    p.admit(path, data, &checksum::digest(Algorithm::Md5, data)).await;
    p.run_validation().await;
    p.run_transfer().await;

    // Lose the cleanup message.
    let messages = p
        .queue
        .dequeue(CLEANUP_QUEUE, BATCH, Duration::ZERO)
        .await
        .unwrap();
    for message in &messages {
        p.queue
            .delete(CLEANUP_QUEUE, &message.id, &message.pop_receipt)
            .await
            .unwrap();
    }

    // Not yet expired: the scan leaves it alone.
    p.run_cleanup().await;
    assert!(p.store.head_metadata(path).await.is_ok());

    p.backdate(path, 8).await;
    p.run_cleanup().await;
    assert!(p.store.head_metadata(path).await.unwrap_err().is_not_found());
    assert_eq!(p.audit.records_for(path).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retention_scan_skips_untransferred_payloads() {
    let p = pipeline().await;
    let data = b"not transferred";
    let path = "VESSEL006/survey.bin";
    p.admit(path, data, &checksum::digest(Algorithm::Md5, data)).await;
    p.backdate(path, 30).await;

    p.run_cleanup().await;
    assert!(p.store.head_metadata(path).await.is_ok());
    assert!(p.audit.records_for(path).await.unwrap().is_empty());
}

#[tokio::test]
async fn vessel_ids_derived_from_drop_filenames() {
    let p = pipeline().await;
    p.drop_pair("something-EKI0007.bin", b"eki payload").await;
    p.drop_pair("VESSEL002_log.bin", b"vessel payload").await;
    p.drop_pair("random.bin", b"anonymous payload").await;

    p.run_ingest().await;
    assert!(p.store.head_metadata("EKI0007/something-EKI0007.bin").await.is_ok());
    assert!(p.store.head_metadata("VESSEL002/VESSEL002_log.bin").await.is_ok());
    assert!(p.store.head_metadata("unknown/random.bin").await.is_ok());
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 3);
}

#[tokio::test]
async fn corrupt_drop_pair_is_left_in_place() {
    let p = pipeline().await;
    tokio::fs::create_dir_all(&p.watch_dir).await.unwrap();
    tokio::fs::write(p.watch_dir.join("VESSEL009_bad.bin"), b"payload")
        .await
        .unwrap();
    tokio::fs::write(
        p.watch_dir.join("VESSEL009_bad.bin.md5"),
        "00000000000000000000000000000000  VESSEL009_bad.bin\n",
    )
    .await
    .unwrap();
    // A companion with no payload is skipped, not an error.
    tokio::fs::write(p.watch_dir.join("orphan.bin.md5"), b"abc").await.unwrap();

    p.run_ingest().await;
    assert!(p
        .store
        .head_metadata("VESSEL009/VESSEL009_bad.bin")
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 0);
    // Source artefacts stay for the next tick.
    assert!(p.watch_dir.join("VESSEL009_bad.bin").exists());
    assert!(p.watch_dir.join("VESSEL009_bad.bin.md5").exists());
    assert!(p.watch_dir.join("orphan.bin.md5").exists());
}

#[tokio::test]
async fn duplicate_stage_deliveries_are_no_ops() {
    let p = pipeline().await;
    let data = b"duplicated payload";
    let path = "VESSEL007/survey.bin";
    p.admit(path, data, &checksum::digest(Algorithm::Md5, data)).await;

    // Duplicate validation delivery: the verdict is rewritten
    // deterministically and a second transfer message appears; the transfer
    // overwrite is idempotent.
    p.queue.enqueue(VALIDATION_QUEUE, path).await.unwrap();
    p.run_validation().await;
    assert_eq!(p.metadata(path).await.get("validationStatus"), Some("valid"));
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 2);

    p.run_transfer().await;
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 0);
    assert_eq!(p.metadata(path).await.get("transferStatus"), Some("transferred"));

    // Drain the cleanup messages (one per transfer delivery); the first
    // destroys the payload, the second is a no-op that must not add a second
    // certificate.
    p.run_cleanup().await;
    assert!(p.store.head_metadata(path).await.unwrap_err().is_not_found());
    assert_eq!(p.depth(CLEANUP_QUEUE).await, 0);
    assert_eq!(p.audit.records_for(path).await.unwrap().len(), 1);
}

#[tokio::test]
async fn pipeline_converges_under_repeated_transient_failures() {
    let p = pipeline().await;
    let mut paths = Vec::new();
    for i in 0..8 {
        let data = format!("survey payload number {i}").into_bytes();
        let path = format!("VESSEL{:03}/survey_{i}.bin", i % 3 + 1);
        p.admit(&path, &data, &checksum::digest(Algorithm::Md5, &data)).await;
        paths.push((path, data));
    }

    // Drive the worker ticks by hand, injecting an upload failure every
    // other round, until every payload has been relayed and destroyed.
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 50, "pipeline failed to converge");
        if rounds % 2 == 1 {
            p.remote.fail_next_uploads(1);
        }
        p.run_validation().await;
        let _ = p.transfer.process(&p.shutdown, BATCH).await;
        p.run_cleanup().await;

        let drained = p.depth(VALIDATION_QUEUE).await == 0
            && p.depth(TRANSFER_QUEUE).await == 0
            && p.depth(CLEANUP_QUEUE).await == 0;
        if drained && p.store.list(None).await.unwrap().is_empty() {
            break;
        }
    }

    for (path, data) in &paths {
        let vessel = path.split('/').next().unwrap();
        let file = path.rsplit('/').next().unwrap();
        let key = format!("{vessel}/data/{file}");
        assert!(p.remote.contains(&key), "missing remote object {key}");
        assert_eq!(
            p.remote.objects.lock().get(&key).unwrap(),
            data,
            "remote bytes differ for {key}"
        );
        // Exactly one destruction certificate per payload, each naming the
        // remote destination.
        let certs = p.audit.records_for(path).await.unwrap();
        assert_eq!(certs.len(), 1, "certificate count for {path}");
        assert_eq!(certs[0].s3_destination, format!("{BUCKET}/{key}"));
    }

    let snapshot = p.metrics.snapshot();
    assert_eq!(snapshot.payloads_validated, 8);
    assert_eq!(snapshot.payloads_transferred, 8);
    assert_eq!(snapshot.payloads_deleted, 8);
    assert_eq!(snapshot.certificates_written, 8);
}

#[tokio::test]
async fn validation_without_checksum_leaves_message_queued() {
    let p = pipeline().await;
    let path = "VESSEL008/survey.bin";
    let mut meta = Metadata::new();
    meta.insert("vesselId", "VESSEL008");
    p.store.put(path, b"payload", &meta).await.unwrap();
    p.queue.enqueue(VALIDATION_QUEUE, path).await.unwrap();

    p.run_validation().await;
    // No verdict recorded, message left for redelivery.
    assert!(p.metadata(path).await.get("validationStatus").is_none());
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 1);
}

#[tokio::test]
async fn unsupported_algorithm_is_not_retried() {
    let p = pipeline().await;
    let path = "VESSEL010/survey.bin";
    let mut meta = Metadata::new();
    meta.insert("checksum", "abc123");
    meta.insert("checksumAlgorithm", "crc32");
    p.store.put(path, b"payload", &meta).await.unwrap();
    p.queue.enqueue(VALIDATION_QUEUE, path).await.unwrap();

    p.run_validation().await;
    // Acknowledged without a verdict: operator action required.
    assert_eq!(p.depth(VALIDATION_QUEUE).await, 0);
    assert!(p.metadata(path).await.get("validationStatus").is_none());
    assert_eq!(p.depth(TRANSFER_QUEUE).await, 0);
}
