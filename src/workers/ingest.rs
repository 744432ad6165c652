//! Ingest worker: watches a drop for payload + `.md5` companion pairs and
//! admits verified payloads into the local store.
//!
//! The drop is either an FTP server or a local directory. Both feed the same
//! staging-directory processing path: the FTP source merely pulls complete
//! pairs into the staging directory first and deletes them from the server
//! once they have been admitted, so the two modes stay behaviorally
//! identical.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use suppaftp::FtpStream;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FtpConfig;
use crate::metrics::Metrics;
use crate::models::payload::{
    Metadata, KEY_CHECKSUM, KEY_CHECKSUM_ALGORITHM, KEY_TIMESTAMP, KEY_VESSEL_ID,
};
use crate::services::blob_store::BlobStore;
use crate::services::checksum::{self, Algorithm};
use crate::services::work_queue::WorkQueue;
use crate::workers::Processor;

const MD5_SUFFIX: &str = ".md5";
const PROCESSED_DIR: &str = "processed";
const FTP_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Where newly dropped files come from and where they go once admitted.
#[async_trait]
pub trait DropSource: Send + Sync {
    /// Pull up to `batch_size` complete payload/companion pairs into the
    /// staging directory. A local drop has nothing to pull.
    async fn sync(&self, staging: &Path, batch_size: usize) -> anyhow::Result<()>;

    /// Remove successfully admitted files from the origin. Receives the
    /// staged file names (payloads and companions).
    async fn finalize(&self, names: &[String]) -> anyhow::Result<()>;
}

/// Drop that is just the staging directory itself.
pub struct LocalDrop;

#[async_trait]
impl DropSource for LocalDrop {
    async fn sync(&self, _staging: &Path, _batch_size: usize) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize(&self, _names: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// FTP-backed drop. Each operation runs one short-lived blocking session on
/// the blocking pool; connections are retried with a bounded dial timeout.
pub struct FtpDrop {
    cfg: FtpConfig,
}

impl FtpDrop {
    pub fn new(cfg: FtpConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl DropSource for FtpDrop {
    async fn sync(&self, staging: &Path, batch_size: usize) -> anyhow::Result<()> {
        let cfg = self.cfg.clone();
        let staging = staging.to_path_buf();
        tokio::task::spawn_blocking(move || sync_from_ftp(&cfg, &staging, batch_size))
            .await
            .context("ftp sync task panicked")?
    }

    async fn finalize(&self, names: &[String]) -> anyhow::Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let cfg = self.cfg.clone();
        let names = names.to_vec();
        tokio::task::spawn_blocking(move || delete_from_ftp(&cfg, &names))
            .await
            .context("ftp delete task panicked")?
    }
}

fn connect_ftp(cfg: &FtpConfig) -> anyhow::Result<FtpStream> {
    let addr: SocketAddr = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .with_context(|| format!("resolving ftp host {}:{}", cfg.host, cfg.port))?
        .next()
        .with_context(|| format!("no address for ftp host {}:{}", cfg.host, cfg.port))?;

    let mut last_err = None;
    for attempt in 0..=cfg.retry_count {
        if attempt > 0 {
            debug!("retrying ftp connection (attempt {}/{})", attempt, cfg.retry_count);
            std::thread::sleep(cfg.retry_delay);
        }
        match FtpStream::connect_timeout(addr, FTP_DIAL_TIMEOUT) {
            Ok(stream) => {
                let mut stream = stream;
                stream
                    .login(&cfg.user, &cfg.password)
                    .context("ftp login failed")?;
                return Ok(stream);
            }
            Err(err) => {
                warn!("failed to connect to ftp server {addr}: {err}");
                last_err = Some(err);
            }
        }
    }
    Err(anyhow::anyhow!(
        "failed to connect to ftp server after {} attempts: {}",
        cfg.retry_count + 1,
        last_err.map(|err| err.to_string()).unwrap_or_default()
    ))
}

fn sync_from_ftp(cfg: &FtpConfig, staging: &Path, batch_size: usize) -> anyhow::Result<()> {
    let mut stream = connect_ftp(cfg)?;
    let names = stream.nlst(None).context("listing ftp directory")?;
    debug!("found {} entries on ftp server", names.len());

    let mut pulled = 0;
    for name in &names {
        if pulled >= batch_size {
            break;
        }
        let Some(payload_name) = name.strip_suffix(MD5_SUFFIX) else {
            continue;
        };
        if !names.iter().any(|other| other == payload_name) {
            debug!("payload not present yet for companion {name}");
            continue;
        }
        let companion = match stream.retr_as_buffer(name) {
            Ok(buffer) => buffer.into_inner(),
            Err(err) => {
                warn!("failed to download {name}: {err}");
                continue;
            }
        };
        let payload = match stream.retr_as_buffer(payload_name) {
            Ok(buffer) => buffer.into_inner(),
            Err(err) => {
                warn!("failed to download {payload_name}: {err}");
                continue;
            }
        };
        std::fs::write(staging.join(name), companion)?;
        std::fs::write(staging.join(payload_name), payload)?;
        pulled += 1;
    }

    let _ = stream.quit();
    Ok(())
}

fn delete_from_ftp(cfg: &FtpConfig, names: &[String]) -> anyhow::Result<()> {
    let mut stream = connect_ftp(cfg)?;
    for name in names {
        if let Err(err) = stream.rm(name) {
            warn!("failed to delete {name} from ftp server: {err}");
        }
    }
    let _ = stream.quit();
    Ok(())
}

/// Admits dropped payloads into the local store and queues them for
/// validation.
pub struct IngestWorker {
    store: BlobStore,
    queue: WorkQueue,
    source: Arc<dyn DropSource>,
    watch_dir: PathBuf,
    validation_queue: String,
    metrics: Arc<Metrics>,
}

impl IngestWorker {
    pub fn new(
        store: BlobStore,
        queue: WorkQueue,
        source: Arc<dyn DropSource>,
        watch_dir: PathBuf,
        validation_queue: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            source,
            watch_dir,
            validation_queue: validation_queue.into(),
            metrics,
        }
    }

    /// Handle one staged pair. Any error leaves the staged files where they
    /// are; the next tick sees them again.
    async fn admit_pair(&self, companion_name: &str, payload_name: &str) -> anyhow::Result<()> {
        let companion_path = self.watch_dir.join(companion_name);
        let payload_path = self.watch_dir.join(payload_name);

        let companion = fs::read_to_string(&companion_path)
            .await
            .with_context(|| format!("reading {companion_name}"))?;
        let expected = parse_digest_file(&companion)
            .with_context(|| format!("no digest found in {companion_name}"))?;

        let payload = fs::read(&payload_path)
            .await
            .with_context(|| format!("reading {payload_name}"))?;
        let computed = checksum::digest(Algorithm::Md5, &payload);
        if !checksum::digests_match(&computed, &expected) {
            anyhow::bail!(
                "md5 mismatch for {payload_name}: expected {expected}, got {computed}"
            );
        }

        let vessel_id = derive_vessel_id(payload_name);
        let blob_path = format!("{vessel_id}/{payload_name}");

        let mut metadata = Metadata::new();
        metadata.insert(KEY_CHECKSUM, expected);
        metadata.insert(KEY_CHECKSUM_ALGORITHM, Algorithm::Md5.to_string());
        metadata.insert(KEY_VESSEL_ID, vessel_id);
        metadata.insert(
            KEY_TIMESTAMP,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        self.store
            .put(&blob_path, &payload, &metadata)
            .await
            .with_context(|| format!("admitting {blob_path}"))?;
        self.queue
            .enqueue(&self.validation_queue, &blob_path)
            .await
            .with_context(|| format!("queueing validation for {blob_path}"))?;

        // Both source artefacts move aside only after the payload is admitted
        // and queued.
        let processed = self.watch_dir.join(PROCESSED_DIR);
        fs::rename(&payload_path, processed.join(payload_name)).await?;
        fs::rename(&companion_path, processed.join(companion_name)).await?;

        info!("admitted {blob_path} for validation");
        Ok(())
    }
}

#[async_trait]
impl Processor for IngestWorker {
    async fn process(
        &self,
        shutdown: &CancellationToken,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.watch_dir).await?;
        fs::create_dir_all(self.watch_dir.join(PROCESSED_DIR)).await?;

        self.source.sync(&self.watch_dir, batch_size).await?;

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.watch_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();

        let mut admitted = Vec::new();
        let mut processed_count = 0;
        for name in &names {
            if processed_count >= batch_size || shutdown.is_cancelled() {
                break;
            }
            let Some(payload_name) = name.strip_suffix(MD5_SUFFIX) else {
                continue;
            };
            if !names.iter().any(|other| other == payload_name) {
                debug!("payload not found for companion {name}");
                continue;
            }
            match self.admit_pair(name, payload_name).await {
                Ok(()) => {
                    Metrics::incr(&self.metrics.files_ingested);
                    admitted.push(payload_name.to_string());
                    admitted.push(name.clone());
                    processed_count += 1;
                }
                Err(err) => warn!("failed to process {payload_name}: {err:#}"),
            }
        }

        if let Err(err) = self.source.finalize(&admitted).await {
            // The files will be pulled and admitted again next tick; the
            // overwrite on re-admission is harmless.
            warn!("failed to remove admitted files from drop: {err:#}");
        }
        if processed_count > 0 {
            info!("ingested {processed_count} payloads");
        }
        Ok(())
    }
}

/// Vessel id from a dropped filename.
///
/// `something-EKI0007.bin` → `EKI0007`; `VESSEL002_log.bin` → `VESSEL002`;
/// anything else → `unknown`.
pub fn derive_vessel_id(file_name: &str) -> String {
    if let Some((_, rest)) = file_name.split_once("-EKI") {
        let token = rest.split('.').next().unwrap_or(rest);
        return format!("EKI{token}");
    }
    if let Some((_, rest)) = file_name.split_once("VESSEL") {
        let token = rest.split('_').next().unwrap_or(rest);
        return format!("VESSEL{token}");
    }
    "unknown".to_string()
}

/// First whitespace-delimited token of a companion digest file; trailing
/// filenames and newlines are ignored.
pub fn parse_digest_file(contents: &str) -> Option<String> {
    contents
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}
