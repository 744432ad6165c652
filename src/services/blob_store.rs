//! Local payload store: payload bytes on disk, per-payload metadata in
//! SQLite.
//!
//! Bytes live beneath `base_path/{container}/{vesselId}/{filename}`; the
//! metadata map and last-modified instant live in the `payloads` table. A
//! payload becomes visible to the rest of the pipeline only once its metadata
//! row exists, and the row is written after the bytes have been durably
//! renamed into place, so readers never observe a payload without its full
//! admission metadata.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::models::payload::Metadata;

const MAX_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("payload `{0}` not found")]
    NotFound(String),
    #[error("invalid payload path `{0}`")]
    InvalidPath(String),
    #[error("corrupt metadata for `{path}`: {source}")]
    Metadata {
        path: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One entry from a store listing.
#[derive(Debug, Clone)]
pub struct PayloadEntry {
    pub path: String,
    pub last_modified: DateTime<Utc>,
    pub metadata: Metadata,
}

#[derive(FromRow)]
struct PayloadRow {
    path: String,
    last_modified: DateTime<Utc>,
    metadata: String,
}

impl PayloadRow {
    fn into_entry(self) -> StoreResult<PayloadEntry> {
        let metadata =
            serde_json::from_str(&self.metadata).map_err(|source| StoreError::Metadata {
                path: self.path.clone(),
                source,
            })?;
        Ok(PayloadEntry {
            path: self.path,
            last_modified: self.last_modified,
            metadata,
        })
    }
}

/// Object-store gateway over SQLite metadata and on-disk payloads.
#[derive(Clone)]
pub struct BlobStore {
    db: SqlitePool,
    base_path: PathBuf,
    container: String,
}

impl BlobStore {
    /// Open the store, creating its schema and container directory if needed.
    pub async fn new(
        db: SqlitePool,
        base_path: impl Into<PathBuf>,
        container: impl Into<String>,
    ) -> StoreResult<Self> {
        let store = Self {
            db,
            base_path: base_path.into(),
            container: container.into(),
        };
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS payloads (
                 path TEXT PRIMARY KEY,
                 size_bytes INTEGER NOT NULL,
                 last_modified TEXT NOT NULL,
                 metadata TEXT NOT NULL
             )",
        )
        .execute(&store.db)
        .await?;
        fs::create_dir_all(store.container_root()).await?;
        Ok(store)
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Basic path validation to avoid trivial traversal vectors.
    ///
    /// Rejects paths that begin with `/` or contain `..`.
    fn ensure_path_safe(&self, path: &str) -> StoreResult<()> {
        if path.is_empty() || path.len() > MAX_PATH_LEN {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        if path.starts_with('/') || path.contains("..") {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        if path
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    fn container_root(&self) -> PathBuf {
        self.base_path.join(&self.container)
    }

    fn payload_file(&self, path: &str) -> PathBuf {
        self.container_root().join(path)
    }

    async fn fetch_row(&self, path: &str) -> StoreResult<PayloadRow> {
        sqlx::query_as::<_, PayloadRow>(
            "SELECT path, last_modified, metadata FROM payloads WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    /// Atomic create-or-overwrite with the full metadata set.
    ///
    /// Writes to a temp file in the target directory, fsyncs, renames into
    /// place, then upserts the metadata row. A failed row write removes the
    /// freshly renamed file so no payload is left visible without metadata.
    pub async fn put(&self, path: &str, data: &[u8], metadata: &Metadata) -> StoreResult<()> {
        self.ensure_path_safe(path)?;
        let file_path = self.payload_file(path);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = write_all_durably(&mut file, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        let metadata_json = serde_json::to_string(metadata).map_err(|source| {
            StoreError::Metadata {
                path: path.to_string(),
                source,
            }
        })?;
        let insert_result = sqlx::query(
            "INSERT INTO payloads (path, size_bytes, last_modified, metadata)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                 size_bytes = excluded.size_bytes,
                 last_modified = excluded.last_modified,
                 metadata = excluded.metadata",
        )
        .bind(path)
        .bind(data.len() as i64)
        .bind(Utc::now())
        .bind(&metadata_json)
        .execute(&self.db)
        .await;

        match insert_result {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }

    /// Fetch payload bytes and metadata.
    ///
    /// A metadata row whose physical file is missing reports `NotFound`.
    pub async fn get(&self, path: &str) -> StoreResult<(Bytes, Metadata)> {
        self.ensure_path_safe(path)?;
        let entry = self.fetch_row(path).await?.into_entry()?;
        let bytes = fs::read(self.payload_file(path)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(path.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok((Bytes::from(bytes), entry.metadata))
    }

    /// Cheap metadata-only fetch.
    pub async fn head_metadata(&self, path: &str) -> StoreResult<Metadata> {
        self.ensure_path_safe(path)?;
        Ok(self.fetch_row(path).await?.into_entry()?.metadata)
    }

    /// Replace the full metadata map.
    ///
    /// Also refreshes the last-modified instant, which is what the retention
    /// window is measured from.
    pub async fn set_metadata(&self, path: &str, metadata: &Metadata) -> StoreResult<()> {
        self.ensure_path_safe(path)?;
        let metadata_json = serde_json::to_string(metadata).map_err(|source| {
            StoreError::Metadata {
                path: path.to_string(),
                source,
            }
        })?;
        let result = sqlx::query("UPDATE payloads SET metadata = ?, last_modified = ? WHERE path = ?")
            .bind(&metadata_json)
            .bind(Utc::now())
            .bind(path)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// List payloads, optionally below a path prefix, ordered by path.
    pub async fn list(&self, prefix: Option<&str>) -> StoreResult<Vec<PayloadEntry>> {
        let rows = match prefix {
            Some(prefix) => {
                sqlx::query_as::<_, PayloadRow>(
                    "SELECT path, last_modified, metadata FROM payloads
                     WHERE path LIKE ? ORDER BY path ASC",
                )
                .bind(format!("{prefix}%"))
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, PayloadRow>(
                    "SELECT path, last_modified, metadata FROM payloads ORDER BY path ASC",
                )
                .fetch_all(&self.db)
                .await?
            }
        };
        rows.into_iter().map(PayloadRow::into_entry).collect()
    }

    /// Delete a payload: metadata row first, then the file, then any empty
    /// parent directories up to the container root.
    pub async fn delete(&self, path: &str) -> StoreResult<()> {
        self.ensure_path_safe(path)?;
        let result = sqlx::query("DELETE FROM payloads WHERE path = ?")
            .bind(path)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let file_path = self.payload_file(path);
        match fs::remove_file(&file_path).await {
            Ok(()) => debug!("removed payload file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let container_root = self.container_root();
            self.prune_empty_dirs(parent, &container_root).await;
        }
        Ok(())
    }

    /// Remove empty directories up to (but not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(()) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn write_all_durably(file: &mut File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}
