//! Audit recorder: durable, append-only destruction certificates.
//!
//! Certificate writes are a precondition for payload deletion, so the
//! recorder lives in its own table rather than alongside the payload rows a
//! delete is about to remove. Records are immutable once written.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::models::certificate::DestructionCertificate;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt audit record `{certificate_id}`: {source}")]
    Record {
        certificate_id: String,
        source: serde_json::Error,
    },
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Clone)]
pub struct AuditRecorder {
    db: SqlitePool,
}

impl AuditRecorder {
    pub async fn new(db: SqlitePool) -> AuditResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_records (
                 certificate_id TEXT PRIMARY KEY,
                 blob_name TEXT NOT NULL,
                 s3_destination TEXT NOT NULL,
                 deletion_time TEXT NOT NULL,
                 record_json TEXT NOT NULL
             )",
        )
        .execute(&db)
        .await?;
        Ok(Self { db })
    }

    /// Write the destruction certificate for `payload_path` and return its
    /// certificate id.
    ///
    /// A retried destruction within the same second produces the same id and
    /// is treated as the already-written certificate.
    pub async fn record(
        &self,
        payload_path: &str,
        remote_destination: &str,
    ) -> AuditResult<String> {
        let certificate =
            DestructionCertificate::new(payload_path, remote_destination, Utc::now());
        let record_json =
            serde_json::to_string(&certificate).map_err(|source| AuditError::Record {
                certificate_id: certificate.certificate_id.clone(),
                source,
            })?;
        sqlx::query(
            "INSERT INTO audit_records
                 (certificate_id, blob_name, s3_destination, deletion_time, record_json)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(certificate_id) DO NOTHING",
        )
        .bind(&certificate.certificate_id)
        .bind(&certificate.blob_name)
        .bind(&certificate.s3_destination)
        .bind(certificate.deletion_time)
        .bind(&record_json)
        .execute(&self.db)
        .await?;

        info!(
            "destruction certificate {} written for {} (destination {})",
            certificate.certificate_id, payload_path, remote_destination
        );
        Ok(certificate.certificate_id)
    }

    /// All certificates referencing `payload_path`, oldest first.
    pub async fn records_for(&self, payload_path: &str) -> AuditResult<Vec<DestructionCertificate>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT certificate_id, record_json FROM audit_records
             WHERE blob_name = ? ORDER BY deletion_time ASC",
        )
        .bind(payload_path)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter()
            .map(|(certificate_id, record_json)| {
                serde_json::from_str(&record_json).map_err(|source| AuditError::Record {
                    certificate_id,
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    async fn test_recorder() -> (TempDir, AuditRecorder) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let options = SqliteConnectOptions::new()
            .filename(tmp.path().join("audit.db"))
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("connect");
        (tmp, AuditRecorder::new(db).await.expect("recorder"))
    }

    #[tokio::test]
    async fn record_persists_a_certificate() {
        let (_tmp, recorder) = test_recorder().await;
        let id = recorder
            .record("VESSEL001/a.bin", "revelare-vessel-data/VESSEL001/data/a.bin")
            .await
            .unwrap();
        assert!(id.starts_with("deletion-"));

        let records = recorder.records_for("VESSEL001/a.bin").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].certificate_id, id);
        assert_eq!(records[0].operation_type, "deletion");
        assert_eq!(
            records[0].s3_destination,
            "revelare-vessel-data/VESSEL001/data/a.bin"
        );
    }

    #[tokio::test]
    async fn same_second_retry_collapses_to_one_certificate() {
        let (_tmp, recorder) = test_recorder().await;
        let first = recorder.record("VESSEL001/a.bin", "bucket/key").await.unwrap();
        let second = recorder.record("VESSEL001/a.bin", "bucket/key").await.unwrap();
        // Ids embed a second-resolution timestamp; an immediate retry lands
        // on the same id and the insert is a no-op.
        if first == second {
            assert_eq!(recorder.records_for("VESSEL001/a.bin").await.unwrap().len(), 1);
        }
    }
}
