//! Destruction certificates: the immutable record justifying a delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit record written before a payload is destroyed.
///
/// Serialized to JSON in the wire casing the downstream audit consumers
/// expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestructionCertificate {
    pub id: String,
    #[serde(rename = "blobName")]
    pub blob_name: String,
    #[serde(rename = "operationType")]
    pub operation_type: String,
    #[serde(rename = "s3Destination")]
    pub s3_destination: String,
    #[serde(rename = "deletionTime")]
    pub deletion_time: DateTime<Utc>,
    #[serde(rename = "certificateId")]
    pub certificate_id: String,
}

impl DestructionCertificate {
    /// Build the certificate for destroying `payload_path`, stamped `now`.
    pub fn new(payload_path: &str, remote_destination: &str, now: DateTime<Utc>) -> Self {
        let certificate_id = certificate_id(payload_path, now);
        Self {
            id: format!("{payload_path}_{certificate_id}"),
            blob_name: payload_path.to_string(),
            operation_type: "deletion".to_string(),
            s3_destination: remote_destination.to_string(),
            deletion_time: now,
            certificate_id,
        }
    }
}

/// Certificate id: `deletion-<YYYYMMDD-HHMMSS>-<hash(payloadPath)>`.
pub fn certificate_id(payload_path: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "deletion-{}-{}",
        timestamp.format("%Y%m%d-%H%M%S"),
        path_hash(payload_path)
    )
}

// 31-multiplier string hash, truncated to 32 bits. Matches the ids already
// present in the audit store.
fn path_hash(s: &str) -> String {
    let mut hash: u32 = 0;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
    }
    format!("{hash:08x}")
}
