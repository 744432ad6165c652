//! Payload metadata: the map of string attributes stored alongside each
//! payload blob.
//!
//! The metadata map is the payload's state machine. Ingest writes the
//! admission fields, validation and transfer append their stage outputs, and
//! cleanup reads the transfer fields before it is allowed to delete anything.
//! The backing stores normalize key casing inconsistently, so every read goes
//! through a case-insensitive lookup while writes preserve the casing they
//! were given.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Hex digest expected for the payload bytes. Written at admission.
pub const KEY_CHECKSUM: &str = "checksum";
/// Digest algorithm label (`MD5` or `SHA256`). Absent means `SHA256`.
pub const KEY_CHECKSUM_ALGORITHM: &str = "checksumAlgorithm";
/// Originating vessel. Falls back to the first path segment when absent.
pub const KEY_VESSEL_ID: &str = "vesselId";
/// RFC-3339 UTC admission time.
pub const KEY_TIMESTAMP: &str = "timestamp";
/// `valid` or `invalid`. Written by the validation worker.
pub const KEY_VALIDATION_STATUS: &str = "validationStatus";
pub const KEY_VALIDATION_TIMESTAMP: &str = "validationTimestamp";
/// `transferred` once the payload landed remotely. Written by the transfer worker.
pub const KEY_TRANSFER_STATUS: &str = "transferStatus";
pub const KEY_TRANSFER_TIMESTAMP: &str = "transferTimestamp";
/// `<bucket>/<key>` of the landed remote object.
pub const KEY_REMOTE_DESTINATION: &str = "remoteDestination";
/// Content hash reported by the remote store, quotes stripped.
pub const KEY_REMOTE_ETAG: &str = "remoteEtag";

pub const VALIDATION_VALID: &str = "valid";
pub const VALIDATION_INVALID: &str = "invalid";
pub const TRANSFER_TRANSFERRED: &str = "transferred";

/// Per-payload attribute map.
///
/// Lookup is case-insensitive; insertion replaces any case-variant of the key
/// but stores the caller's casing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Insert `key`, replacing any existing case-variant of it.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.0.retain(|k, _| !k.eq_ignore_ascii_case(&key));
        self.0.insert(key, value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Keys only, for diagnostics when an expected key is missing.
    pub fn keys(&self) -> String {
        self.0.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// First path segment of a canonical payload path, used as the vessel id
/// fallback when the metadata carries none.
pub fn vessel_from_path(path: &str) -> Option<&str> {
    path.split('/').next().filter(|segment| !segment.is_empty())
}

/// Filename component of a canonical payload path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut meta = Metadata::new();
        meta.insert("Checksum", "abc");
        assert_eq!(meta.get("checksum"), Some("abc"));
        assert_eq!(meta.get("CHECKSUM"), Some("abc"));
        assert_eq!(meta.get("checksumAlgorithm"), None);
    }

    #[test]
    fn insert_replaces_case_variants() {
        let mut meta = Metadata::new();
        meta.insert("checksum", "old");
        meta.insert("CheckSum", "new");
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.get("checksum"), Some("new"));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(vessel_from_path("VESSEL001/data.bin"), Some("VESSEL001"));
        assert_eq!(vessel_from_path(""), None);
        assert_eq!(file_name("VESSEL001/data.bin"), "data.bin");
        assert_eq!(file_name("data.bin"), "data.bin");
    }
}
