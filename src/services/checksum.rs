//! Checksum engine: MD5 and SHA-256 digests over payload bytes.
//!
//! Digests are lowercase hex; comparison is case-insensitive because the
//! expected values arrive from companion files and metadata written by other
//! systems.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Supported digest algorithms.
///
/// The ingest path always stamps `MD5` (that is what the drop companions
/// carry); payloads admitted through other edges may carry `SHA256`, so the
/// algorithm travels with each payload instead of being fixed pipeline-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    /// Parse a metadata label. An empty label means the default, `SHA256`.
    pub fn from_label(label: &str) -> Result<Self, ChecksumError> {
        if label.is_empty() {
            return Ok(Algorithm::Sha256);
        }
        label.parse()
    }
}

impl FromStr for Algorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("md5") {
            Ok(Algorithm::Md5)
        } else if s.eq_ignore_ascii_case("sha256") {
            Ok(Algorithm::Sha256)
        } else {
            Err(ChecksumError::UnsupportedAlgorithm(s.to_string()))
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Md5 => write!(f, "MD5"),
            Algorithm::Sha256 => write!(f, "SHA256"),
        }
    }
}

/// Compute the lowercase hex digest of `data` under `algorithm`.
pub fn digest(algorithm: Algorithm, data: &[u8]) -> String {
    match algorithm {
        Algorithm::Md5 => format!("{:x}", md5::compute(data)),
        Algorithm::Sha256 => hex::encode(Sha256::digest(data)),
    }
}

/// Case-insensitive digest comparison.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_vector() {
        assert_eq!(
            digest(Algorithm::Md5, b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            digest(Algorithm::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn comparison_ignores_case() {
        assert!(digests_match(
            "5D41402ABC4B2A76B9719D911017C592",
            "5d41402abc4b2a76b9719d911017c592"
        ));
        assert!(!digests_match("abc", "abd"));
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!(Algorithm::from_label("md5").unwrap(), Algorithm::Md5);
        assert_eq!(Algorithm::from_label("Sha256").unwrap(), Algorithm::Sha256);
        assert_eq!(Algorithm::from_label("").unwrap(), Algorithm::Sha256);
        assert!(matches!(
            Algorithm::from_label("crc32"),
            Err(ChecksumError::UnsupportedAlgorithm(label)) if label == "crc32"
        ));
    }
}
