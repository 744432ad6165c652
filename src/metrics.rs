//! Process-wide pipeline counters.
//!
//! One registry per process, shared by the workers and the status surface.
//! Counters are monotonic; rates and alerting live outside the process.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub files_ingested: AtomicU64,
    pub payloads_validated: AtomicU64,
    pub validation_failures: AtomicU64,
    pub payloads_transferred: AtomicU64,
    pub payloads_deleted: AtomicU64,
    pub certificates_written: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub files_ingested: u64,
    pub payloads_validated: u64,
    pub validation_failures: u64,
    pub payloads_transferred: u64,
    pub payloads_deleted: u64,
    pub certificates_written: u64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_ingested: self.files_ingested.load(Ordering::Relaxed),
            payloads_validated: self.payloads_validated.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            payloads_transferred: self.payloads_transferred.load(Ordering::Relaxed),
            payloads_deleted: self.payloads_deleted.load(Ordering::Relaxed),
            certificates_written: self.certificates_written.load(Ordering::Relaxed),
        }
    }
}
