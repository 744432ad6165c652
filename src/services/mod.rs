//! Gateways to the storage systems the pipeline coordinates: the local
//! payload store, the work queues, the remote vessel-data bucket, the
//! checksum engine, and the audit store.
//!
//! There is no distributed transaction across them; the workers sequence
//! their writes so that a crash between any two leaves the pipeline
//! retryable, never lossy.

pub mod audit;
pub mod blob_store;
pub mod checksum;
pub mod remote_store;
pub mod work_queue;
