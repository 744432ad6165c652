//! Durable at-least-once forwarding pipeline for vessel survey data.
//!
//! Survey files arrive on an FTP (or local directory) drop together with an
//! `.md5` companion. The pipeline admits them into a local payload store,
//! re-verifies the checksum, relays verified payloads to a vessel-scoped S3
//! bucket, and after a retention window destroys the local copy behind a
//! destruction certificate in the audit store.
//!
//! Four background workers carry each payload through its stages; the only
//! coordination between them is the work queues and the per-payload metadata,
//! which is authoritative for the payload's stage.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod workers;
