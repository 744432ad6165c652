//! Remote store gateway: authenticated upload and existence probe against the
//! vessel-data bucket.
//!
//! The trait seam keeps the workers independent of the concrete client so
//! tests can substitute an in-memory double. The production implementation
//! talks S3 and honors an endpoint override for MinIO-style deployments.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RemoteStoreConfig;
use crate::services::checksum::{self, Algorithm};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store authorization failed: {0}")]
    Auth(String),
    #[error("remote object `{0}` not found")]
    NotFound(String),
    #[error("transient remote store failure: {0}")]
    Transient(String),
    #[error("remote store failure: {0}")]
    Other(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote object store seam.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Name of the destination bucket, for building `remoteDestination`.
    fn bucket(&self) -> &str;

    /// Write `data` at `key`, overwriting on collision. Returns the remote
    /// content hash when the service reported one (surrounding quotes
    /// stripped).
    async fn upload(&self, key: &str, data: &[u8]) -> RemoteResult<Option<String>>;

    /// Probe for the presence of `key`.
    async fn exists(&self, key: &str) -> RemoteResult<bool>;
}

/// Remote key for a payload: `<vesselId>/data/<filename>`.
pub fn object_key(vessel_id: &str, file_name: &str) -> String {
    format!("{vessel_id}/data/{file_name}")
}

/// S3-backed remote store.
pub struct S3RemoteStore {
    client: Client,
    bucket: String,
}

impl S3RemoteStore {
    /// Build a client from the pipeline configuration.
    ///
    /// Static credentials and region come from the config when present,
    /// otherwise the ambient provider chain applies. An endpoint override
    /// switches to path-style addressing, which is what local S3 doubles
    /// expect.
    pub async fn connect(cfg: &RemoteStoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &cfg.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) = (&cfg.access_key, &cfg.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "pipeline-config",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: cfg.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl RemoteStore for S3RemoteStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, key: &str, data: &[u8]) -> RemoteResult<Option<String>> {
        let local_md5 = checksum::digest(Algorithm::Md5, data);
        debug!(
            "uploading {} bytes to s3://{}/{} (local md5 {})",
            data.len(),
            self.bucket,
            key,
            local_md5
        );

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| classify("put", key, err))?;

        let etag = output
            .e_tag()
            .map(|raw| raw.trim_matches('"').to_string())
            .filter(|etag| !etag.is_empty());
        match &etag {
            Some(etag) if checksum::digests_match(etag, &local_md5) => {
                debug!("remote content hash matches local md5 for {key}");
            }
            Some(etag) => {
                // Multipart and encrypted uploads legitimately change the
                // ETag format; landing is confirmed by the existence probe.
                warn!("content hash mismatch for {key}: local={local_md5} remote={etag}");
            }
            None => warn!("no content hash reported by remote store for {key}"),
        }

        info!("uploaded s3://{}/{}", self.bucket, key);
        Ok(etag)
    }

    async fn exists(&self, key: &str) -> RemoteResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(false),
            Err(err) => match classify("head", key, err) {
                RemoteError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

fn classify<E>(operation: &str, key: &str, err: SdkError<E>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{operation} {key}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RemoteError::Transient(detail)
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default();
            if status == 401
                || status == 403
                || matches!(
                    code,
                    "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
                )
            {
                RemoteError::Auth(detail)
            } else if status == 404 || matches!(code, "NoSuchKey" | "NoSuchBucket" | "NotFound") {
                RemoteError::NotFound(key.to_string())
            } else if status == 429 || (500..600).contains(&status) {
                RemoteError::Transient(detail)
            } else {
                RemoteError::Other(detail)
            }
        }
        _ => RemoteError::Other(detail),
    }
}
