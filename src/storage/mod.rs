//! # Storage
//!
//! Pluggable object storage behind a single trait, multiplexed over four
//! concrete backends:
//!
//! - [`local`] - filesystem under a configured root, optionally served
//!   directly by this process
//! - [`azure`] - Azure Blob Storage over its REST surface (Shared Key + SAS)
//! - [`s3`] - S3 and S3-compatible stores via the AWS SDK
//! - [`gcs`] - Google Cloud Storage
//!
//! The backend is late-bound at process start from configuration; switching
//! backends at runtime requires an external data migration. Upload size
//! limits are enforced by the ingestion pipeline, not here: the storage
//! layer is content-addressed and overwrites are idempotent.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::config::{StorageBackendKind, StorageSettings};

pub mod azure;
pub mod gcs;
pub mod local;
pub mod s3;

/// Default signed-URL validity.
pub const DEFAULT_SIGNED_URL_VALIDITY: Duration = Duration::from_secs(600);

/// Retry budget for transient backend failures.
const TRANSIENT_RETRIES: u32 = 3;
/// Base delay for the exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Failure taxonomy shared by all backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,
    #[error("storage credentials rejected")]
    Unauthorized,
    /// Retried by [`with_retries`] before surfacing.
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage failure: {0}")]
    Fatal(String),
}

/// Outcome of a completed upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of the written bytes.
    pub content_hash: String,
    /// Name of the backend that performed the write.
    pub backend: String,
}

/// Object metadata as reported by the backend.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub bytes: u64,
    /// Read from backend-native metadata where supported, recomputed on miss.
    pub content_hash: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Streaming handle returned by `download`.
pub type DownloadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Contract implemented by every backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stable backend discriminator recorded on version rows.
    fn name(&self) -> &'static str;

    /// True when downloads can be served by this process under `/v1/files/`.
    fn supports_direct_serve(&self) -> bool {
        false
    }

    /// Write an object, computing SHA-256 along the way. Overwrites are
    /// permitted; duplicate-version protection lives in the ingestion layer.
    async fn upload(&self, path: &str, data: Bytes) -> Result<UploadOutcome, StorageError>;

    /// Open an object for reading.
    async fn download(&self, path: &str) -> Result<DownloadStream, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Idempotent; deleting a missing object is a no-op success.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError>;

    /// Time-limited URL allowing a single object read without further
    /// credentials. For the local backend this resolves to an in-process
    /// `/v1/files/` URL when direct serving is enabled and fails otherwise.
    async fn signed_url(&self, path: &str, validity: Duration) -> Result<String, StorageError>;
}

/// Construct the configured backend. Called once at boot.
pub async fn build_backend(
    settings: &StorageSettings,
) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match settings.default_backend {
        StorageBackendKind::Local => Arc::new(local::LocalStorage::new(&settings.local)?),
        StorageBackendKind::S3 => Arc::new(s3::S3Storage::new(&settings.s3).await?),
        StorageBackendKind::Gcs => Arc::new(gcs::GcsStorage::new(&settings.gcs).await?),
        StorageBackendKind::Azure => Arc::new(azure::AzureBlobStorage::new(&settings.azure)?),
    };
    Ok(backend)
}

/// Run `op` with bounded retries on `Transient` failures: up to 3 attempts
/// beyond the first, 200 ms exponential backoff between them.
pub async fn with_retries<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(StorageError::Transient(reason)) if attempt < TRANSIENT_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tracing::debug!(attempt, %reason, delay_ms = delay.as_millis() as u64, "retrying transient storage failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

impl From<StorageError> for crate::error::RegistryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => Self::NotFound("artifact".to_string()),
            // Post-retry transients surface as a bad gateway so clients
            // know to retry, per the boundary contract.
            StorageError::Transient(reason) => Self::UpstreamUnavailable(reason),
            StorageError::Unauthorized => {
                Self::Internal(anyhow::anyhow!("storage credentials rejected"))
            }
            StorageError::QuotaExceeded => {
                Self::Internal(anyhow::anyhow!("storage quota exceeded"))
            }
            StorageError::Fatal(reason) => {
                Self::Internal(anyhow::anyhow!("storage failure: {reason}"))
            }
        }
    }
}

/// Canonical storage key for a module archive.
#[must_use]
pub fn module_path(namespace: &str, name: &str, system: &str, version: &str) -> String {
    format!("modules/{namespace}/{name}/{system}/{version}.tar.gz")
}

/// Canonical storage key for a provider platform archive.
#[must_use]
pub fn provider_path(
    namespace: &str,
    provider_type: &str,
    version: &str,
    os: &str,
    arch: &str,
    filename: &str,
) -> String {
    format!("providers/{namespace}/{provider_type}/{version}/{os}_{arch}/{filename}")
}

/// Lowercase hex SHA-256 of a byte string.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
