//! # S3 Storage
//!
//! S3 and S3-compatible object storage via the official AWS SDK.
//!
//! Authentication follows the configured method: the default credential
//! chain (instance profile, IRSA, ambient environment) or static keys.
//! Custom endpoints (MinIO, Ceph RGW) switch the client to path-style
//! addressing. Signed URLs use SDK presigning.

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::{S3StorageSettings, StorageAuthMethod};

use super::{
    sha256_hex, DownloadStream, ObjectMetadata, StorageBackend, StorageError, UploadOutcome,
};

/// Metadata key carrying the content hash on uploaded objects.
const HASH_METADATA_KEY: &str = "content-sha256";

pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    pub async fn new(settings: &S3StorageSettings) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if settings.auth_method == StorageAuthMethod::Static {
            let access_key = settings
                .access_key_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("s3.access_key_id required for static auth"))?;
            let secret_key = settings.secret_access_key.clone().ok_or_else(|| {
                anyhow::anyhow!("s3.secret_access_key required for static auth")
            })?;
            loader = loader
                .credentials_provider(Credentials::new(access_key, secret_key, None, None, "static"));
        } else {
            info!("s3 backend using default credential chain");
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            // S3-compatible stores rarely support virtual-hosted buckets.
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: settings.bucket.clone(),
        })
    }

    fn map_sdk_error<E>(err: &SdkError<E>, not_found: bool, unauthorized: bool) -> StorageError
    where
        E: std::fmt::Debug,
    {
        if not_found {
            return StorageError::NotFound;
        }
        if unauthorized {
            return StorageError::Unauthorized;
        }
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                StorageError::Transient(format!("{err:?}"))
            }
            SdkError::ResponseError(_) => StorageError::Transient(format!("{err:?}")),
            SdkError::ServiceError(raw) => {
                let status = raw.raw().status().as_u16();
                match status {
                    401 | 403 => StorageError::Unauthorized,
                    404 => StorageError::NotFound,
                    429 | 500 | 502 | 503 | 504 => StorageError::Transient(format!("{err:?}")),
                    _ => StorageError::Fatal(format!("{err:?}")),
                }
            }
            _ => StorageError::Fatal(format!("{err:?}")),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self, data), fields(path, bytes = data.len()))]
    async fn upload(&self, path: &str, data: Bytes) -> Result<UploadOutcome, StorageError> {
        let content_hash = sha256_hex(&data);
        let bytes_written = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .metadata(HASH_METADATA_KEY, &content_hash)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, false, false))?;
        Ok(UploadOutcome {
            bytes_written,
            content_hash,
            backend: self.name().to_string(),
        })
    }

    async fn download(&self, path: &str) -> Result<DownloadStream, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let not_found = matches!(
                    &e,
                    SdkError::ServiceError(raw) if raw.err().is_no_such_key()
                );
                Self::map_sdk_error(&e, not_found, false)
            })?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = matches!(
                    &e,
                    SdkError::ServiceError(raw) if raw.err().is_not_found()
                );
                if not_found {
                    Ok(false)
                } else {
                    Err(Self::map_sdk_error(&e, false, false))
                }
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        // S3 DeleteObject succeeds for missing keys, which matches the
        // idempotent contract.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, false, false))?;
        Ok(())
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let not_found = matches!(
                    &e,
                    SdkError::ServiceError(raw) if raw.err().is_not_found()
                );
                Self::map_sdk_error(&e, not_found, false)
            })?;
        let content_hash = head
            .metadata()
            .and_then(|m| m.get(HASH_METADATA_KEY))
            .cloned();
        let last_modified = head
            .last_modified()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
        Ok(ObjectMetadata {
            bytes: head.content_length().unwrap_or(0).unsigned_abs(),
            content_hash,
            last_modified,
        })
    }

    async fn signed_url(&self, path: &str, validity: Duration) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(validity)
            .map_err(|e| StorageError::Fatal(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning)
            .await
            .map_err(|e| Self::map_sdk_error(&e, false, false))?;
        Ok(presigned.uri().to_string())
    }
}
