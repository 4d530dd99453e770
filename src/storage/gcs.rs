//! # Google Cloud Storage
//!
//! GCS backend over the google-cloud-storage SDK. Authentication uses the
//! ambient service account (workload identity or `GOOGLE_APPLICATION_CREDENTIALS`);
//! signed URLs are V4-signed by the SDK using the same credentials.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::sign::{SignedURLMethod, SignedURLOptions};
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::{GcsStorageSettings, StorageAuthMethod};

use super::{
    sha256_hex, DownloadStream, ObjectMetadata, StorageBackend, StorageError, UploadOutcome,
};

pub struct GcsStorage {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for GcsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsStorage")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl GcsStorage {
    pub async fn new(settings: &GcsStorageSettings) -> anyhow::Result<Self> {
        let config = match settings.auth_method {
            // Anonymous is only useful against emulators.
            StorageAuthMethod::Static => ClientConfig::default().anonymous(),
            _ => {
                info!("gcs backend using application default credentials");
                ClientConfig::default().with_auth().await?
            }
        };
        Ok(Self {
            client: Client::new(config),
            bucket: settings.bucket.clone(),
        })
    }

    fn map_error(err: &GcsError) -> StorageError {
        match err {
            GcsError::Response(resp) => match resp.code {
                404 => StorageError::NotFound,
                401 | 403 => StorageError::Unauthorized,
                429 => StorageError::QuotaExceeded,
                500..=599 => StorageError::Transient(format!("gcs {code}", code = resp.code)),
                _ => StorageError::Fatal(format!("gcs error {code}", code = resp.code)),
            },
            GcsError::HttpClient(e) => StorageError::Transient(e.to_string()),
            _ => StorageError::Fatal(err.to_string()),
        }
    }
}

#[async_trait]
impl StorageBackend for GcsStorage {
    fn name(&self) -> &'static str {
        "gcs"
    }

    #[instrument(skip(self, data), fields(path, bytes = data.len()))]
    async fn upload(&self, path: &str, data: Bytes) -> Result<UploadOutcome, StorageError> {
        let content_hash = sha256_hex(&data);
        let bytes_written = data.len() as u64;
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data,
                &UploadType::Simple(Media::new(path.to_string())),
            )
            .await
            .map_err(|e| Self::map_error(&e))?;
        Ok(UploadOutcome {
            bytes_written,
            content_hash,
            backend: self.name().to_string(),
        })
    }

    async fn download(&self, path: &str) -> Result<DownloadStream, StorageError> {
        let data = self
            .client
            .download_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: path.to_string(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| Self::map_error(&e))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Self::map_error(&e) {
                StorageError::NotFound => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        match self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match Self::map_error(&e) {
                StorageError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        let object = self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Self::map_error(&e))?;
        let last_modified = object
            .updated
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.unix_timestamp(), 0));
        Ok(ObjectMetadata {
            bytes: object.size.unsigned_abs(),
            content_hash: None,
            last_modified,
        })
    }

    async fn signed_url(&self, path: &str, validity: Duration) -> Result<String, StorageError> {
        self.client
            .signed_url(
                &self.bucket,
                path,
                None,
                None,
                SignedURLOptions {
                    method: SignedURLMethod::GET,
                    expires: validity,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StorageError::Fatal(e.to_string()))
    }
}
