//! # Azure Blob Storage
//!
//! Native REST client for Azure Blob Storage over reqwest: Shared Key
//! authorization for data-plane calls and a service SAS for signed URLs.
//! Keeping to the REST surface avoids dragging in an SDK for the handful of
//! operations the registry needs.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::instrument;

use crate::config::AzureStorageSettings;

use super::{
    sha256_hex, DownloadStream, ObjectMetadata, StorageBackend, StorageError, UploadOutcome,
};

type HmacSha256 = Hmac<Sha256>;

/// Storage service REST API version used for both auth schemes.
const API_VERSION: &str = "2021-08-06";
/// Metadata header carrying the content hash on uploaded blobs.
const HASH_HEADER: &str = "x-ms-meta-content_sha256";

pub struct AzureBlobStorage {
    http: reqwest::Client,
    account: String,
    container: String,
    key: Vec<u8>,
    endpoint: String,
}

impl std::fmt::Debug for AzureBlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobStorage")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl AzureBlobStorage {
    pub fn new(settings: &AzureStorageSettings) -> anyhow::Result<Self> {
        let key = settings
            .account_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("azure.account_key is required"))?;
        let key = BASE64
            .decode(key)
            .map_err(|_| anyhow::anyhow!("azure.account_key must be base64"))?;
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", settings.account));
        Ok(Self {
            http: reqwest::Client::new(),
            account: settings.account.clone(),
            container: settings.container.clone(),
            key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn blob_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, path)
    }

    fn rfc1123_now() -> String {
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Shared Key authorization header for a data-plane request.
    /// `extra_headers` must be the x-ms-* headers of the request, already
    /// sorted by name.
    fn authorization(
        &self,
        verb: &str,
        path: &str,
        content_length: Option<u64>,
        extra_headers: &[(String, String)],
    ) -> String {
        let canonical_headers: String = extra_headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let canonical_resource = format!("/{}/{}/{}", self.account, self.container, path);
        let length = match content_length {
            Some(0) | None => String::new(),
            Some(n) => n.to_string(),
        };
        let string_to_sign = format!(
            "{verb}\n\n\n{length}\n\n\n\n\n\n\n\n\n{canonical_headers}{canonical_resource}"
        );
        format!("SharedKey {}:{}", self.account, self.sign(&string_to_sign))
    }

    /// Issue a request with Shared Key auth and the standard x-ms headers.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Bytes>,
        hash: Option<&str>,
    ) -> Result<reqwest::Response, StorageError> {
        let date = Self::rfc1123_now();
        let mut headers: Vec<(String, String)> = Vec::new();
        if method == reqwest::Method::PUT {
            headers.push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
        }
        headers.push(("x-ms-date".to_string(), date));
        if let Some(hash) = hash {
            headers.push((HASH_HEADER.to_string(), hash.to_string()));
        }
        headers.push(("x-ms-version".to_string(), API_VERSION.to_string()));
        headers.sort();

        let length = body.as_ref().map(|b| b.len() as u64);
        let auth = self.authorization(method.as_str(), path, length, &headers);

        let mut request = self
            .http
            .request(method, self.blob_url(path))
            .header("Authorization", auth);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))
    }

    fn map_status(status: reqwest::StatusCode) -> StorageError {
        match status.as_u16() {
            404 => StorageError::NotFound,
            401 | 403 => StorageError::Unauthorized,
            429 => StorageError::QuotaExceeded,
            500..=599 => StorageError::Transient(format!("azure {status}")),
            _ => StorageError::Fatal(format!("azure {status}")),
        }
    }

    /// Percent-encode a SAS component for query-string placement.
    fn encode_query(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '+' => out.push_str("%2B"),
                '/' => out.push_str("%2F"),
                '=' => out.push_str("%3D"),
                ':' => out.push_str("%3A"),
                other => out.push(other),
            }
        }
        out
    }
}

#[async_trait]
impl StorageBackend for AzureBlobStorage {
    fn name(&self) -> &'static str {
        "azure"
    }

    #[instrument(skip(self, data), fields(path, bytes = data.len()))]
    async fn upload(&self, path: &str, data: Bytes) -> Result<UploadOutcome, StorageError> {
        let content_hash = sha256_hex(&data);
        let bytes_written = data.len() as u64;
        let response = self
            .request(reqwest::Method::PUT, path, Some(data), Some(&content_hash))
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_status(response.status()));
        }
        Ok(UploadOutcome {
            bytes_written,
            content_hash,
            backend: self.name().to_string(),
        })
    }

    async fn download(&self, path: &str) -> Result<DownloadStream, StorageError> {
        let response = self
            .request(reqwest::Method::GET, path, None, None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_status(response.status()));
        }
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let response = self
            .request(reqwest::Method::HEAD, path, None, None)
            .await?;
        match response.status().as_u16() {
            404 => Ok(false),
            s if (200..300).contains(&s) => Ok(true),
            _ => Err(Self::map_status(response.status())),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let response = self
            .request(reqwest::Method::DELETE, path, None, None)
            .await?;
        match response.status().as_u16() {
            404 => Ok(()),
            s if (200..300).contains(&s) => Ok(()),
            _ => Err(Self::map_status(response.status())),
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        let response = self
            .request(reqwest::Method::HEAD, path, None, None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_status(response.status()));
        }
        let headers = response.headers();
        let bytes = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let content_hash = headers
            .get(HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = headers
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(ObjectMetadata {
            bytes,
            content_hash,
            last_modified,
        })
    }

    async fn signed_url(&self, path: &str, validity: Duration) -> Result<String, StorageError> {
        let start = Utc::now() - chrono::Duration::minutes(5); // clock-skew allowance
        let expiry = Utc::now()
            + chrono::Duration::from_std(validity)
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
        let st = start.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let se = expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let canonical_resource = format!("/blob/{}/{}/{}", self.account, self.container, path);

        // Service SAS, blob resource, read-only. Field order is fixed by the
        // service; empty lines are intentional.
        let string_to_sign = format!(
            "r\n{st}\n{se}\n{canonical_resource}\n\n\nhttps\n{API_VERSION}\nb\n\n\n\n\n\n"
        );
        let signature = self.sign(&string_to_sign);

        Ok(format!(
            "{url}?sv={sv}&spr=https&st={st}&se={se}&sr=b&sp=r&sig={sig}",
            url = self.blob_url(path),
            sv = API_VERSION,
            st = Self::encode_query(&st),
            se = Self::encode_query(&se),
            sig = Self::encode_query(&signature),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> AzureBlobStorage {
        AzureBlobStorage::new(&AzureStorageSettings {
            account: "acct".to_string(),
            container: "artifacts".to_string(),
            account_key: Some(BASE64.encode(b"0123456789abcdef")),
            endpoint: None,
        })
        .unwrap()
    }

    #[test]
    fn test_new_requires_base64_key() {
        let result = AzureBlobStorage::new(&AzureStorageSettings {
            account: "acct".to_string(),
            container: "artifacts".to_string(),
            account_key: Some("%%%not-base64%%%".to_string()),
            endpoint: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_blob_url_uses_default_endpoint() {
        let storage = backend();
        assert_eq!(
            storage.blob_url("modules/a/b/c/1.0.0.tar.gz"),
            "https://acct.blob.core.windows.net/artifacts/modules/a/b/c/1.0.0.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_signed_url_shape() {
        let storage = backend();
        let url = storage
            .signed_url("modules/a/b/c/1.0.0.tar.gz", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("https://acct.blob.core.windows.net/artifacts/"));
        assert!(url.contains("sr=b"));
        assert!(url.contains("sp=r"));
        assert!(url.contains("sig="));
        // The signature must be query-safe.
        assert!(!url.contains('+'));
    }

    #[test]
    fn test_authorization_header_shape() {
        let storage = backend();
        let auth = storage.authorization(
            "PUT",
            "x",
            Some(10),
            &[("x-ms-date".to_string(), "d".to_string())],
        );
        assert!(auth.starts_with("SharedKey acct:"));
    }
}
