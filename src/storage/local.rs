//! # Local Filesystem Storage
//!
//! Stores artifacts under a configured root directory. With
//! `serve_directly` enabled, signed-URL resolution returns a relative
//! `/v1/files/` URL served by this process; otherwise signed URLs are
//! unsupported and callers stream via `download`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

use crate::config::LocalStorageSettings;

use super::{
    sha256_hex, DownloadStream, ObjectMetadata, StorageBackend, StorageError, UploadOutcome,
};

pub struct LocalStorage {
    root: PathBuf,
    serve_directly: bool,
}

impl std::fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("root", &self.root)
            .field("serve_directly", &self.serve_directly)
            .finish()
    }
}

impl LocalStorage {
    pub fn new(settings: &LocalStorageSettings) -> anyhow::Result<Self> {
        let root = PathBuf::from(&settings.root_path);
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            serve_directly: settings.serve_directly,
        })
    }

    /// Resolve a storage key to an on-disk path, refusing escapes. Keys come
    /// from the canonical path scheme but direct-serve requests arrive from
    /// the network, so traversal is checked here as well.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StorageError::Fatal(format!("unsafe storage key: {path}")));
        }
        Ok(self.root.join(relative))
    }

    fn map_io(err: &std::io::Error) -> StorageError {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageError::Unauthorized,
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                StorageError::QuotaExceeded
            }
            _ => StorageError::Fatal(err.to_string()),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_direct_serve(&self) -> bool {
        self.serve_directly
    }

    #[instrument(skip(self, data), fields(path, bytes = data.len()))]
    async fn upload(&self, path: &str, data: Bytes) -> Result<UploadOutcome, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(&e))?;
        }
        let content_hash = sha256_hex(&data);
        tokio::fs::write(&target, &data)
            .await
            .map_err(|e| Self::map_io(&e))?;
        Ok(UploadOutcome {
            bytes_written: data.len() as u64,
            content_hash,
            backend: self.name().to_string(),
        })
    }

    async fn download(&self, path: &str) -> Result<DownloadStream, StorageError> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target)
            .await
            .map_err(|e| Self::map_io(&e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| Self::map_io(&e))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io(&e)),
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| Self::map_io(&e))?;
        let last_modified = meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        // The filesystem keeps no native hash; recompute.
        let data = tokio::fs::read(&target)
            .await
            .map_err(|e| Self::map_io(&e))?;
        Ok(ObjectMetadata {
            bytes: meta.len(),
            content_hash: Some(sha256_hex(&data)),
            last_modified,
        })
    }

    async fn signed_url(&self, path: &str, _validity: Duration) -> Result<String, StorageError> {
        if !self.serve_directly {
            return Err(StorageError::Fatal(
                "local backend without serve_directly cannot issue URLs".to_string(),
            ));
        }
        // Relative; the protocol layer prefixes the public base URL.
        Ok(format!("/v1/files/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn storage(serve_directly: bool) -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(&LocalStorageSettings {
            root_path: dir.path().to_string_lossy().to_string(),
            serve_directly,
        })
        .unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (_dir, storage) = storage(true);
        let outcome = storage
            .upload("modules/a/b/c/1.0.0.tar.gz", Bytes::from_static(b"archive"))
            .await
            .unwrap();
        assert_eq!(outcome.bytes_written, 7);
        assert_eq!(outcome.backend, "local");
        assert_eq!(outcome.content_hash, sha256_hex(b"archive"));

        let mut reader = storage.download("modules/a/b/c/1.0.0.tar.gz").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"archive");
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (_dir, storage) = storage(true);
        assert!(matches!(
            storage.download("missing").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, storage) = storage(true);
        storage
            .upload("x", Bytes::from_static(b"1"))
            .await
            .unwrap();
        storage.delete("x").await.unwrap();
        // Second delete of a missing object is still a success.
        storage.delete("x").await.unwrap();
        assert!(!storage.exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_recomputes_hash() {
        let (_dir, storage) = storage(true);
        storage
            .upload("m", Bytes::from_static(b"content"))
            .await
            .unwrap();
        let meta = storage.metadata("m").await.unwrap();
        assert_eq!(meta.bytes, 7);
        assert_eq!(meta.content_hash.unwrap(), sha256_hex(b"content"));
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_signed_url_modes() {
        let (_dir, direct) = storage(true);
        let url = direct
            .signed_url("modules/a/b/c/1.0.0.tar.gz", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(url, "/v1/files/modules/a/b/c/1.0.0.tar.gz");

        let (_dir2, indirect) = storage(false);
        assert!(indirect
            .signed_url("modules/a/b/c/1.0.0.tar.gz", Duration::from_secs(600))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_traversal_keys_are_refused() {
        let (_dir, storage) = storage(true);
        assert!(storage.download("../outside").await.is_err());
        assert!(storage.download("/etc/passwd").await.is_err());
    }
}
