//! # Ingestion Pipeline
//!
//! Single entry point per artifact kind. Uploads are validated, hashed,
//! written to storage at the canonical path, then recorded in metadata; a
//! failure before the metadata insert attempts best-effort storage cleanup.
//! The (module, version) uniqueness constraint makes retries of the same
//! pair observe `version_exists`.

use bytes::Bytes;
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::{info, instrument, warn};

use crate::db::modules::{ModuleRepository, ModuleVersion, NewModuleVersion};
use crate::db::orgs::OrgRepository;
use crate::db::providers::{
    NewProviderPlatform, NewProviderVersion, ProviderPlatform, ProviderRepository,
};
use crate::error::{RegistryError, Result};
use crate::observability::metrics;
use crate::storage::{
    module_path, provider_path, sha256_hex, with_retries, StorageBackend,
};

pub mod archive;

use archive::{ArchiveError, MODULE_MAX_UNCOMPRESSED, PROVIDER_MAX_BYTES};

static ADDRESS_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid regex"));
static OS_ARCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+$").expect("valid regex"));

/// A module archive submitted for ingestion.
#[derive(Debug, Clone)]
pub struct ModuleUpload {
    pub namespace: String,
    pub name: String,
    pub system: String,
    pub version: String,
    pub description: Option<String>,
    /// Principal recorded as the publisher.
    pub published_by: Option<String>,
    /// Set by the SCM publisher; uploads via the API leave it empty.
    pub commit_sha: Option<String>,
    /// Overrides the default organization (multi-tenant deployments).
    pub organization_id: Option<String>,
    pub data: Bytes,
}

/// A provider platform archive submitted for ingestion.
#[derive(Debug, Clone)]
pub struct ProviderUpload {
    pub namespace: String,
    pub provider_type: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub protocols: Vec<String>,
    pub gpg_public_key: Option<String>,
    pub gpg_key_id: Option<String>,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
    pub published_by: Option<String>,
    pub organization_id: Option<String>,
    /// Present when the upload came from the mirror scheduler.
    pub mirror_configuration_id: Option<String>,
    pub data: Bytes,
}

/// Validates, stores and records artifacts.
pub struct Ingestor {
    storage: Arc<dyn StorageBackend>,
    pool: SqlitePool,
    default_organization: String,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("default_organization", &self.default_organization)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        pool: SqlitePool,
        default_organization: String,
    ) -> Self {
        Self {
            storage,
            pool,
            default_organization,
        }
    }

    /// SemVer 2.0.0, no `v` prefix.
    pub fn validate_version(version: &str) -> Result<semver::Version> {
        semver::Version::parse(version)
            .map_err(|_| RegistryError::BadRequest(format!("invalid_version: {version}")))
    }

    fn validate_address_component(value: &str, field: &str) -> Result<()> {
        if ADDRESS_COMPONENT.is_match(value) {
            Ok(())
        } else {
            Err(RegistryError::BadRequest(format!("invalid {field}: {value}")))
        }
    }

    async fn resolve_organization(&self, override_id: Option<&str>) -> Result<String> {
        if let Some(id) = override_id {
            return Ok(id.to_string());
        }
        let org = OrgRepository::new(self.pool.clone())
            .get_organization_by_slug(&self.default_organization)
            .await?
            .ok_or_else(|| {
                RegistryError::Internal(anyhow::anyhow!(
                    "default organization {} is missing",
                    self.default_organization
                ))
            })?;
        Ok(org.id)
    }

    /// Ingest a module archive. See module docs for the failure contract.
    #[instrument(skip(self, upload), fields(
        namespace = %upload.namespace,
        name = %upload.name,
        system = %upload.system,
        version = %upload.version,
        bytes = upload.data.len(),
    ))]
    pub async fn ingest_module(&self, upload: ModuleUpload) -> Result<ModuleVersion> {
        Self::validate_address_component(&upload.namespace, "namespace")?;
        Self::validate_address_component(&upload.name, "name")?;
        Self::validate_address_component(&upload.system, "system")?;
        Self::validate_version(&upload.version)?;

        // Structural validation runs on the blocking pool; the decoder works
        // in fixed-size buffers, never the extracted tree.
        let data = upload.data.clone();
        let info = tokio::task::spawn_blocking(move || {
            archive::inspect_tarball(&data, MODULE_MAX_UNCOMPRESSED)
        })
        .await
        .map_err(|e| RegistryError::Internal(e.into()))?
        .map_err(map_archive_error)?;

        let checksum = sha256_hex(&upload.data);
        let organization_id = self.resolve_organization(upload.organization_id.as_deref()).await?;

        let modules = ModuleRepository::new(self.pool.clone());
        let module = modules
            .ensure(
                &organization_id,
                &upload.namespace,
                &upload.name,
                &upload.system,
                upload.description.as_deref(),
            )
            .await?;

        if modules.find_version(&module.id, &upload.version).await?.is_some() {
            return Err(RegistryError::VersionExists);
        }

        let path = module_path(
            &upload.namespace,
            &upload.name,
            &upload.system,
            &upload.version,
        );
        let outcome = with_retries(|| self.storage.upload(&path, upload.data.clone())).await?;

        let inserted = modules
            .insert_version(NewModuleVersion {
                module_id: module.id.clone(),
                version: upload.version.clone(),
                storage_path: path.clone(),
                storage_backend: outcome.backend,
                size_bytes: outcome.bytes_written as i64,
                checksum: checksum.clone(),
                readme: info.readme,
                published_by: upload.published_by,
                commit_sha: upload.commit_sha,
            })
            .await;

        match inserted {
            Ok(version) => {
                metrics::record_module_ingest("ok");
                info!(checksum = %checksum, "module version ingested");
                Ok(version)
            }
            Err(err) if crate::db::is_unique_violation(&err) => {
                // A concurrent publish won; the object at the canonical path
                // is the winner's, so no cleanup.
                metrics::record_module_ingest("conflict");
                Err(RegistryError::VersionExists)
            }
            Err(err) => {
                metrics::record_module_ingest("error");
                self.cleanup_storage(&path).await;
                Err(err.into())
            }
        }
    }

    /// Ingest one provider platform archive, creating the provider and
    /// version rows lazily.
    #[instrument(skip(self, upload), fields(
        namespace = %upload.namespace,
        provider_type = %upload.provider_type,
        version = %upload.version,
        os = %upload.os,
        arch = %upload.arch,
        bytes = upload.data.len(),
    ))]
    pub async fn ingest_provider(&self, upload: ProviderUpload) -> Result<ProviderPlatform> {
        Self::validate_address_component(&upload.namespace, "namespace")?;
        Self::validate_address_component(&upload.provider_type, "type")?;
        Self::validate_version(&upload.version)?;
        if !OS_ARCH.is_match(&upload.os) || !OS_ARCH.is_match(&upload.arch) {
            return Err(RegistryError::BadRequest("invalid os/arch".to_string()));
        }
        if upload.data.len() as u64 > PROVIDER_MAX_BYTES {
            return Err(RegistryError::UnsafePayload(
                "archive exceeds size limit".to_string(),
            ));
        }
        if !archive::looks_like_zip(&upload.data) {
            return Err(RegistryError::BadRequest("malformed_archive".to_string()));
        }
        if upload.filename.contains('/') || upload.filename.contains("..") {
            return Err(RegistryError::UnsafePayload(format!(
                "unsafe_path: {}",
                upload.filename
            )));
        }
        if !archive::is_valid_provider_filename(&upload.filename) {
            return Err(RegistryError::BadRequest(format!(
                "unexpected provider filename: {}",
                upload.filename
            )));
        }
        if let Some(key) = &upload.gpg_public_key {
            if !key.contains("BEGIN PGP PUBLIC KEY BLOCK") {
                return Err(RegistryError::BadRequest(
                    "gpg key must be ASCII-armored".to_string(),
                ));
            }
        }

        let checksum = sha256_hex(&upload.data);
        let organization_id = self.resolve_organization(upload.organization_id.as_deref()).await?;

        let providers = ProviderRepository::new(self.pool.clone());
        let provider = providers
            .ensure(
                &organization_id,
                &upload.namespace,
                &upload.provider_type,
                upload.mirror_configuration_id.is_some(),
            )
            .await?;
        let version = providers
            .ensure_version(
                &provider.id,
                NewProviderVersion {
                    version: upload.version.clone(),
                    protocols: upload.protocols.clone(),
                    gpg_public_key: upload.gpg_public_key.clone(),
                    gpg_key_id: upload.gpg_key_id.clone(),
                    shasums_url: upload.shasums_url.clone(),
                    shasums_signature_url: upload.shasums_signature_url.clone(),
                    published_by: upload.published_by.clone(),
                    mirror_configuration_id: upload.mirror_configuration_id.clone(),
                },
            )
            .await?;

        if providers
            .find_platform(&version.id, &upload.os, &upload.arch)
            .await?
            .is_some()
        {
            return Err(RegistryError::VersionExists);
        }

        let path = provider_path(
            &upload.namespace,
            &upload.provider_type,
            &upload.version,
            &upload.os,
            &upload.arch,
            &upload.filename,
        );
        let outcome = with_retries(|| self.storage.upload(&path, upload.data.clone())).await?;

        let inserted = providers
            .insert_platform(
                &version.id,
                NewProviderPlatform {
                    os: upload.os.clone(),
                    arch: upload.arch.clone(),
                    filename: upload.filename.clone(),
                    storage_path: path.clone(),
                    storage_backend: outcome.backend,
                    size_bytes: outcome.bytes_written as i64,
                    shasum: checksum,
                },
            )
            .await;

        match inserted {
            Ok(platform) => {
                metrics::record_provider_ingest("ok");
                info!("provider platform ingested");
                Ok(platform)
            }
            Err(err) if crate::db::is_unique_violation(&err) => {
                metrics::record_provider_ingest("conflict");
                Err(RegistryError::VersionExists)
            }
            Err(err) => {
                metrics::record_provider_ingest("error");
                self.cleanup_storage(&path).await;
                Err(err.into())
            }
        }
    }

    /// Best-effort removal of a just-written artifact after a failed insert.
    async fn cleanup_storage(&self, path: &str) {
        if let Err(error) = self.storage.delete(path).await {
            warn!(%path, %error, "storage cleanup after failed ingest did not complete");
        }
    }
}

fn map_archive_error(err: ArchiveError) -> RegistryError {
    match err {
        ArchiveError::Malformed => RegistryError::BadRequest("malformed_archive".to_string()),
        ArchiveError::UnsafePath(path) => {
            RegistryError::UnsafePayload(format!("unsafe_path: {path}"))
        }
        ArchiveError::TooLarge => {
            RegistryError::UnsafePayload("archive exceeds size limit".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::archive::test_archives::tarball;
    use super::*;
    use crate::config::LocalStorageSettings;
    use crate::storage::local::LocalStorage;

    async fn ingestor() -> (tempfile::TempDir, Ingestor) {
        let pool = crate::db::test_pool().await;
        OrgRepository::new(pool.clone())
            .create_organization("default", "Default")
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            LocalStorage::new(&LocalStorageSettings {
                root_path: dir.path().to_string_lossy().to_string(),
                serve_directly: true,
            })
            .unwrap(),
        );
        (dir, Ingestor::new(storage, pool, "default".to_string()))
    }

    fn module_upload(version: &str, data: Vec<u8>) -> ModuleUpload {
        ModuleUpload {
            namespace: "acme".to_string(),
            name: "vpc".to_string(),
            system: "aws".to_string(),
            version: version.to_string(),
            description: None,
            published_by: Some("tester".to_string()),
            commit_sha: None,
            organization_id: None,
            data: Bytes::from(data),
        }
    }

    #[tokio::test]
    async fn test_module_ingest_happy_path() {
        let (_dir, ingestor) = ingestor().await;
        let data = tarball(&[("main.tf", b"".as_slice()), ("README.md", b"# hi".as_slice())]);
        let version = ingestor
            .ingest_module(module_upload("1.0.0", data.clone()))
            .await
            .unwrap();
        assert_eq!(version.version, "1.0.0");
        assert_eq!(version.checksum, sha256_hex(&data));
        assert_eq!(version.readme.as_deref(), Some("# hi"));
        assert_eq!(version.storage_path, "modules/acme/vpc/aws/1.0.0.tar.gz");
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let (_dir, ingestor) = ingestor().await;
        let data = tarball(&[("main.tf", b"".as_slice())]);
        ingestor
            .ingest_module(module_upload("1.0.0", data.clone()))
            .await
            .unwrap();
        let err = ingestor
            .ingest_module(module_upload("1.0.0", data))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::VersionExists));
    }

    #[tokio::test]
    async fn test_version_discipline() {
        let (_dir, ingestor) = ingestor().await;
        let data = tarball(&[("main.tf", b"".as_slice())]);
        // Pre-release and build metadata are accepted.
        ingestor
            .ingest_module(module_upload("1.2.3-rc1+build.42", data.clone()))
            .await
            .unwrap();
        // Partial versions and v-prefixes are not.
        for bad in ["1.2", "v1.2.3", "latest"] {
            let err = ingestor
                .ingest_module(module_upload(bad, data.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, RegistryError::BadRequest(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unsafe_archives() {
        let (_dir, ingestor) = ingestor().await;
        let err = ingestor
            .ingest_module(module_upload("1.0.0", b"not a tarball".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));

        let traversal = tarball(&[("../evil.tf", b"".as_slice())]);
        let err = ingestor
            .ingest_module(module_upload("1.0.0", traversal))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnsafePayload(_)));
    }

    fn provider_upload(data: Vec<u8>) -> ProviderUpload {
        ProviderUpload {
            namespace: "hashicorp".to_string(),
            provider_type: "random".to_string(),
            version: "3.6.0".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            filename: "terraform-provider-random_v3.6.0_linux_amd64.zip".to_string(),
            protocols: vec!["5.0".to_string()],
            gpg_public_key: None,
            gpg_key_id: None,
            shasums_url: None,
            shasums_signature_url: None,
            published_by: Some("tester".to_string()),
            organization_id: None,
            mirror_configuration_id: None,
            data: Bytes::from(data),
        }
    }

    #[tokio::test]
    async fn test_provider_ingest_happy_path() {
        let (_dir, ingestor) = ingestor().await;
        let platform = ingestor
            .ingest_provider(provider_upload(b"PK\x03\x04binary".to_vec()))
            .await
            .unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.shasum, sha256_hex(b"PK\x03\x04binary"));
        // Same (version, os, arch) again conflicts.
        let err = ingestor
            .ingest_provider(provider_upload(b"PK\x03\x04binary".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::VersionExists));
    }

    #[tokio::test]
    async fn test_provider_rejects_non_zip_and_bad_key() {
        let (_dir, ingestor) = ingestor().await;
        let err = ingestor
            .ingest_provider(provider_upload(b"ELF binary".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));

        let mut upload = provider_upload(b"PK\x03\x04binary".to_vec());
        upload.gpg_public_key = Some("not armored".to_string());
        let err = ingestor.ingest_provider(upload).await.unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));
    }
}
