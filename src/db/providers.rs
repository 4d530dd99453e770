//! Providers, provider versions and per-(os, arch) platform binaries.
//!
//! A provider row is flagged `mirrored` when it entered the registry via an
//! upstream mirror rather than an authenticated upload; versions carry the
//! originating mirror configuration id in that case.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now, Page};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Provider {
    pub id: String,
    pub organization_id: String,
    pub namespace: String,
    pub provider_type: String,
    pub description: Option<String>,
    pub source_url: Option<String>,
    pub mirrored: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderVersion {
    pub id: String,
    pub provider_id: String,
    pub version: String,
    /// JSON array of declared protocol versions, e.g. `["5.0"]`.
    pub protocols: String,
    pub gpg_public_key: Option<String>,
    pub gpg_key_id: Option<String>,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
    pub deprecated: bool,
    pub published_by: Option<String>,
    pub mirror_configuration_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProviderVersion {
    #[must_use]
    pub fn protocol_list(&self) -> Vec<String> {
        serde_json::from_str(&self.protocols).unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderPlatform {
    pub id: String,
    pub provider_version_id: String,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub shasum: String,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Fields recorded for a new provider version.
#[derive(Debug, Clone, Default)]
pub struct NewProviderVersion {
    pub version: String,
    pub protocols: Vec<String>,
    pub gpg_public_key: Option<String>,
    pub gpg_key_id: Option<String>,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
    pub published_by: Option<String>,
    pub mirror_configuration_id: Option<String>,
}

/// Fields recorded for a new platform binary.
#[derive(Debug, Clone)]
pub struct NewProviderPlatform {
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub shasum: String,
}

#[derive(Debug, Clone)]
pub struct ProviderRepository {
    pool: SqlitePool,
}

impl ProviderRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        namespace: &str,
        provider_type: &str,
    ) -> Result<Option<Provider>, sqlx::Error> {
        sqlx::query_as::<_, Provider>(
            "SELECT * FROM providers WHERE namespace = ? AND provider_type = ?",
        )
        .bind(namespace)
        .bind(provider_type)
        .fetch_optional(&self.pool)
        .await
    }

    /// Get-or-create keyed on (namespace, type).
    #[instrument(skip(self))]
    pub async fn ensure(
        &self,
        organization_id: &str,
        namespace: &str,
        provider_type: &str,
        mirrored: bool,
    ) -> Result<Provider, sqlx::Error> {
        if let Some(existing) = self.find(namespace, provider_type).await? {
            return Ok(existing);
        }
        let ts = now();
        let provider = Provider {
            id: new_id(),
            organization_id: organization_id.to_string(),
            namespace: namespace.to_string(),
            provider_type: provider_type.to_string(),
            description: None,
            source_url: None,
            mirrored,
            created_at: ts,
            updated_at: ts,
        };
        let inserted = sqlx::query(
            "INSERT INTO providers (id, organization_id, namespace, provider_type, description, source_url, mirrored, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (namespace, provider_type) DO NOTHING",
        )
        .bind(&provider.id)
        .bind(&provider.organization_id)
        .bind(&provider.namespace)
        .bind(&provider.provider_type)
        .bind(&provider.description)
        .bind(&provider.source_url)
        .bind(provider.mirrored)
        .bind(provider.created_at)
        .bind(provider.updated_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            Ok(provider)
        } else {
            self.find(namespace, provider_type)
                .await?
                .ok_or(sqlx::Error::RowNotFound)
        }
    }

    pub async fn list(&self, page: Page) -> Result<(Vec<Provider>, i64), sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM providers")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, Provider>(
            "SELECT * FROM providers ORDER BY namespace, provider_type LIMIT ? OFFSET ?",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM providers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get-or-create a version row under a provider.
    #[instrument(skip(self, new), fields(provider_id, version = %new.version))]
    pub async fn ensure_version(
        &self,
        provider_id: &str,
        new: NewProviderVersion,
    ) -> Result<ProviderVersion, sqlx::Error> {
        if let Some(existing) = self.find_version(provider_id, &new.version).await? {
            return Ok(existing);
        }
        let version = ProviderVersion {
            id: new_id(),
            provider_id: provider_id.to_string(),
            version: new.version,
            protocols: serde_json::to_string(&new.protocols)
                .unwrap_or_else(|_| "[]".to_string()),
            gpg_public_key: new.gpg_public_key,
            gpg_key_id: new.gpg_key_id,
            shasums_url: new.shasums_url,
            shasums_signature_url: new.shasums_signature_url,
            deprecated: false,
            published_by: new.published_by,
            mirror_configuration_id: new.mirror_configuration_id,
            created_at: now(),
        };
        let inserted = sqlx::query(
            "INSERT INTO provider_versions (id, provider_id, version, protocols, gpg_public_key, gpg_key_id, shasums_url, shasums_signature_url, deprecated, published_by, mirror_configuration_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (provider_id, version) DO NOTHING",
        )
        .bind(&version.id)
        .bind(&version.provider_id)
        .bind(&version.version)
        .bind(&version.protocols)
        .bind(&version.gpg_public_key)
        .bind(&version.gpg_key_id)
        .bind(&version.shasums_url)
        .bind(&version.shasums_signature_url)
        .bind(version.deprecated)
        .bind(&version.published_by)
        .bind(&version.mirror_configuration_id)
        .bind(version.created_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            Ok(version)
        } else {
            self.find_version(provider_id, &version.version)
                .await?
                .ok_or(sqlx::Error::RowNotFound)
        }
    }

    pub async fn find_version(
        &self,
        provider_id: &str,
        version: &str,
    ) -> Result<Option<ProviderVersion>, sqlx::Error> {
        sqlx::query_as::<_, ProviderVersion>(
            "SELECT * FROM provider_versions WHERE provider_id = ? AND version = ?",
        )
        .bind(provider_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_versions(
        &self,
        provider_id: &str,
    ) -> Result<Vec<ProviderVersion>, sqlx::Error> {
        sqlx::query_as::<_, ProviderVersion>(
            "SELECT * FROM provider_versions WHERE provider_id = ? ORDER BY created_at",
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Insert a platform binary; unique violation means the (version, os,
    /// arch) triple already exists.
    #[instrument(skip(self, new), fields(provider_version_id, os = %new.os, arch = %new.arch))]
    pub async fn insert_platform(
        &self,
        provider_version_id: &str,
        new: NewProviderPlatform,
    ) -> Result<ProviderPlatform, sqlx::Error> {
        let platform = ProviderPlatform {
            id: new_id(),
            provider_version_id: provider_version_id.to_string(),
            os: new.os,
            arch: new.arch,
            filename: new.filename,
            storage_path: new.storage_path,
            storage_backend: new.storage_backend,
            size_bytes: new.size_bytes,
            shasum: new.shasum,
            download_count: 0,
            created_at: now(),
        };
        sqlx::query(
            "INSERT INTO provider_platforms (id, provider_version_id, os, arch, filename, storage_path, storage_backend, size_bytes, shasum, download_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&platform.id)
        .bind(&platform.provider_version_id)
        .bind(&platform.os)
        .bind(&platform.arch)
        .bind(&platform.filename)
        .bind(&platform.storage_path)
        .bind(&platform.storage_backend)
        .bind(platform.size_bytes)
        .bind(&platform.shasum)
        .bind(platform.download_count)
        .bind(platform.created_at)
        .execute(&self.pool)
        .await?;
        Ok(platform)
    }

    pub async fn find_platform(
        &self,
        provider_version_id: &str,
        os: &str,
        arch: &str,
    ) -> Result<Option<ProviderPlatform>, sqlx::Error> {
        sqlx::query_as::<_, ProviderPlatform>(
            "SELECT * FROM provider_platforms WHERE provider_version_id = ? AND os = ? AND arch = ?",
        )
        .bind(provider_version_id)
        .bind(os)
        .bind(arch)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_platforms(
        &self,
        provider_version_id: &str,
    ) -> Result<Vec<ProviderPlatform>, sqlx::Error> {
        sqlx::query_as::<_, ProviderPlatform>(
            "SELECT * FROM provider_platforms WHERE provider_version_id = ? ORDER BY os, arch",
        )
        .bind(provider_version_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Fire-and-forget download bookkeeping.
    pub async fn increment_platform_download(
        &self,
        platform_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE provider_platforms SET download_count = download_count + 1 WHERE id = ?",
        )
        .bind(platform_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::orgs::OrgRepository;
    use crate::db::test_pool;

    async fn setup() -> (ProviderRepository, String) {
        let pool = test_pool().await;
        let org = OrgRepository::new(pool.clone())
            .create_organization("acme", "Acme")
            .await
            .unwrap();
        (ProviderRepository::new(pool), org.id)
    }

    fn platform(os: &str, arch: &str) -> NewProviderPlatform {
        NewProviderPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
            filename: format!("terraform-provider-random_v3.6.0_{os}_{arch}.zip"),
            storage_path: format!("providers/hashicorp/random/3.6.0/{os}_{arch}/x.zip"),
            storage_backend: "local".to_string(),
            size_bytes: 1024,
            shasum: "cafe".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_version_is_idempotent() {
        let (repo, org_id) = setup().await;
        let provider = repo
            .ensure(&org_id, "hashicorp", "random", true)
            .await
            .unwrap();
        let v1 = repo
            .ensure_version(
                &provider.id,
                NewProviderVersion {
                    version: "3.6.0".to_string(),
                    protocols: vec!["5.0".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let v2 = repo
            .ensure_version(
                &provider.id,
                NewProviderVersion {
                    version: "3.6.0".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(v1.id, v2.id);
        assert_eq!(v2.protocol_list(), vec!["5.0"]);
    }

    #[tokio::test]
    async fn test_platform_uniqueness_per_version() {
        let (repo, org_id) = setup().await;
        let provider = repo
            .ensure(&org_id, "hashicorp", "random", true)
            .await
            .unwrap();
        let version = repo
            .ensure_version(
                &provider.id,
                NewProviderVersion {
                    version: "3.6.0".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        repo.insert_platform(&version.id, platform("linux", "amd64"))
            .await
            .unwrap();
        let err = repo
            .insert_platform(&version.id, platform("linux", "amd64"))
            .await
            .unwrap_err();
        assert!(crate::db::is_unique_violation(&err));
        repo.insert_platform(&version.id, platform("darwin", "arm64"))
            .await
            .unwrap();
        assert_eq!(repo.list_platforms(&version.id).await.unwrap().len(), 2);
    }
}
