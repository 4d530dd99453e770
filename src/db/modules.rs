//! Modules and module versions.
//!
//! The (module, version) uniqueness constraint is the linearization point
//! for concurrent publishes: the winning writer inserts, every other writer
//! observes a unique violation mapped to `version_exists` upstream.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now, Page};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Module {
    pub id: String,
    pub organization_id: String,
    pub namespace: String,
    pub name: String,
    pub system: String,
    pub description: Option<String>,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModuleVersion {
    pub id: String,
    pub module_id: String,
    pub version: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub download_count: i64,
    pub readme: Option<String>,
    pub deprecated: bool,
    pub deprecation_message: Option<String>,
    pub published_by: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields recorded for a new version row.
#[derive(Debug, Clone)]
pub struct NewModuleVersion {
    pub module_id: String,
    pub version: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub readme: Option<String>,
    pub published_by: Option<String>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleRepository {
    pool: SqlitePool,
}

impl ModuleRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        namespace: &str,
        name: &str,
        system: &str,
    ) -> Result<Option<Module>, sqlx::Error> {
        sqlx::query_as::<_, Module>(
            "SELECT * FROM modules WHERE namespace = ? AND name = ? AND system = ?",
        )
        .bind(namespace)
        .bind(name)
        .bind(system)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Module>, sqlx::Error> {
        sqlx::query_as::<_, Module>("SELECT * FROM modules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Get-or-create keyed on the Terraform address. Races resolve via the
    /// unique constraint plus a refetch.
    #[instrument(skip(self))]
    pub async fn ensure(
        &self,
        organization_id: &str,
        namespace: &str,
        name: &str,
        system: &str,
        description: Option<&str>,
    ) -> Result<Module, sqlx::Error> {
        if let Some(existing) = self.find(namespace, name, system).await? {
            return Ok(existing);
        }
        let ts = now();
        let module = Module {
            id: new_id(),
            organization_id: organization_id.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            system: system.to_string(),
            description: description.map(str::to_string),
            source_url: None,
            created_at: ts,
            updated_at: ts,
        };
        let inserted = sqlx::query(
            "INSERT INTO modules (id, organization_id, namespace, name, system, description, source_url, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (namespace, name, system) DO NOTHING",
        )
        .bind(&module.id)
        .bind(&module.organization_id)
        .bind(&module.namespace)
        .bind(&module.name)
        .bind(&module.system)
        .bind(&module.description)
        .bind(&module.source_url)
        .bind(module.created_at)
        .bind(module.updated_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            Ok(module)
        } else {
            // Lost the race; the winner's row is authoritative.
            self.find(namespace, name, system)
                .await?
                .ok_or(sqlx::Error::RowNotFound)
        }
    }

    /// Substring search over namespace, name and system.
    pub async fn search(
        &self,
        query: Option<&str>,
        page: Page,
    ) -> Result<(Vec<Module>, i64), sqlx::Error> {
        let pattern = format!("%{}%", query.unwrap_or(""));
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM modules
             WHERE namespace LIKE ?1 OR name LIKE ?1 OR system LIKE ?1",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query_as::<_, Module>(
            "SELECT * FROM modules
             WHERE namespace LIKE ?1 OR name LIKE ?1 OR system LIKE ?1
             ORDER BY namespace, name, system LIMIT ?2 OFFSET ?3",
        )
        .bind(&pattern)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM modules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a version row. A unique violation here means the version
    /// already exists and is surfaced untranslated for the caller to map.
    #[instrument(skip(self, new), fields(module_id = %new.module_id, version = %new.version))]
    pub async fn insert_version(
        &self,
        new: NewModuleVersion,
    ) -> Result<ModuleVersion, sqlx::Error> {
        let version = ModuleVersion {
            id: new_id(),
            module_id: new.module_id,
            version: new.version,
            storage_path: new.storage_path,
            storage_backend: new.storage_backend,
            size_bytes: new.size_bytes,
            checksum: new.checksum,
            download_count: 0,
            readme: new.readme,
            deprecated: false,
            deprecation_message: None,
            published_by: new.published_by,
            commit_sha: new.commit_sha,
            created_at: now(),
        };
        sqlx::query(
            "INSERT INTO module_versions (id, module_id, version, storage_path, storage_backend, size_bytes, checksum, download_count, readme, deprecated, deprecation_message, published_by, commit_sha, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&version.id)
        .bind(&version.module_id)
        .bind(&version.version)
        .bind(&version.storage_path)
        .bind(&version.storage_backend)
        .bind(version.size_bytes)
        .bind(&version.checksum)
        .bind(version.download_count)
        .bind(&version.readme)
        .bind(version.deprecated)
        .bind(&version.deprecation_message)
        .bind(&version.published_by)
        .bind(&version.commit_sha)
        .bind(version.created_at)
        .execute(&self.pool)
        .await?;
        Ok(version)
    }

    pub async fn find_version(
        &self,
        module_id: &str,
        version: &str,
    ) -> Result<Option<ModuleVersion>, sqlx::Error> {
        sqlx::query_as::<_, ModuleVersion>(
            "SELECT * FROM module_versions WHERE module_id = ? AND version = ?",
        )
        .bind(module_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
    }

    /// All versions of a module; semantic ordering is applied by the caller
    /// since semver does not sort lexically.
    pub async fn list_versions(
        &self,
        module_id: &str,
    ) -> Result<Vec<ModuleVersion>, sqlx::Error> {
        sqlx::query_as::<_, ModuleVersion>(
            "SELECT * FROM module_versions WHERE module_id = ? ORDER BY created_at",
        )
        .bind(module_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Fire-and-forget; see module docs on counter semantics.
    pub async fn increment_download(&self, version_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE module_versions SET download_count = download_count + 1 WHERE id = ?",
        )
        .bind(version_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_deprecation(
        &self,
        version_id: &str,
        deprecated: bool,
        message: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE module_versions SET deprecated = ?, deprecation_message = ? WHERE id = ?",
        )
        .bind(deprecated)
        .bind(message)
        .bind(version_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::orgs::OrgRepository;
    use crate::db::test_pool;

    async fn setup() -> (ModuleRepository, String) {
        let pool = test_pool().await;
        let org = OrgRepository::new(pool.clone())
            .create_organization("acme", "Acme")
            .await
            .unwrap();
        (ModuleRepository::new(pool), org.id)
    }

    fn version_row(module_id: &str, version: &str) -> NewModuleVersion {
        NewModuleVersion {
            module_id: module_id.to_string(),
            version: version.to_string(),
            storage_path: format!("modules/acme/vpc/aws/{version}.tar.gz"),
            storage_backend: "local".to_string(),
            size_bytes: 128,
            checksum: "deadbeef".to_string(),
            readme: None,
            published_by: None,
            commit_sha: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (repo, org_id) = setup().await;
        let first = repo
            .ensure(&org_id, "acme", "vpc", "aws", Some("VPC module"))
            .await
            .unwrap();
        let second = repo.ensure(&org_id, "acme", "vpc", "aws", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.description.as_deref(), Some("VPC module"));
    }

    #[tokio::test]
    async fn test_version_uniqueness() {
        let (repo, org_id) = setup().await;
        let module = repo.ensure(&org_id, "acme", "vpc", "aws", None).await.unwrap();
        repo.insert_version(version_row(&module.id, "1.0.0"))
            .await
            .unwrap();
        let err = repo
            .insert_version(version_row(&module.id, "1.0.0"))
            .await
            .unwrap_err();
        assert!(crate::db::is_unique_violation(&err));
        // A different version of the same module is fine.
        repo.insert_version(version_row(&module.id, "1.0.1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_download_counter_is_monotonic() {
        let (repo, org_id) = setup().await;
        let module = repo.ensure(&org_id, "acme", "vpc", "aws", None).await.unwrap();
        let version = repo
            .insert_version(version_row(&module.id, "1.0.0"))
            .await
            .unwrap();
        repo.increment_download(&version.id).await.unwrap();
        repo.increment_download(&version.id).await.unwrap();
        let reloaded = repo.find_version(&module.id, "1.0.0").await.unwrap().unwrap();
        assert_eq!(reloaded.download_count, 2);
    }

    #[tokio::test]
    async fn test_search_pagination() {
        let (repo, org_id) = setup().await;
        for name in ["vpc", "vpn", "eks"] {
            repo.ensure(&org_id, "acme", name, "aws", None).await.unwrap();
        }
        let (results, total) = repo.search(Some("vp"), Page::default()).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(results.len(), 2);
        let (page, total) = repo.search(None, Page::new(1, 1)).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_deprecation_toggle() {
        let (repo, org_id) = setup().await;
        let module = repo.ensure(&org_id, "acme", "vpc", "aws", None).await.unwrap();
        let version = repo
            .insert_version(version_row(&module.id, "1.0.0"))
            .await
            .unwrap();
        assert!(repo
            .set_deprecation(&version.id, true, Some("use 2.x"))
            .await
            .unwrap());
        let reloaded = repo.find_version(&module.id, "1.0.0").await.unwrap().unwrap();
        assert!(reloaded.deprecated);
        assert_eq!(reloaded.deprecation_message.as_deref(), Some("use 2.x"));
    }
}
