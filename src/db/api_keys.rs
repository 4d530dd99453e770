//! API key records. The plaintext secret is returned to the client exactly
//! once at creation; only the salted hash and a displayable prefix are
//! persisted here. Hashing and verification live in [`crate::auth::api_key`].

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now, Page};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub name: String,
    /// First 8 characters of the secret, shown in listings.
    pub prefix: String,
    pub secret_hash: String,
    /// JSON array of scope strings.
    pub scopes: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    #[must_use]
    pub fn scope_list(&self) -> Vec<String> {
        serde_json::from_str(&self.scopes).unwrap_or_default()
    }

    #[must_use]
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= at)
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRepository {
    pool: SqlitePool,
}

impl ApiKeyRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments, reason = "creation captures the full record")]
    #[instrument(skip(self, secret_hash, scopes))]
    pub async fn create(
        &self,
        organization_id: &str,
        user_id: Option<&str>,
        name: &str,
        prefix: &str,
        secret_hash: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey, sqlx::Error> {
        let key = ApiKey {
            id: new_id(),
            organization_id: organization_id.to_string(),
            user_id: user_id.map(str::to_string),
            name: name.to_string(),
            prefix: prefix.to_string(),
            secret_hash: secret_hash.to_string(),
            scopes: serde_json::to_string(scopes).unwrap_or_else(|_| "[]".to_string()),
            expires_at,
            last_used_at: None,
            created_at: now(),
        };
        sqlx::query(
            "INSERT INTO api_keys (id, organization_id, user_id, name, prefix, secret_hash, scopes, expires_at, last_used_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.id)
        .bind(&key.organization_id)
        .bind(&key.user_id)
        .bind(&key.name)
        .bind(&key.prefix)
        .bind(&key.secret_hash)
        .bind(&key.scopes)
        .bind(key.expires_at)
        .bind(key.last_used_at)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(key)
    }

    pub async fn get_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>, sqlx::Error> {
        sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE prefix = ?")
            .bind(prefix)
            .fetch_optional(&self.pool)
            .await
    }

    /// Fire-and-forget bookkeeping on successful authentication.
    pub async fn touch_last_used(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_for_organization(
        &self,
        organization_id: &str,
        page: Page,
    ) -> Result<(Vec<ApiKey>, i64), sqlx::Error> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE organization_id = ?")
                .bind(organization_id)
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE organization_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(organization_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::db::orgs::OrgRepository;

    async fn setup() -> (ApiKeyRepository, String) {
        let pool = test_pool().await;
        let org = OrgRepository::new(pool.clone())
            .create_organization("acme", "Acme")
            .await
            .unwrap();
        (ApiKeyRepository::new(pool), org.id)
    }

    #[tokio::test]
    async fn test_create_and_lookup_by_prefix() {
        let (repo, org_id) = setup().await;
        let created = repo
            .create(
                &org_id,
                None,
                "ci",
                "tfr_abcd",
                "$argon2id$stub",
                &["modules:write".to_string()],
                None,
            )
            .await
            .unwrap();
        let found = repo.get_by_prefix("tfr_abcd").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.scope_list(), vec!["modules:write"]);
        assert!(found.last_used_at.is_none());

        repo.touch_last_used(&created.id).await.unwrap();
        let touched = repo.get_by_prefix("tfr_abcd").await.unwrap().unwrap();
        assert!(touched.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_expiry_check() {
        let (repo, org_id) = setup().await;
        let past = now() - chrono::Duration::hours(1);
        let key = repo
            .create(&org_id, None, "old", "tfr_old1", "h", &[], Some(past))
            .await
            .unwrap();
        assert!(key.is_expired(now()));
        let fresh = repo
            .create(&org_id, None, "new", "tfr_new1", "h", &[], None)
            .await
            .unwrap();
        assert!(!fresh.is_expired(now()));
    }

    #[tokio::test]
    async fn test_prefix_collision_rejected() {
        let (repo, org_id) = setup().await;
        repo.create(&org_id, None, "a", "tfr_same", "h", &[], None)
            .await
            .unwrap();
        let err = repo
            .create(&org_id, None, "b", "tfr_same", "h", &[], None)
            .await
            .unwrap_err();
        assert!(crate::db::is_unique_violation(&err));
    }
}
