//! SCM providers, per-user OAuth tokens, module links and the webhook
//! event log. Every credential column stores a Cipher-sealed token; the
//! plaintext never touches this layer.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now, Page};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScmProvider {
    pub id: String,
    pub organization_id: String,
    pub display_name: String,
    /// One of `github`, `gitlab`, `azure-devops`, `bitbucket-datacenter`.
    pub kind: String,
    pub base_url: Option<String>,
    pub client_id_sealed: Option<String>,
    pub client_secret_sealed: Option<String>,
    pub webhook_secret_sealed: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScmUserToken {
    pub id: String,
    pub user_id: String,
    pub scm_provider_id: String,
    pub access_token_sealed: String,
    pub refresh_token_sealed: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// JSON array of granted scope strings.
    pub granted_scopes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModuleScmLink {
    pub id: String,
    pub module_id: String,
    pub scm_provider_id: String,
    pub user_id: Option<String>,
    pub repository: String,
    pub tag_filter: String,
    pub webhook_secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEvent {
    pub id: String,
    pub link_id: Option<String>,
    pub delivery_id: Option<String>,
    pub body_sha256: String,
    pub signature_valid: bool,
    pub event_kind: Option<String>,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new SCM provider record; credentials arrive pre-sealed.
#[derive(Debug, Clone)]
pub struct NewScmProvider {
    pub organization_id: String,
    pub display_name: String,
    pub kind: String,
    pub base_url: Option<String>,
    pub client_id_sealed: Option<String>,
    pub client_secret_sealed: Option<String>,
    pub webhook_secret_sealed: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScmRepository {
    pool: SqlitePool,
}

impl ScmRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, new), fields(kind = %new.kind, display_name = %new.display_name))]
    pub async fn create_provider(
        &self,
        new: NewScmProvider,
    ) -> Result<ScmProvider, sqlx::Error> {
        let ts = now();
        let provider = ScmProvider {
            id: new_id(),
            organization_id: new.organization_id,
            display_name: new.display_name,
            kind: new.kind,
            base_url: new.base_url,
            client_id_sealed: new.client_id_sealed,
            client_secret_sealed: new.client_secret_sealed,
            webhook_secret_sealed: new.webhook_secret_sealed,
            active: true,
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO scm_providers (id, organization_id, display_name, kind, base_url, client_id_sealed, client_secret_sealed, webhook_secret_sealed, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&provider.id)
        .bind(&provider.organization_id)
        .bind(&provider.display_name)
        .bind(&provider.kind)
        .bind(&provider.base_url)
        .bind(&provider.client_id_sealed)
        .bind(&provider.client_secret_sealed)
        .bind(&provider.webhook_secret_sealed)
        .bind(provider.active)
        .bind(provider.created_at)
        .bind(provider.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(provider)
    }

    pub async fn get_provider(&self, id: &str) -> Result<Option<ScmProvider>, sqlx::Error> {
        sqlx::query_as::<_, ScmProvider>("SELECT * FROM scm_providers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_providers(
        &self,
        organization_id: &str,
        page: Page,
    ) -> Result<(Vec<ScmProvider>, i64), sqlx::Error> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scm_providers WHERE organization_id = ?")
                .bind(organization_id)
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query_as::<_, ScmProvider>(
            "SELECT * FROM scm_providers WHERE organization_id = ? ORDER BY display_name LIMIT ? OFFSET ?",
        )
        .bind(organization_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn set_provider_active(
        &self,
        id: &str,
        active: bool,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE scm_providers SET active = ?, updated_at = ? WHERE id = ?")
                .bind(active)
                .bind(now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_provider(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM scm_providers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert or replace the user's token for one SCM provider.
    #[instrument(skip(self, access_token_sealed, refresh_token_sealed, granted_scopes))]
    pub async fn upsert_user_token(
        &self,
        user_id: &str,
        scm_provider_id: &str,
        access_token_sealed: &str,
        refresh_token_sealed: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        granted_scopes: &[String],
    ) -> Result<(), sqlx::Error> {
        let ts = now();
        sqlx::query(
            "INSERT INTO scm_user_tokens (id, user_id, scm_provider_id, access_token_sealed, refresh_token_sealed, expires_at, granted_scopes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, scm_provider_id) DO UPDATE SET
               access_token_sealed = excluded.access_token_sealed,
               refresh_token_sealed = excluded.refresh_token_sealed,
               expires_at = excluded.expires_at,
               granted_scopes = excluded.granted_scopes,
               updated_at = excluded.updated_at",
        )
        .bind(new_id())
        .bind(user_id)
        .bind(scm_provider_id)
        .bind(access_token_sealed)
        .bind(refresh_token_sealed)
        .bind(expires_at)
        .bind(serde_json::to_string(granted_scopes).unwrap_or_else(|_| "[]".to_string()))
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_token(
        &self,
        user_id: &str,
        scm_provider_id: &str,
    ) -> Result<Option<ScmUserToken>, sqlx::Error> {
        sqlx::query_as::<_, ScmUserToken>(
            "SELECT * FROM scm_user_tokens WHERE user_id = ? AND scm_provider_id = ?",
        )
        .bind(user_id)
        .bind(scm_provider_id)
        .fetch_optional(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments, reason = "creation captures the full record")]
    #[instrument(skip(self, webhook_secret))]
    pub async fn create_link(
        &self,
        module_id: &str,
        scm_provider_id: &str,
        user_id: Option<&str>,
        repository: &str,
        tag_filter: &str,
        webhook_secret: &str,
    ) -> Result<ModuleScmLink, sqlx::Error> {
        let ts = now();
        let link = ModuleScmLink {
            id: new_id(),
            module_id: module_id.to_string(),
            scm_provider_id: scm_provider_id.to_string(),
            user_id: user_id.map(str::to_string),
            repository: repository.to_string(),
            tag_filter: tag_filter.to_string(),
            webhook_secret: webhook_secret.to_string(),
            active: true,
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO module_scm_links (id, module_id, scm_provider_id, user_id, repository, tag_filter, webhook_secret, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&link.id)
        .bind(&link.module_id)
        .bind(&link.scm_provider_id)
        .bind(&link.user_id)
        .bind(&link.repository)
        .bind(&link.tag_filter)
        .bind(&link.webhook_secret)
        .bind(link.active)
        .bind(link.created_at)
        .bind(link.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(link)
    }

    pub async fn get_link(&self, id: &str) -> Result<Option<ModuleScmLink>, sqlx::Error> {
        sqlx::query_as::<_, ModuleScmLink>("SELECT * FROM module_scm_links WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_link_by_module(
        &self,
        module_id: &str,
    ) -> Result<Option<ModuleScmLink>, sqlx::Error> {
        sqlx::query_as::<_, ModuleScmLink>(
            "SELECT * FROM module_scm_links WHERE module_id = ?",
        )
        .bind(module_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn set_link_active(&self, id: &str, active: bool) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE module_scm_links SET active = ?, updated_at = ? WHERE id = ?")
                .bind(active)
                .bind(now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_link(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM module_scm_links WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append-only; every inbound delivery is recorded, verified or not.
    #[instrument(skip(self, body_sha256))]
    pub async fn record_webhook_event(
        &self,
        link_id: Option<&str>,
        delivery_id: Option<&str>,
        body_sha256: &str,
        signature_valid: bool,
        event_kind: Option<&str>,
        outcome: &str,
    ) -> Result<WebhookEvent, sqlx::Error> {
        let event = WebhookEvent {
            id: new_id(),
            link_id: link_id.map(str::to_string),
            delivery_id: delivery_id.map(str::to_string),
            body_sha256: body_sha256.to_string(),
            signature_valid,
            event_kind: event_kind.map(str::to_string),
            outcome: outcome.to_string(),
            created_at: now(),
        };
        sqlx::query(
            "INSERT INTO webhook_events (id, link_id, delivery_id, body_sha256, signature_valid, event_kind, outcome, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.link_id)
        .bind(&event.delivery_id)
        .bind(&event.body_sha256)
        .bind(event.signature_valid)
        .bind(&event.event_kind)
        .bind(&event.outcome)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    /// Annotate a recorded delivery with its final publish outcome.
    pub async fn update_webhook_outcome(
        &self,
        event_id: &str,
        outcome: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE webhook_events SET outcome = ? WHERE id = ?")
            .bind(outcome)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_webhook_events(
        &self,
        link_id: &str,
        page: Page,
    ) -> Result<(Vec<WebhookEvent>, i64), sqlx::Error> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhook_events WHERE link_id = ?")
                .bind(link_id)
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE link_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(link_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::modules::ModuleRepository;
    use crate::db::orgs::OrgRepository;
    use crate::db::test_pool;

    async fn setup() -> (ScmRepository, String, String) {
        let pool = test_pool().await;
        let org = OrgRepository::new(pool.clone())
            .create_organization("acme", "Acme")
            .await
            .unwrap();
        let module = ModuleRepository::new(pool.clone())
            .ensure(&org.id, "acme", "vpc", "aws", None)
            .await
            .unwrap();
        (ScmRepository::new(pool), org.id, module.id)
    }

    fn provider(org_id: &str) -> NewScmProvider {
        NewScmProvider {
            organization_id: org_id.to_string(),
            display_name: "Corp GitHub".to_string(),
            kind: "github".to_string(),
            base_url: None,
            client_id_sealed: Some("sealed-id".to_string()),
            client_secret_sealed: Some("sealed-secret".to_string()),
            webhook_secret_sealed: None,
        }
    }

    #[tokio::test]
    async fn test_link_is_unique_per_module() {
        let (repo, org_id, module_id) = setup().await;
        let scm = repo.create_provider(provider(&org_id)).await.unwrap();
        repo.create_link(&module_id, &scm.id, None, "acme/vpc", "v*", "whsec")
            .await
            .unwrap();
        let err = repo
            .create_link(&module_id, &scm.id, None, "acme/vpc-2", "v*", "whsec")
            .await
            .unwrap_err();
        assert!(crate::db::is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_user_token_upsert_replaces() {
        let (repo, org_id, _) = setup().await;
        let scm = repo.create_provider(provider(&org_id)).await.unwrap();
        let user = OrgRepository::new(repo.pool.clone())
            .create_user("dev@example.com", "Dev", None)
            .await
            .unwrap();
        repo.upsert_user_token(&user.id, &scm.id, "sealed-1", None, None, &[])
            .await
            .unwrap();
        repo.upsert_user_token(
            &user.id,
            &scm.id,
            "sealed-2",
            Some("sealed-refresh"),
            None,
            &["repo".to_string()],
        )
        .await
        .unwrap();
        let token = repo.get_user_token(&user.id, &scm.id).await.unwrap().unwrap();
        assert_eq!(token.access_token_sealed, "sealed-2");
        assert_eq!(token.refresh_token_sealed.as_deref(), Some("sealed-refresh"));
    }

    #[tokio::test]
    async fn test_webhook_event_log_is_append_only() {
        let (repo, org_id, module_id) = setup().await;
        let scm = repo.create_provider(provider(&org_id)).await.unwrap();
        let link = repo
            .create_link(&module_id, &scm.id, None, "acme/vpc", "v*", "whsec")
            .await
            .unwrap();
        repo.record_webhook_event(
            Some(&link.id),
            Some("delivery-1"),
            "abc",
            true,
            Some("push"),
            "published",
        )
        .await
        .unwrap();
        repo.record_webhook_event(Some(&link.id), None, "def", false, None, "rejected")
            .await
            .unwrap();
        let (events, total) = repo
            .list_webhook_events(&link.id, Page::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(events.len(), 2);
    }
}
