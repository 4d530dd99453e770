//! Mirror configurations, allow/deny policies and approval requests.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now, Page};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MirrorConfiguration {
    pub id: String,
    pub organization_id: String,
    pub upstream_url: String,
    /// JSON array of allowed namespaces; empty allows all.
    pub namespace_filters: String,
    /// JSON array of allowed provider types; empty allows all.
    pub provider_filters: String,
    pub sync_interval_seconds: i64,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MirrorConfiguration {
    #[must_use]
    pub fn namespace_filter_list(&self) -> Vec<String> {
        serde_json::from_str(&self.namespace_filters).unwrap_or_default()
    }

    #[must_use]
    pub fn provider_filter_list(&self) -> Vec<String> {
        serde_json::from_str(&self.provider_filters).unwrap_or_default()
    }

    /// True when the configuration is due for a sync at `at`.
    #[must_use]
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        match self.last_sync_at {
            None => true,
            Some(last) => last + chrono::Duration::seconds(self.sync_interval_seconds) <= at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MirrorPolicy {
    pub id: String,
    pub organization_id: String,
    /// NULL matches any upstream.
    pub upstream_url: Option<String>,
    pub namespace_pattern: String,
    pub provider_pattern: String,
    /// `allow` or `deny`.
    pub action: String,
    pub requires_approval: bool,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MirrorApprovalRequest {
    pub id: String,
    pub mirror_configuration_id: String,
    pub namespace: String,
    pub provider_type: Option<String>,
    pub requested_by: String,
    /// `pending`, `approved` or `rejected`.
    pub status: String,
    pub reviewed_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new mirror configuration.
#[derive(Debug, Clone)]
pub struct NewMirrorConfiguration {
    pub organization_id: String,
    pub upstream_url: String,
    pub namespace_filters: Vec<String>,
    pub provider_filters: Vec<String>,
    pub sync_interval_seconds: i64,
}

/// Fields for a new mirror policy.
#[derive(Debug, Clone)]
pub struct NewMirrorPolicy {
    pub organization_id: String,
    pub upstream_url: Option<String>,
    pub namespace_pattern: String,
    pub provider_pattern: String,
    pub action: String,
    pub requires_approval: bool,
    pub priority: i64,
}

#[derive(Debug, Clone)]
pub struct MirrorRepository {
    pool: SqlitePool,
}

impl MirrorRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, new), fields(upstream = %new.upstream_url))]
    pub async fn create_configuration(
        &self,
        new: NewMirrorConfiguration,
    ) -> Result<MirrorConfiguration, sqlx::Error> {
        let ts = now();
        let config = MirrorConfiguration {
            id: new_id(),
            organization_id: new.organization_id,
            upstream_url: new.upstream_url.trim_end_matches('/').to_string(),
            namespace_filters: serde_json::to_string(&new.namespace_filters)
                .unwrap_or_else(|_| "[]".to_string()),
            provider_filters: serde_json::to_string(&new.provider_filters)
                .unwrap_or_else(|_| "[]".to_string()),
            sync_interval_seconds: new.sync_interval_seconds,
            enabled: true,
            last_sync_at: None,
            last_sync_status: None,
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO mirror_configurations (id, organization_id, upstream_url, namespace_filters, provider_filters, sync_interval_seconds, enabled, last_sync_at, last_sync_status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.id)
        .bind(&config.organization_id)
        .bind(&config.upstream_url)
        .bind(&config.namespace_filters)
        .bind(&config.provider_filters)
        .bind(config.sync_interval_seconds)
        .bind(config.enabled)
        .bind(config.last_sync_at)
        .bind(&config.last_sync_status)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(config)
    }

    pub async fn get_configuration(
        &self,
        id: &str,
    ) -> Result<Option<MirrorConfiguration>, sqlx::Error> {
        sqlx::query_as::<_, MirrorConfiguration>(
            "SELECT * FROM mirror_configurations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_configurations(
        &self,
        page: Page,
    ) -> Result<(Vec<MirrorConfiguration>, i64), sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mirror_configurations")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, MirrorConfiguration>(
            "SELECT * FROM mirror_configurations ORDER BY created_at LIMIT ? OFFSET ?",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn list_enabled_configurations(
        &self,
    ) -> Result<Vec<MirrorConfiguration>, sqlx::Error> {
        sqlx::query_as::<_, MirrorConfiguration>(
            "SELECT * FROM mirror_configurations WHERE enabled = 1 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn set_configuration_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE mirror_configurations SET enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(enabled)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_configuration(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM mirror_configurations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the outcome of a completed tick.
    #[instrument(skip(self))]
    pub async fn record_sync_result(
        &self,
        id: &str,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE mirror_configurations SET last_sync_at = ?, last_sync_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now())
        .bind(status)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, new), fields(action = %new.action, priority = new.priority))]
    pub async fn create_policy(
        &self,
        new: NewMirrorPolicy,
    ) -> Result<MirrorPolicy, sqlx::Error> {
        let ts = now();
        let policy = MirrorPolicy {
            id: new_id(),
            organization_id: new.organization_id,
            upstream_url: new.upstream_url,
            namespace_pattern: new.namespace_pattern,
            provider_pattern: new.provider_pattern,
            action: new.action,
            requires_approval: new.requires_approval,
            priority: new.priority,
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO mirror_policies (id, organization_id, upstream_url, namespace_pattern, provider_pattern, action, requires_approval, priority, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&policy.id)
        .bind(&policy.organization_id)
        .bind(&policy.upstream_url)
        .bind(&policy.namespace_pattern)
        .bind(&policy.provider_pattern)
        .bind(&policy.action)
        .bind(policy.requires_approval)
        .bind(policy.priority)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(policy)
    }

    /// Policies of one organization in evaluation order: priority ascending,
    /// creation time as the tiebreaker.
    pub async fn list_policies(
        &self,
        organization_id: &str,
    ) -> Result<Vec<MirrorPolicy>, sqlx::Error> {
        sqlx::query_as::<_, MirrorPolicy>(
            "SELECT * FROM mirror_policies WHERE organization_id = ? ORDER BY priority, created_at",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_policy(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM mirror_policies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Create a pending approval request if none exists for the target yet.
    #[instrument(skip(self))]
    pub async fn ensure_approval_request(
        &self,
        mirror_configuration_id: &str,
        namespace: &str,
        provider_type: Option<&str>,
        requested_by: &str,
    ) -> Result<MirrorApprovalRequest, sqlx::Error> {
        if let Some(existing) = self
            .find_approval_request(mirror_configuration_id, namespace, provider_type)
            .await?
        {
            return Ok(existing);
        }
        let ts = now();
        let request = MirrorApprovalRequest {
            id: new_id(),
            mirror_configuration_id: mirror_configuration_id.to_string(),
            namespace: namespace.to_string(),
            provider_type: provider_type.map(str::to_string),
            requested_by: requested_by.to_string(),
            status: "pending".to_string(),
            reviewed_by: None,
            notes: None,
            created_at: ts,
            updated_at: ts,
        };
        let inserted = sqlx::query(
            "INSERT INTO mirror_approval_requests (id, mirror_configuration_id, namespace, provider_type, requested_by, status, reviewed_by, notes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (mirror_configuration_id, namespace, provider_type) DO NOTHING",
        )
        .bind(&request.id)
        .bind(&request.mirror_configuration_id)
        .bind(&request.namespace)
        .bind(&request.provider_type)
        .bind(&request.requested_by)
        .bind(&request.status)
        .bind(&request.reviewed_by)
        .bind(&request.notes)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            Ok(request)
        } else {
            self.find_approval_request(mirror_configuration_id, namespace, provider_type)
                .await?
                .ok_or(sqlx::Error::RowNotFound)
        }
    }

    pub async fn find_approval_request(
        &self,
        mirror_configuration_id: &str,
        namespace: &str,
        provider_type: Option<&str>,
    ) -> Result<Option<MirrorApprovalRequest>, sqlx::Error> {
        sqlx::query_as::<_, MirrorApprovalRequest>(
            "SELECT * FROM mirror_approval_requests
             WHERE mirror_configuration_id = ? AND namespace = ? AND provider_type IS ?",
        )
        .bind(mirror_configuration_id)
        .bind(namespace)
        .bind(provider_type)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_approval_requests(
        &self,
        status: Option<&str>,
        page: Page,
    ) -> Result<(Vec<MirrorApprovalRequest>, i64), sqlx::Error> {
        let status_pattern = status.unwrap_or("%");
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mirror_approval_requests WHERE status LIKE ?",
        )
        .bind(status_pattern)
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query_as::<_, MirrorApprovalRequest>(
            "SELECT * FROM mirror_approval_requests WHERE status LIKE ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(status_pattern)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    /// Record a review decision on a pending request.
    #[instrument(skip(self, notes))]
    pub async fn review_approval_request(
        &self,
        id: &str,
        status: &str,
        reviewed_by: &str,
        notes: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE mirror_approval_requests
             SET status = ?, reviewed_by = ?, notes = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status)
        .bind(reviewed_by)
        .bind(notes)
        .bind(now())
        .bind(id)
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

    async fn setup() -> (MirrorRepository, String) {
        let pool = test_pool().await;
        let org = OrgRepository::new(pool.clone())
            .create_organization("acme", "Acme")
            .await
            .unwrap();
        (MirrorRepository::new(pool), org.id)
    }

    fn config(org_id: &str) -> NewMirrorConfiguration {
        NewMirrorConfiguration {
            organization_id: org_id.to_string(),
            upstream_url: "https://registry.terraform.io/".to_string(),
            namespace_filters: vec!["hashicorp".to_string()],
            provider_filters: vec!["random".to_string()],
            sync_interval_seconds: 600,
        }
    }

    #[tokio::test]
    async fn test_configuration_due_logic() {
        let (repo, org_id) = setup().await;
        let created = repo.create_configuration(config(&org_id)).await.unwrap();
        // Trailing slash is normalized away.
        assert_eq!(created.upstream_url, "https://registry.terraform.io");
        // Never synced: due immediately.
        assert!(created.is_due(now()));

        repo.record_sync_result(&created.id, "ok: added=2 failed=0")
            .await
            .unwrap();
        let synced = repo.get_configuration(&created.id).await.unwrap().unwrap();
        assert!(!synced.is_due(now()));
        assert!(synced.is_due(now() + chrono::Duration::seconds(601)));
    }

    #[tokio::test]
    async fn test_approval_request_dedup() {
        let (repo, org_id) = setup().await;
        let config = repo.create_configuration(config(&org_id)).await.unwrap();
        let first = repo
            .ensure_approval_request(&config.id, "hashicorp", Some("random"), "mirror-scheduler")
            .await
            .unwrap();
        let second = repo
            .ensure_approval_request(&config.id, "hashicorp", Some("random"), "mirror-scheduler")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, "pending");
    }

    #[tokio::test]
    async fn test_review_is_single_shot() {
        let (repo, org_id) = setup().await;
        let config = repo.create_configuration(config(&org_id)).await.unwrap();
        let request = repo
            .ensure_approval_request(&config.id, "hashicorp", None, "mirror-scheduler")
            .await
            .unwrap();
        assert!(repo
            .review_approval_request(&request.id, "approved", "admin", Some("ok"))
            .await
            .unwrap());
        // A second review of the same request is a no-op.
        assert!(!repo
            .review_approval_request(&request.id, "rejected", "admin", None)
            .await
            .unwrap());
        let reviewed = repo
            .find_approval_request(&config.id, "hashicorp", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reviewed.status, "approved");
    }

    #[tokio::test]
    async fn test_policies_listed_in_priority_order() {
        let (repo, org_id) = setup().await;
        for (priority, action) in [(10, "deny"), (1, "allow"), (5, "deny")] {
            repo.create_policy(NewMirrorPolicy {
                organization_id: org_id.clone(),
                upstream_url: None,
                namespace_pattern: "*".to_string(),
                provider_pattern: "*".to_string(),
                action: action.to_string(),
                requires_approval: false,
                priority,
            })
            .await
            .unwrap();
        }
        let policies = repo.list_policies(&org_id).await.unwrap();
        let priorities: Vec<i64> = policies.iter().map(|p| p.priority).collect();
        assert_eq!(priorities, vec![1, 5, 10]);
    }
}
