//! Organizations, users, memberships and role templates.
//!
//! Memberships are an explicit junction table; a principal's effective
//! scope set is the union of role-template scopes across active
//! memberships (plus any directly granted API-key scopes, which live in
//! [`super::api_keys`]).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now, Page};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Organization {
    pub id: String,
    pub slug: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub external_subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoleTemplate {
    pub id: String,
    pub organization_id: Option<String>,
    pub name: String,
    /// JSON array of scope strings.
    pub scopes: String,
    pub system_defined: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoleTemplate {
    /// Parsed scope list; malformed rows yield no scopes rather than a panic.
    #[must_use]
    pub fn scope_list(&self) -> Vec<String> {
        serde_json::from_str(&self.scopes).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct OrgRepository {
    pool: SqlitePool,
}

impl OrgRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn create_organization(
        &self,
        slug: &str,
        display_name: &str,
    ) -> Result<Organization, sqlx::Error> {
        let ts = now();
        let org = Organization {
            id: new_id(),
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO organizations (id, slug, display_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&org.id)
        .bind(&org.slug)
        .bind(&org.display_name)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(org)
    }

    pub async fn get_organization(&self, id: &str) -> Result<Option<Organization>, sqlx::Error> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_organization_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<Organization>, sqlx::Error> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
    }

    /// Get-or-create by slug; used for the default organization at boot.
    pub async fn ensure_organization(
        &self,
        slug: &str,
        display_name: &str,
    ) -> Result<Organization, sqlx::Error> {
        if let Some(existing) = self.get_organization_by_slug(slug).await? {
            return Ok(existing);
        }
        self.create_organization(slug, display_name).await
    }

    pub async fn list_organizations(
        &self,
        page: Page,
    ) -> Result<(Vec<Organization>, i64), sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM organizations")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, Organization>(
            "SELECT * FROM organizations ORDER BY slug LIMIT ? OFFSET ?",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    /// Deletion cascades to owned entities via foreign keys.
    #[instrument(skip(self))]
    pub async fn delete_organization(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM organizations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        external_subject: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        let ts = now();
        let user = User {
            id: new_id(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            external_subject: external_subject.map(str::to_string),
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO users (id, email, display_name, external_subject, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.external_subject)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_users(&self, page: Page) -> Result<(Vec<User>, i64), sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let rows =
            sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY email LIMIT ? OFFSET ?")
                .bind(page.limit)
                .bind(page.offset)
                .fetch_all(&self.pool)
                .await?;
        Ok((rows, total))
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, scopes))]
    pub async fn create_role_template(
        &self,
        organization_id: Option<&str>,
        name: &str,
        scopes: &[String],
        system_defined: bool,
    ) -> Result<RoleTemplate, sqlx::Error> {
        let ts = now();
        let template = RoleTemplate {
            id: new_id(),
            organization_id: organization_id.map(str::to_string),
            name: name.to_string(),
            scopes: serde_json::to_string(scopes).unwrap_or_else(|_| "[]".to_string()),
            system_defined,
            created_at: ts,
            updated_at: ts,
        };
        sqlx::query(
            "INSERT INTO role_templates (id, organization_id, name, scopes, system_defined, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id)
        .bind(&template.organization_id)
        .bind(&template.name)
        .bind(&template.scopes)
        .bind(template.system_defined)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(template)
    }

    pub async fn get_role_template(
        &self,
        id: &str,
    ) -> Result<Option<RoleTemplate>, sqlx::Error> {
        sqlx::query_as::<_, RoleTemplate>("SELECT * FROM role_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_role_template_by_name(
        &self,
        organization_id: Option<&str>,
        name: &str,
    ) -> Result<Option<RoleTemplate>, sqlx::Error> {
        sqlx::query_as::<_, RoleTemplate>(
            "SELECT * FROM role_templates WHERE organization_id IS ? AND name = ?",
        )
        .bind(organization_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn add_member(
        &self,
        organization_id: &str,
        user_id: &str,
        role_template_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO organization_members (id, organization_id, user_id, role_template_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(organization_id)
        .bind(user_id)
        .bind(role_template_id)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Union of role-template scopes across the user's memberships.
    pub async fn effective_user_scopes(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT rt.scopes FROM organization_members om
             JOIN role_templates rt ON rt.id = om.role_template_id
             WHERE om.user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut scopes: Vec<String> = rows
            .iter()
            .flat_map(|raw| serde_json::from_str::<Vec<String>>(raw).unwrap_or_default())
            .collect();
        scopes.sort();
        scopes.dedup();
        Ok(scopes)
    }

    /// First organization membership, used as the principal's home tenant.
    pub async fn primary_organization_id(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT organization_id FROM organization_members WHERE user_id = ?
             ORDER BY created_at LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }
}
