//! # Metadata Store
//!
//! Durable, transactional record of every registry entity, kept in SQLite
//! via sqlx. One repository per entity family, each a thin struct over the
//! shared pool:
//!
//! - [`orgs`] - organizations, users, memberships, role templates
//! - [`api_keys`] - long-lived bearer credentials
//! - [`modules`] - modules and module versions
//! - [`providers`] - providers, versions, platform binaries
//! - [`scm`] - SCM providers, user tokens, module links, webhook event log
//! - [`mirrors`] - mirror configurations, policies, approval requests
//! - [`storage_config`] - the active object-storage backend record
//!
//! Conventions: writes are single statements or explicit transactions;
//! uniqueness from the data model is enforced by the schema, not only in
//! handlers; list queries paginate with offset + limit (limit clamped to
//! 100) and return `(results, total_count)`. Download counters are
//! incremented fire-and-forget, so minor under-counting under crash is
//! acceptable and documented.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

pub mod api_keys;
pub mod mirrors;
pub mod modules;
pub mod orgs;
pub mod providers;
pub mod scm;
pub mod storage_config;

/// Maximum page size accepted from clients.
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Offset + limit pagination, clamped.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    #[must_use]
    pub fn new(offset: i64, limit: i64) -> Self {
        Self {
            offset: offset.max(0),
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Fresh opaque identifier for a new row.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC instant; all row timestamps come from here.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// True when an error is a unique-constraint violation, used to map races
/// on (module, version) and friends to `conflict`.
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

/// Open the pool and bring the schema up to date. Migrations are numbered,
/// forward/backward, and applied idempotently.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("failed to open database")?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply pending migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("database schema is up to date");
    Ok(())
}

/// Liveness ping used by the health endpoint.
pub async fn ping(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    migrate(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamps_limit() {
        let page = Page::new(-5, 10_000);
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, MAX_PAGE_LIMIT);
        let page = Page::new(40, 0);
        assert_eq!(page.limit, 1);
    }

    #[tokio::test]
    async fn test_migrations_apply_and_ping() {
        let pool = test_pool().await;
        ping(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        migrate(&pool).await.unwrap();
    }
}
