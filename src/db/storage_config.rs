//! The storage-configuration singleton: one active record describing the
//! live backend plus its Cipher-sealed credentials. Switching backends at
//! runtime is out of scope; a new active record takes effect at next boot.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::{new_id, now};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StorageConfiguration {
    pub id: String,
    /// One of `local`, `azure`, `s3`, `gcs`.
    pub backend: String,
    /// Cipher-sealed JSON of the kind-specific settings.
    pub settings_sealed: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StorageConfigRepository {
    pool: SqlitePool,
}

impl StorageConfigRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_active(&self) -> Result<Option<StorageConfiguration>, sqlx::Error> {
        sqlx::query_as::<_, StorageConfiguration>(
            "SELECT * FROM storage_configurations WHERE active = 1 ORDER BY updated_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Deactivate the previous record and install a new active one, in one
    /// transaction.
    #[instrument(skip(self, settings_sealed))]
    pub async fn set_active(
        &self,
        backend: &str,
        settings_sealed: &str,
    ) -> Result<StorageConfiguration, sqlx::Error> {
        let ts = now();
        let config = StorageConfiguration {
            id: new_id(),
            backend: backend.to_string(),
            settings_sealed: settings_sealed.to_string(),
            active: true,
            created_at: ts,
            updated_at: ts,
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE storage_configurations SET active = 0, updated_at = ? WHERE active = 1")
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO storage_configurations (id, backend, settings_sealed, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.id)
        .bind(&config.backend)
        .bind(&config.settings_sealed)
        .bind(config.active)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(config)
    }
}
