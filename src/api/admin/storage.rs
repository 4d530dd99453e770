//! Storage-configuration administration. The active record describes the
//! live backend; a change takes effect at next boot and implies an external
//! data migration, so this surface is admin-only.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::{AppState, Auth};
use crate::auth::scopes;
use crate::db::storage_config::StorageConfigRepository;
use crate::error::{RegistryError, Result};

/// `GET /api/v1/admin/storage` - the active backend, credentials omitted.
pub async fn get_active(
    State(state): State<Arc<AppState>>,
    auth: Auth,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ADMIN)?;
    let repo = StorageConfigRepository::new(state.pool.clone());
    let active = repo.get_active().await?;
    Ok(Json(json!({
        "running_backend": state.storage.name(),
        "configured": active.map(|c| json!({
            "id": c.id,
            "backend": c.backend,
            "updated_at": c.updated_at,
        })),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetStorageRequest {
    pub backend: String,
    /// Kind-specific settings; sealed by the Cipher before persistence.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// `PUT /api/v1/admin/storage`
pub async fn set_active(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<SetStorageRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ADMIN)?;
    if !matches!(request.backend.as_str(), "local" | "azure" | "s3" | "gcs") {
        return Err(RegistryError::BadRequest(format!(
            "unknown backend {}",
            request.backend
        )));
    }
    let settings = serde_json::to_string(&request.settings)
        .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
    let sealed = state
        .cipher
        .seal_str(&settings)
        .map_err(|e| RegistryError::Internal(e.into()))?;

    let repo = StorageConfigRepository::new(state.pool.clone());
    let config = repo.set_active(&request.backend, &sealed).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": config.id,
            "backend": config.backend,
            "note": "the new backend takes effect at next process start",
        })),
    ))
}
