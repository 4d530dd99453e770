//! Module management: search for the UI, deprecation toggles and deletion.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::api::{AppState, Auth};
use crate::auth::scopes;
use crate::db::modules::ModuleRepository;
use crate::error::{RegistryError, Result};

use super::PageQuery;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "super::default_limit")]
    pub limit: i64,
}

/// `GET /api/v1/modules?q=&offset=&limit=`
pub async fn search(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MODULES_READ)?;
    let repo = ModuleRepository::new(state.pool.clone());
    let page = PageQuery {
        offset: query.offset,
        limit: query.limit,
    };
    let (modules, total) = repo.search(query.q.as_deref(), page.into()).await?;
    Ok(Json(json!({
        "total": total,
        "results": modules
            .iter()
            .map(|m| json!({
                "id": m.id,
                "namespace": m.namespace,
                "name": m.name,
                "system": m.system,
                "description": m.description,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeprecationRequest {
    pub deprecated: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// `PUT /api/v1/admin/modules/{id}/versions/{version}/deprecation`
pub async fn set_deprecation(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path((module_id, version)): Path<(String, String)>,
    Json(request): Json<DeprecationRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MODULES_WRITE)?;
    let repo = ModuleRepository::new(state.pool.clone());
    let row = repo
        .find_version(&module_id, &version)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("version {version}")))?;
    repo.set_deprecation(&row.id, request.deprecated, request.message.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/v1/admin/modules/{id}` - removes the module and all
/// versions; artifact deletion is best-effort and failures are only logged.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MODULES_WRITE)?;
    let repo = ModuleRepository::new(state.pool.clone());
    let versions = repo.list_versions(&module_id).await?;
    if !repo.delete(&module_id).await? {
        return Err(RegistryError::NotFound("module".to_string()));
    }
    for version in versions {
        if let Err(error) = state.storage.delete(&version.storage_path).await {
            warn!(path = %version.storage_path, %error, "orphaned artifact left behind after module deletion");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}
