//! API key administration. The plaintext secret appears exactly once, in
//! the creation response; afterwards only the prefix is ever shown.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::{AppState, Auth};
use crate::auth::{api_key, scopes};
use crate::db::api_keys::ApiKeyRepository;
use crate::error::{RegistryError, Result};

use super::PageQuery;

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Required when the caller's credential has no home organization.
    #[serde(default)]
    pub organization_id: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::API_KEYS_MANAGE)?;
    let organization_id = request
        .organization_id
        .or_else(|| auth.0.organization_id.clone())
        .ok_or_else(|| {
            RegistryError::BadRequest("organization_id is required".to_string())
        })?;

    let generated = api_key::generate();
    let hash = api_key::hash(&generated.secret).map_err(RegistryError::Internal)?;
    let repo = ApiKeyRepository::new(state.pool.clone());
    let key = repo
        .create(
            &organization_id,
            request.user_id.as_deref(),
            &request.name,
            &generated.prefix,
            &hash,
            &request.scopes,
            request.expires_at,
        )
        .await?;

    // The only response that ever carries the plaintext.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "name": key.name,
            "prefix": key.prefix,
            "secret": generated.secret.as_str(),
            "scopes": key.scope_list(),
            "expires_at": key.expires_at,
        })),
    ))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::API_KEYS_MANAGE)?;
    let organization_id = auth
        .0
        .organization_id
        .clone()
        .ok_or_else(|| RegistryError::BadRequest("credential has no organization".to_string()))?;
    let repo = ApiKeyRepository::new(state.pool.clone());
    let (keys, total) = repo
        .list_for_organization(&organization_id, page.into())
        .await?;
    Ok(Json(json!({
        "total": total,
        "results": keys
            .iter()
            .map(|k| json!({
                "id": k.id,
                "name": k.name,
                "prefix": k.prefix,
                "scopes": k.scope_list(),
                "expires_at": k.expires_at,
                "last_used_at": k.last_used_at,
            }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn revoke(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::API_KEYS_MANAGE)?;
    let repo = ApiKeyRepository::new(state.pool.clone());
    if repo.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("api key".to_string()))
    }
}
