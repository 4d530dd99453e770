//! Mirror configuration, policy and approval administration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::{AppState, Auth};
use crate::auth::scopes;
use crate::db::mirrors::{MirrorRepository, NewMirrorConfiguration, NewMirrorPolicy};
use crate::error::{RegistryError, Result};

use super::PageQuery;

#[derive(Debug, Deserialize)]
pub struct CreateMirrorRequest {
    pub upstream_url: String,
    #[serde(default)]
    pub namespace_filters: Vec<String>,
    #[serde(default)]
    pub provider_filters: Vec<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: i64,
    #[serde(default)]
    pub organization_id: Option<String>,
}

fn default_sync_interval() -> i64 {
    600
}

pub async fn create_configuration(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateMirrorRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_MANAGE)?;
    if request.namespace_filters.is_empty() {
        return Err(RegistryError::BadRequest(
            "at least one namespace filter is required".to_string(),
        ));
    }
    let organization_id = request
        .organization_id
        .or_else(|| auth.0.organization_id.clone())
        .ok_or_else(|| RegistryError::BadRequest("organization_id is required".to_string()))?;

    let repo = MirrorRepository::new(state.pool.clone());
    let config = repo
        .create_configuration(NewMirrorConfiguration {
            organization_id,
            upstream_url: request.upstream_url,
            namespace_filters: request.namespace_filters,
            provider_filters: request.provider_filters,
            sync_interval_seconds: request.sync_interval_seconds.max(60),
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": config.id, "upstream_url": config.upstream_url })),
    ))
}

pub async fn list_configurations(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_READ)?;
    let repo = MirrorRepository::new(state.pool.clone());
    let (configs, total) = repo.list_configurations(page.into()).await?;
    Ok(Json(json!({
        "total": total,
        "results": configs
            .iter()
            .map(|c| json!({
                "id": c.id,
                "upstream_url": c.upstream_url,
                "namespace_filters": c.namespace_filter_list(),
                "provider_filters": c.provider_filter_list(),
                "sync_interval_seconds": c.sync_interval_seconds,
                "enabled": c.enabled,
                "last_sync_at": c.last_sync_at,
                "last_sync_status": c.last_sync_status,
            }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn delete_configuration(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_MANAGE)?;
    let repo = MirrorRepository::new(state.pool.clone());
    if repo.delete_configuration(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("mirror configuration".to_string()))
    }
}

/// `POST /api/v1/admin/mirrors/sync` - request an immediate scan. The
/// trigger coalesces with the scheduler's next tick.
pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    auth: Auth,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_MANAGE)?;
    state.mirror.trigger_now();
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default = "default_pattern")]
    pub namespace_pattern: String,
    #[serde(default = "default_pattern")]
    pub provider_pattern: String,
    pub action: String,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub organization_id: Option<String>,
}

fn default_pattern() -> String {
    "*".to_string()
}

pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreatePolicyRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_MANAGE)?;
    if request.action != "allow" && request.action != "deny" {
        return Err(RegistryError::BadRequest(
            "action must be allow or deny".to_string(),
        ));
    }
    let organization_id = request
        .organization_id
        .or_else(|| auth.0.organization_id.clone())
        .ok_or_else(|| RegistryError::BadRequest("organization_id is required".to_string()))?;

    let repo = MirrorRepository::new(state.pool.clone());
    let policy = repo
        .create_policy(NewMirrorPolicy {
            organization_id,
            upstream_url: request.upstream_url,
            namespace_pattern: request.namespace_pattern,
            provider_pattern: request.provider_pattern,
            action: request.action,
            requires_approval: request.requires_approval,
            priority: request.priority,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": policy.id, "action": policy.action, "priority": policy.priority })),
    ))
}

pub async fn delete_policy(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_MANAGE)?;
    let repo = MirrorRepository::new(state.pool.clone());
    if repo.delete_policy(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("mirror policy".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ApprovalListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "super::default_limit")]
    pub limit: i64,
}

pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(query): Query<ApprovalListQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_READ)?;
    let repo = MirrorRepository::new(state.pool.clone());
    let page = PageQuery {
        offset: query.offset,
        limit: query.limit,
    };
    let (requests, total) = repo
        .list_approval_requests(query.status.as_deref(), page.into())
        .await?;
    Ok(Json(json!({
        "total": total,
        "results": requests
            .iter()
            .map(|r| json!({
                "id": r.id,
                "mirror_configuration_id": r.mirror_configuration_id,
                "namespace": r.namespace,
                "provider_type": r.provider_type,
                "status": r.status,
                "requested_by": r.requested_by,
                "reviewed_by": r.reviewed_by,
                "notes": r.notes,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    /// `approved` or `rejected`.
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn review_approval(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
    Json(request): Json<ReviewRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MIRRORS_MANAGE)?;
    if request.status != "approved" && request.status != "rejected" {
        return Err(RegistryError::BadRequest(
            "status must be approved or rejected".to_string(),
        ));
    }
    let repo = MirrorRepository::new(state.pool.clone());
    let updated = repo
        .review_approval_request(
            &id,
            &request.status,
            &auth.0.principal_id,
            request.notes.as_deref(),
        )
        .await?;
    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::Conflict(
            "approval request is not pending".to_string(),
        ))
    }
}
