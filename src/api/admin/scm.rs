//! SCM provider and module-link administration, manual sync, event log.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::{AppState, Auth};
use crate::auth::scopes;
use crate::db::scm::{NewScmProvider, ScmRepository};
use crate::error::{RegistryError, Result};
use crate::publish::PublishOutcome;
use crate::scm::ScmKind;

use super::PageQuery;

#[derive(Debug, Deserialize)]
pub struct CreateScmProviderRequest {
    pub display_name: String,
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateScmProviderRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_MANAGE)?;
    let kind = ScmKind::parse(&request.kind)
        .ok_or_else(|| RegistryError::BadRequest(format!("unknown scm kind {}", request.kind)))?;
    if kind == ScmKind::BitbucketDataCenter && request.base_url.is_none() {
        return Err(RegistryError::BadRequest(
            "bitbucket-datacenter requires base_url".to_string(),
        ));
    }
    let organization_id = request
        .organization_id
        .or_else(|| auth.0.organization_id.clone())
        .ok_or_else(|| RegistryError::BadRequest("organization_id is required".to_string()))?;

    // Credentials are sealed before they touch the metadata store.
    let seal = |value: Option<String>| -> Result<Option<String>> {
        value
            .map(|v| state.cipher.seal_str(&v))
            .transpose()
            .map_err(|e| RegistryError::Internal(e.into()))
    };

    let repo = ScmRepository::new(state.pool.clone());
    let provider = repo
        .create_provider(NewScmProvider {
            organization_id,
            display_name: request.display_name,
            kind: kind.as_str().to_string(),
            base_url: request.base_url,
            client_id_sealed: seal(request.client_id)?,
            client_secret_sealed: seal(request.client_secret)?,
            webhook_secret_sealed: seal(request.webhook_secret)?,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": provider.id, "kind": provider.kind, "display_name": provider.display_name })),
    ))
}

pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_READ)?;
    let organization_id = auth
        .0
        .organization_id
        .clone()
        .ok_or_else(|| RegistryError::BadRequest("credential has no organization".to_string()))?;
    let repo = ScmRepository::new(state.pool.clone());
    let (providers, total) = repo.list_providers(&organization_id, page.into()).await?;
    Ok(Json(json!({
        "total": total,
        "results": providers
            .iter()
            .map(|p| json!({
                "id": p.id,
                "display_name": p.display_name,
                "kind": p.kind,
                "base_url": p.base_url,
                "active": p.active,
            }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_MANAGE)?;
    let repo = ScmRepository::new(state.pool.clone());
    if repo.delete_provider(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("scm provider".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub module_id: String,
    pub scm_provider_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub repository: String,
    #[serde(default = "default_tag_filter")]
    pub tag_filter: String,
    pub webhook_secret: String,
}

fn default_tag_filter() -> String {
    "v*".to_string()
}

pub async fn create_link(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateLinkRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_MANAGE)?;
    let repo = ScmRepository::new(state.pool.clone());
    let link = repo
        .create_link(
            &request.module_id,
            &request.scm_provider_id,
            request.user_id.as_deref(),
            &request.repository,
            &request.tag_filter,
            &request.webhook_secret,
        )
        .await
        .map_err(|e| {
            if crate::db::is_unique_violation(&e) {
                RegistryError::Conflict("module is already linked".to_string())
            } else {
                e.into()
            }
        })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": link.id,
            "repository": link.repository,
            "tag_filter": link.tag_filter,
            "webhook_url": state
                .config
                .absolute_url(&format!("/webhooks/scm/{}/{}", link.id, link.webhook_secret)),
        })),
    ))
}

pub async fn delete_link(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_MANAGE)?;
    let repo = ScmRepository::new(state.pool.clone());
    if repo.delete_link(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("scm link".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ManualSyncRequest {
    pub tag: String,
}

/// `POST /api/v1/admin/scm-links/{id}/sync` - publish one tag now, through
/// the same procedure webhook deliveries take.
pub async fn manual_sync(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
    Json(request): Json<ManualSyncRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_MANAGE)?;
    let outcome = state.publisher.publish_tag(&id, &request.tag).await?;
    let body = match outcome {
        PublishOutcome::Published(version) => json!({
            "outcome": "published",
            "version": version.version,
            "commit_sha": version.commit_sha,
        }),
        PublishOutcome::AlreadyCurrent => json!({ "outcome": "noop" }),
    };
    Ok(Json(body))
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::SCM_READ)?;
    let repo = ScmRepository::new(state.pool.clone());
    let (events, total) = repo.list_webhook_events(&id, page.into()).await?;
    Ok(Json(json!({
        "total": total,
        "results": events
            .iter()
            .map(|e| json!({
                "id": e.id,
                "delivery_id": e.delivery_id,
                "signature_valid": e.signature_valid,
                "event_kind": e.event_kind,
                "outcome": e.outcome,
                "created_at": e.created_at,
            }))
            .collect::<Vec<_>>(),
    })))
}
