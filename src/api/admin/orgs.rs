//! Organization, user and role-template administration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::{AppState, Auth};
use crate::auth::scopes;
use crate::db::orgs::OrgRepository;
use crate::error::{RegistryError, Result};

use super::PageQuery;

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub slug: String,
    pub display_name: String,
}

pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateOrganizationRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ORGANIZATIONS_WRITE)?;
    let repo = OrgRepository::new(state.pool.clone());
    let org = repo
        .create_organization(&request.slug, &request.display_name)
        .await
        .map_err(|e| {
            if crate::db::is_unique_violation(&e) {
                RegistryError::Conflict(format!("organization {} already exists", request.slug))
            } else {
                e.into()
            }
        })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": org.id, "slug": org.slug, "display_name": org.display_name })),
    ))
}

pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ORGANIZATIONS_READ)?;
    let repo = OrgRepository::new(state.pool.clone());
    let (orgs, total) = repo.list_organizations(page.into()).await?;
    Ok(Json(json!({
        "total": total,
        "results": orgs
            .iter()
            .map(|o| json!({ "id": o.id, "slug": o.slug, "display_name": o.display_name }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn delete_organization(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ORGANIZATIONS_WRITE)?;
    let repo = OrgRepository::new(state.pool.clone());
    if repo.delete_organization(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("organization".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub external_subject: Option<String>,
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateUserRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::USERS_WRITE)?;
    let repo = OrgRepository::new(state.pool.clone());
    let user = repo
        .create_user(
            &request.email,
            &request.display_name,
            request.external_subject.as_deref(),
        )
        .await
        .map_err(|e| {
            if crate::db::is_unique_violation(&e) {
                RegistryError::Conflict(format!("user {} already exists", request.email))
            } else {
                e.into()
            }
        })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": user.id, "email": user.email })),
    ))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::USERS_READ)?;
    let repo = OrgRepository::new(state.pool.clone());
    let (users, total) = repo.list_users(page.into()).await?;
    Ok(Json(json!({
        "total": total,
        "results": users
            .iter()
            .map(|u| json!({ "id": u.id, "email": u.email, "display_name": u.display_name }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::USERS_WRITE)?;
    let repo = OrgRepository::new(state.pool.clone());
    if repo.delete_user(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::NotFound("user".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleTemplateRequest {
    #[serde(default)]
    pub organization_id: Option<String>,
    pub name: String,
    pub scopes: Vec<String>,
}

pub async fn create_role_template(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<CreateRoleTemplateRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ORGANIZATIONS_WRITE)?;
    // System-defined templates are seeded at boot, never via the API.
    let repo = OrgRepository::new(state.pool.clone());
    let template = repo
        .create_role_template(
            request.organization_id.as_deref(),
            &request.name,
            &request.scopes,
            false,
        )
        .await
        .map_err(|e| {
            if crate::db::is_unique_violation(&e) {
                RegistryError::Conflict(format!("role template {} already exists", request.name))
            } else {
                e.into()
            }
        })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": template.id, "name": template.name })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub organization_id: String,
    pub user_id: String,
    pub role_template_id: String,
}

pub async fn add_member(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    Json(request): Json<AddMemberRequest>,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::ORGANIZATIONS_WRITE)?;
    let repo = OrgRepository::new(state.pool.clone());
    repo.add_member(
        &request.organization_id,
        &request.user_id,
        &request.role_template_id,
    )
    .await
    .map_err(|e| {
        if crate::db::is_unique_violation(&e) {
            RegistryError::Conflict("user is already a member".to_string())
        } else {
            e.into()
        }
    })?;
    Ok(StatusCode::CREATED)
}
