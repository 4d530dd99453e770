//! Administrative CRUD under `/api/v1/admin/...`, scoped per area.

use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

use crate::db::Page;

use super::AppState;

pub mod api_keys;
pub mod mirrors;
pub mod modules;
pub mod orgs;
pub mod scm;
pub mod storage;

/// Query-string pagination shared by every listing endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

impl From<PageQuery> for Page {
    fn from(query: PageQuery) -> Self {
        Page::new(query.offset, query.limit)
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Organizations, users, role templates
        .route(
            "/api/v1/admin/organizations",
            get(orgs::list_organizations).post(orgs::create_organization),
        )
        .route(
            "/api/v1/admin/organizations/{id}",
            delete(orgs::delete_organization),
        )
        .route("/api/v1/admin/users", get(orgs::list_users).post(orgs::create_user))
        .route("/api/v1/admin/users/{id}", delete(orgs::delete_user))
        .route("/api/v1/admin/role-templates", post(orgs::create_role_template))
        .route("/api/v1/admin/members", post(orgs::add_member))
        // API keys
        .route(
            "/api/v1/admin/api-keys",
            get(api_keys::list).post(api_keys::create),
        )
        .route("/api/v1/admin/api-keys/{id}", delete(api_keys::revoke))
        // Modules management (search lives next to the upload route in the
        // uploads router)
        .route(
            "/api/v1/admin/modules/{id}",
            delete(modules::delete),
        )
        .route(
            "/api/v1/admin/modules/{id}/versions/{version}/deprecation",
            put(modules::set_deprecation),
        )
        // SCM providers and links
        .route(
            "/api/v1/admin/scm-providers",
            get(scm::list_providers).post(scm::create_provider),
        )
        .route("/api/v1/admin/scm-providers/{id}", delete(scm::delete_provider))
        .route("/api/v1/admin/scm-links", post(scm::create_link))
        .route("/api/v1/admin/scm-links/{id}", delete(scm::delete_link))
        .route("/api/v1/admin/scm-links/{id}/sync", post(scm::manual_sync))
        .route("/api/v1/admin/scm-links/{id}/events", get(scm::list_events))
        // Mirrors
        .route(
            "/api/v1/admin/mirrors",
            get(mirrors::list_configurations).post(mirrors::create_configuration),
        )
        .route(
            "/api/v1/admin/mirrors/{id}",
            delete(mirrors::delete_configuration),
        )
        .route("/api/v1/admin/mirrors/sync", post(mirrors::trigger_sync))
        .route(
            "/api/v1/admin/mirror-policies",
            post(mirrors::create_policy),
        )
        .route(
            "/api/v1/admin/mirror-policies/{id}",
            delete(mirrors::delete_policy),
        )
        .route(
            "/api/v1/admin/mirror-approvals",
            get(mirrors::list_approvals),
        )
        .route(
            "/api/v1/admin/mirror-approvals/{id}/review",
            post(mirrors::review_approval),
        )
        // Storage configuration
        .route(
            "/api/v1/admin/storage",
            get(storage::get_active).put(storage::set_active),
        )
}
