//! # HTTP API
//!
//! Router assembly for everything the process serves:
//!
//! - the three public registry protocols ([`modules`], [`providers`],
//!   [`mirror`]) plus direct artifact serving ([`files`])
//! - the authenticated management surface ([`upload`], [`admin`])
//! - the SCM webhook receiver ([`webhooks`])
//! - discovery, health and metrics ([`discovery`])
//!
//! Handler deadlines: 60 s on protocol reads, 10 min on uploads, 30 s
//! elsewhere.

use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthContext, Authenticator};
use crate::config::AppConfig;
use crate::crypto::Cipher;
use crate::error::RegistryError;
use crate::ingest::Ingestor;
use crate::mirror::MirrorHandle;
use crate::publish::{ConnectorFactory, Publisher, PublishQueue};
use crate::storage::StorageBackend;

pub mod admin;
pub mod discovery;
pub mod files;
pub mod mirror;
pub mod modules;
pub mod providers;
pub mod upload;
pub mod webhooks;

/// Body cap on multipart uploads: the 500 MiB provider limit plus form
/// overhead. Fine-grained size discipline lives in the ingestion pipeline.
const UPLOAD_BODY_LIMIT: usize = 520 * 1024 * 1024;

/// Everything handlers need, injected once at boot.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: SqlitePool,
    pub storage: Arc<dyn StorageBackend>,
    pub cipher: Arc<Cipher>,
    pub auth: Arc<Authenticator>,
    pub ingestor: Arc<Ingestor>,
    pub publisher: Arc<Publisher>,
    pub publish_queue: PublishQueue,
    pub mirror: MirrorHandle,
    pub connectors: Arc<dyn ConnectorFactory>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Extractor binding the resolved credential to the request. Rejects with
/// `unauthorized` when no credential is present; scope checks happen in the
/// handler via [`AuthContext::require`].
#[derive(Debug, Clone)]
pub struct Auth(pub AuthContext);

impl FromRequestParts<Arc<AppState>> for Auth {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        state
            .auth
            .authenticate(header)
            .await?
            .map(Auth)
            .ok_or(RegistryError::Unauthorized)
    }
}

/// Assemble the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let protocol = Router::new()
        .route("/.well-known/terraform.json", get(discovery::service_discovery))
        .route(
            "/v1/modules/{namespace}/{name}/{system}/versions",
            get(modules::list_versions),
        )
        .route(
            "/v1/modules/{namespace}/{name}/{system}/{version}/download",
            get(modules::download),
        )
        .route(
            "/v1/providers/{namespace}/{provider_type}/versions",
            get(providers::list_versions),
        )
        .route(
            "/v1/providers/{namespace}/{provider_type}/{version}/download/{os}/{arch}",
            get(providers::download),
        )
        .route(
            "/terraform/providers/{host}/{namespace}/{provider_type}/{document}",
            get(mirror::document),
        )
        .route("/v1/files/{*path}", get(files::serve))
        .layer(TimeoutLayer::new(Duration::from_secs(60)));

    let uploads = Router::new()
        // GET here is the search listing; it shares the path with the
        // multipart upload so the two verbs stay on one method router.
        .route(
            "/api/v1/modules",
            post(upload::upload_module).get(admin::modules::search),
        )
        .route("/api/v1/providers", post(upload::upload_provider))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .layer(TimeoutLayer::new(Duration::from_secs(600)));

    let management = Router::new()
        .route("/health", get(discovery::health))
        .route("/healthz", get(discovery::health))
        .route("/metrics", get(discovery::metrics))
        .route("/api/v1/auth/dev-token", post(discovery::dev_token))
        .route(
            "/webhooks/scm/{link_id}/{webhook_secret}",
            post(webhooks::receive),
        )
        .merge(admin::router())
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    Router::new()
        .merge(protocol)
        .merge(uploads)
        .merge(management)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
