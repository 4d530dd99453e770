//! Service discovery, health, metrics and the dev-mode token endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::error::{RegistryError, Result};
use crate::observability::metrics as registry_metrics;

use super::AppState;

/// `GET /.well-known/terraform.json` - the protocol prefixes this host
/// implements.
pub async fn service_discovery() -> impl IntoResponse {
    Json(json!({
        "modules.v1": "/v1/modules/",
        "providers.v1": "/v1/providers/",
    }))
}

/// `GET /health` - liveness plus a database ping.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    crate::db::ping(&state.pool)
        .await
        .map_err(RegistryError::Internal)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// `GET /metrics` - Prometheus text format.
pub async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry_metrics::gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

#[derive(Debug, Deserialize)]
pub struct DevTokenRequest {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// `POST /api/v1/auth/dev-token` - impersonation for local development.
/// Disabled unless `auth.dev_mode` is set.
pub async fn dev_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DevTokenRequest>,
) -> Result<impl IntoResponse> {
    if !state.config.auth.dev_mode {
        return Err(RegistryError::NotFound("endpoint".to_string()));
    }
    let token = state
        .auth
        .jwt()
        .issue(
            &request.sub,
            request.email.as_deref(),
            request.org.as_deref(),
            request.scopes,
        )
        .map_err(RegistryError::Internal)?;
    Ok(Json(json!({ "token": token })))
}
