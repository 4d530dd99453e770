//! Provider network mirror protocol. Deliberately read-only and
//! unauthenticated; paths live under
//! `/terraform/providers/{hostname}/{namespace}/{type}/...`.
//!
//! The hostname segment identifies the origin registry from the client's
//! point of view; the index aggregates every version this registry holds
//! for the provider, whether uploaded or mirrored.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::instrument;

use crate::db::providers::ProviderRepository;
use crate::error::{RegistryError, Result};
use crate::storage::{with_retries, DEFAULT_SIGNED_URL_VALIDITY};

use super::AppState;

/// `GET /terraform/providers/{host}/{namespace}/{type}/{document}` where
/// `document` is `index.json` or `{version}.json`.
#[instrument(skip(state))]
pub async fn document(
    State(state): State<Arc<AppState>>,
    Path((_host, namespace, provider_type, document)): Path<(String, String, String, String)>,
) -> Result<impl IntoResponse> {
    let Some(stem) = document.strip_suffix(".json") else {
        return Err(RegistryError::NotFound(format!("document {document}")));
    };
    if stem == "index" {
        index(&state, &namespace, &provider_type).await
    } else {
        platform_index(&state, &namespace, &provider_type, stem).await
    }
}

/// `index.json`: every known version, uploaded or mirrored.
async fn index(
    state: &Arc<AppState>,
    namespace: &str,
    provider_type: &str,
) -> Result<Json<Value>> {
    let providers = ProviderRepository::new(state.pool.clone());
    let provider = providers
        .find(namespace, provider_type)
        .await?
        .ok_or_else(|| {
            RegistryError::NotFound(format!("provider {namespace}/{provider_type}"))
        })?;

    let mut versions = Map::new();
    for version in providers.list_versions(&provider.id).await? {
        versions.insert(version.version, json!({}));
    }
    Ok(Json(json!({ "versions": versions })))
}

/// `{version}.json`: per-platform archives with signed URLs.
async fn platform_index(
    state: &Arc<AppState>,
    namespace: &str,
    provider_type: &str,
    version: &str,
) -> Result<Json<Value>> {
    let providers = ProviderRepository::new(state.pool.clone());
    let provider = providers
        .find(namespace, provider_type)
        .await?
        .ok_or_else(|| {
            RegistryError::NotFound(format!("provider {namespace}/{provider_type}"))
        })?;
    let version_row = providers
        .find_version(&provider.id, version)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("version {version}")))?;

    let mut archives = Map::new();
    for platform in providers.list_platforms(&version_row.id).await? {
        let url = with_retries(|| {
            state
                .storage
                .signed_url(&platform.storage_path, DEFAULT_SIGNED_URL_VALIDITY)
        })
        .await?;
        let url = if url.starts_with('/') {
            state.config.absolute_url(&url)
        } else {
            url
        };
        archives.insert(
            format!("{}_{}", platform.os, platform.arch),
            json!({
                "url": url,
                "hashes": [format!("sha256:{}", platform.shasum)],
            }),
        );
    }
    Ok(Json(json!({ "archives": archives })))
}
