//! Provider registry protocol: versions listing and the download document.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::db::providers::ProviderRepository;
use crate::error::{RegistryError, Result};
use crate::observability::metrics;
use crate::storage::{with_retries, DEFAULT_SIGNED_URL_VALIDITY};

use super::AppState;

/// `GET /v1/providers/{namespace}/{type}/versions`
///
/// Each element carries `version`, `protocols` and the `{os, arch}` pairs;
/// no URLs. Clients pair the answer with a download call.
#[instrument(skip(state))]
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path((namespace, provider_type)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let providers = ProviderRepository::new(state.pool.clone());
    let provider = providers
        .find(&namespace, &provider_type)
        .await?
        .ok_or_else(|| {
            RegistryError::NotFound(format!("provider {namespace}/{provider_type}"))
        })?;

    let mut entries = Vec::new();
    for version in providers.list_versions(&provider.id).await? {
        let platforms = providers.list_platforms(&version.id).await?;
        entries.push(json!({
            "version": version.version,
            "protocols": version.protocol_list(),
            "platforms": platforms
                .iter()
                .map(|p| json!({ "os": p.os, "arch": p.arch }))
                .collect::<Vec<_>>(),
        }));
    }

    entries.sort_by(|a, b| {
        let parse = |v: &serde_json::Value| {
            v.get("version")
                .and_then(|s| s.as_str())
                .and_then(|s| semver::Version::parse(s).ok())
        };
        match (parse(a), parse(b)) {
            (Some(l), Some(r)) => r.cmp(&l),
            _ => std::cmp::Ordering::Equal,
        }
    });

    Ok(Json(json!({ "versions": entries })))
}

/// `GET /v1/providers/{namespace}/{type}/{version}/download/{os}/{arch}`
#[instrument(skip(state))]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((namespace, provider_type, version, os, arch)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Result<impl IntoResponse> {
    let providers = ProviderRepository::new(state.pool.clone());
    let provider = providers
        .find(&namespace, &provider_type)
        .await?
        .ok_or_else(|| {
            RegistryError::NotFound(format!("provider {namespace}/{provider_type}"))
        })?;
    let version_row = providers
        .find_version(&provider.id, &version)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("version {version}")))?;
    let platform = providers
        .find_platform(&version_row.id, &os, &arch)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("platform {os}/{arch}")))?;

    let download_url = with_retries(|| {
        state
            .storage
            .signed_url(&platform.storage_path, DEFAULT_SIGNED_URL_VALIDITY)
    })
    .await?;
    let download_url = if download_url.starts_with('/') {
        state.config.absolute_url(&download_url)
    } else {
        download_url
    };

    let signing_keys = match (&version_row.gpg_public_key, &version_row.gpg_key_id) {
        (Some(armor), key_id) => json!({
            "gpg_public_keys": [{
                "key_id": key_id.clone().unwrap_or_default(),
                "ascii_armor": armor,
            }],
        }),
        (None, _) => json!({ "gpg_public_keys": [] }),
    };

    metrics::increment_provider_downloads();
    let repo = providers.clone();
    let platform_id = platform.id.clone();
    tokio::spawn(async move {
        if let Err(error) = repo.increment_platform_download(&platform_id).await {
            debug!(%error, "failed to increment provider download counter");
        }
    });

    Ok(Json(json!({
        "protocols": version_row.protocol_list(),
        "os": platform.os,
        "arch": platform.arch,
        "filename": platform.filename,
        "download_url": download_url,
        "shasums_url": version_row.shasums_url.clone().unwrap_or_default(),
        "shasums_signature_url": version_row.shasums_signature_url.clone().unwrap_or_default(),
        "shasum": platform.shasum,
        "signing_keys": signing_keys,
    })))
}
