//! Module registry protocol: versions listing and redirect-based download.

use axum::extract::{Path, State};
use axum::http::{header::HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::db::modules::ModuleRepository;
use crate::error::{RegistryError, Result};
use crate::observability::metrics;
use crate::storage::{with_retries, DEFAULT_SIGNED_URL_VALIDITY};

use super::AppState;

static TERRAFORM_GET: HeaderName = HeaderName::from_static("x-terraform-get");

/// `GET /v1/modules/{namespace}/{name}/{system}/versions`
///
/// Versions are emitted in descending semantic order. Deprecated versions
/// are included with no protocol-level marker; the UI surfaces deprecation
/// separately.
#[instrument(skip(state))]
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path((namespace, name, system)): Path<(String, String, String)>,
) -> Result<impl IntoResponse> {
    let modules = ModuleRepository::new(state.pool.clone());
    let module = modules
        .find(&namespace, &name, &system)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("module {namespace}/{name}/{system}")))?;

    let mut versions = modules.list_versions(&module.id).await?;
    versions.sort_by(|a, b| {
        let left = semver::Version::parse(&a.version);
        let right = semver::Version::parse(&b.version);
        match (left, right) {
            (Ok(l), Ok(r)) => r.cmp(&l),
            _ => b.version.cmp(&a.version),
        }
    });

    let body = json!({
        "modules": [{
            "versions": versions
                .iter()
                .map(|v| json!({ "version": v.version }))
                .collect::<Vec<_>>(),
        }],
    });
    Ok(Json(body))
}

/// `GET /v1/modules/{namespace}/{name}/{system}/{version}/download`
///
/// Returns 204 with `X-Terraform-Get` pointing at either a signed remote
/// URL or this process's own `/v1/files/` path. The download counter is
/// incremented in a detached task; under-counting on crash is accepted.
#[instrument(skip(state))]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((namespace, name, system, version)): Path<(String, String, String, String)>,
) -> Result<impl IntoResponse> {
    let modules = ModuleRepository::new(state.pool.clone());
    let module = modules
        .find(&namespace, &name, &system)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("module {namespace}/{name}/{system}")))?;
    let row = modules
        .find_version(&module.id, &version)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("version {version}")))?;

    let url = with_retries(|| {
        state
            .storage
            .signed_url(&row.storage_path, DEFAULT_SIGNED_URL_VALIDITY)
    })
    .await?;
    let url = if url.starts_with('/') {
        state.config.absolute_url(&url)
    } else {
        url
    };

    metrics::increment_module_downloads();
    let repo = modules.clone();
    let version_id = row.id.clone();
    tokio::spawn(async move {
        if let Err(error) = repo.increment_download(&version_id).await {
            debug!(%error, "failed to increment module download counter");
        }
    });

    Ok((StatusCode::NO_CONTENT, [(TERRAFORM_GET.clone(), url)]))
}
