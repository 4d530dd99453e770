//! Authenticated multipart uploads for modules and providers.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::auth::scopes;
use crate::error::{RegistryError, Result};
use crate::ingest::{ModuleUpload, ProviderUpload};

use super::{AppState, Auth};

/// Collected multipart form: text fields plus at most one file part.
struct UploadForm {
    fields: HashMap<String, String>,
    file: Option<(Option<String>, Bytes)>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut fields = HashMap::new();
        let mut file = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let filename = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
                file = Some((filename, data));
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
                fields.insert(name, value);
            }
        }
        Ok(Self { fields, file })
    }

    fn require(&self, name: &str) -> Result<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RegistryError::BadRequest(format!("missing form field {name}")))
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.fields.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn require_file(self) -> Result<(Option<String>, Bytes)> {
        self.file
            .ok_or_else(|| RegistryError::BadRequest("missing form field file".to_string()))
    }
}

/// `POST /api/v1/modules` - multipart module upload. Requires
/// `modules:write`.
#[instrument(skip(state, auth, multipart))]
pub async fn upload_module(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::MODULES_WRITE)?;

    let form = UploadForm::read(multipart).await?;
    let upload = ModuleUpload {
        namespace: form.require("namespace")?.to_string(),
        name: form.require("name")?.to_string(),
        system: form.require("system")?.to_string(),
        version: form.require("version")?.to_string(),
        description: form.optional("description"),
        published_by: Some(auth.0.principal_id.clone()),
        commit_sha: None,
        organization_id: auth.0.organization_id.clone(),
        data: form.require_file()?.1,
    };

    let version = state.ingestor.ingest_module(upload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": version.id,
            "version": version.version,
            "checksum": version.checksum,
            "size_bytes": version.size_bytes,
        })),
    ))
}

/// `POST /api/v1/providers` - multipart provider platform upload. Requires
/// `providers:write`.
#[instrument(skip(state, auth, multipart))]
pub async fn upload_provider(
    State(state): State<Arc<AppState>>,
    auth: Auth,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    auth.0.require(scopes::PROVIDERS_WRITE)?;

    let form = UploadForm::read(multipart).await?;
    let protocols = form
        .optional("protocols")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|| vec!["5.0".to_string()]);

    let namespace = form.require("namespace")?.to_string();
    let provider_type = form.require("type")?.to_string();
    let version = form.require("version")?.to_string();
    let os = form.require("os")?.to_string();
    let arch = form.require("arch")?.to_string();
    let gpg_public_key = form.optional("gpg_public_key");
    let gpg_key_id = form.optional("gpg_key_id");
    let organization_id = auth.0.organization_id.clone();
    let principal = auth.0.principal_id.clone();

    let (filename, data) = form.require_file()?;
    let filename = filename.ok_or_else(|| {
        RegistryError::BadRequest("file part must carry the archive filename".to_string())
    })?;

    let platform = state
        .ingestor
        .ingest_provider(ProviderUpload {
            namespace,
            provider_type,
            version,
            os,
            arch,
            filename,
            protocols,
            gpg_public_key,
            gpg_key_id,
            shasums_url: None,
            shasums_signature_url: None,
            published_by: Some(principal),
            organization_id,
            mirror_configuration_id: None,
            data,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": platform.id,
            "os": platform.os,
            "arch": platform.arch,
            "filename": platform.filename,
            "shasum": platform.shasum,
        })),
    ))
}
