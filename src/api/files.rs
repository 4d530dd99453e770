//! Direct artifact streaming for the local backend in serve-directly mode.
//! Signed URLs issued by that backend resolve to `/v1/files/{storage key}`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::instrument;

use crate::error::{RegistryError, Result};
use crate::storage::with_retries;

use super::AppState;

/// `GET /v1/files/{*path}`
#[instrument(skip(state))]
pub async fn serve(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.storage.supports_direct_serve() {
        return Err(RegistryError::NotFound("file".to_string()));
    }
    let reader = with_retries(|| state.storage.download(&path)).await?;
    let stream = ReaderStream::new(reader);
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    ))
}
