//! # Error Taxonomy
//!
//! Closed set of error classes surfaced by the registry. Every boundary
//! contract returns a typed outcome value; the HTTP layer maps each class to
//! a status code and a uniform `{"error": "<message>"}` body.
//!
//! Component-internal helpers bubble `anyhow::Error`; anything that reaches
//! the boundary uncaught becomes `internal` (500) and is logged with full
//! context rather than leaked to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// Result alias used by handlers and services.
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Error classes exposed by the registry, one HTTP status each.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Missing form field, malformed semver, undecodable payload.
    #[error("{0}")]
    BadRequest(String),

    /// Credential absent.
    #[error("unauthorized")]
    Unauthorized,

    /// Credential present but scope insufficient.
    #[error("forbidden: missing scope {0}")]
    Forbidden(String),

    /// Unknown module, version, provider, or other entity.
    #[error("{0} not found")]
    NotFound(String),

    /// A (module, version) pair already exists.
    #[error("version_exists")]
    VersionExists,

    /// A (module, version) pair exists against a different commit.
    #[error("version_exists_differs")]
    VersionExistsDiffers,

    /// Any other uniqueness or state conflict.
    #[error("{0}")]
    Conflict(String),

    /// Path traversal, oversize archive, symlink escape.
    #[error("{0}")]
    UnsafePayload(String),

    /// Request quota exhausted.
    #[error("rate_limited")]
    RateLimited,

    /// SCM, upstream registry, or storage backend transient failure.
    #[error("upstream_unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Anything uncaught.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl RegistryError {
    /// HTTP status for this class.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::VersionExists | Self::VersionExistsDiffers | Self::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Self::UnsafePayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal causes are logged, never surfaced.
        let message = if let Self::Internal(ref cause) = self {
            error!(error = ?cause, "internal error");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err).context("database error"))
    }
}
