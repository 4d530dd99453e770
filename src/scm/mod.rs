//! # SCM Connector Set
//!
//! Per-provider abstraction over OAuth/PAT flows, repository listing,
//! tag-to-commit resolution, archive fetch and webhook signature
//! verification. Four variants:
//!
//! - [`github`] - github.com and GitHub Enterprise
//! - [`gitlab`] - gitlab.com and self-managed GitLab
//! - [`azure_devops`] - Azure DevOps Services
//! - [`bitbucket`] - Bitbucket Data Center (PAT-based; no OAuth endpoints)
//!
//! Connectors are constructed by [`build_connector`] from the persisted SCM
//! provider record with credentials already decrypted. Every HTTP call
//! carries a 30 second deadline.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub mod azure_devops;
pub mod bitbucket;
pub mod github;
pub mod gitlab;

/// Deadline applied to every outbound SCM request.
pub const SCM_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector kind discriminator, matching the persisted `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmKind {
    GitHub,
    GitLab,
    AzureDevOps,
    BitbucketDataCenter,
}

impl ScmKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "github" => Some(Self::GitHub),
            "gitlab" => Some(Self::GitLab),
            "azure-devops" => Some(Self::AzureDevOps),
            "bitbucket-datacenter" => Some(Self::BitbucketDataCenter),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::AzureDevOps => "azure-devops",
            Self::BitbucketDataCenter => "bitbucket-datacenter",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    /// PAT connectors have nothing to refresh.
    #[error("refresh_unsupported")]
    RefreshUnsupported,
    #[error("scm credentials rejected")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("scm api error: {0}")]
    Api(String),
    #[error("scm request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<ScmError> for crate::error::RegistryError {
    fn from(err: ScmError) -> Self {
        match err {
            ScmError::NotFound(what) => Self::NotFound(what),
            ScmError::Unauthorized => Self::Internal(anyhow::anyhow!("scm credentials rejected")),
            ScmError::Http(e) => Self::UpstreamUnavailable(e.to_string()),
            ScmError::Api(msg) => Self::UpstreamUnavailable(msg),
            ScmError::RefreshUnsupported => {
                Self::BadRequest("refresh_unsupported".to_string())
            }
        }
    }
}

/// Result of completing or renewing an authorization.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RepoSummary {
    /// Connector-native repository identifier (e.g. `owner/name`).
    pub id: String,
    pub name: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TagInfo {
    pub tag: String,
    pub commit_sha: String,
}

/// Outcome of webhook verification. `ok == false` means the delivery is
/// unsigned or mis-signed and must produce zero side effects.
#[derive(Debug, Clone, Default)]
pub struct WebhookVerification {
    pub ok: bool,
    pub event_kind: Option<String>,
    pub delivery_id: Option<String>,
    /// Tag name for tag-push events, already stripped of `refs/tags/`.
    pub tag: Option<String>,
}

impl WebhookVerification {
    #[must_use]
    pub fn rejected() -> Self {
        Self::default()
    }
}

/// Operation vocabulary shared by the four connector variants.
#[async_trait]
pub trait ScmConnector: Send + Sync {
    fn kind(&self) -> ScmKind;

    /// PAT connectors cannot renew tokens.
    fn supports_refresh_token(&self) -> bool;

    /// OAuth authorization URL; `None` for PAT connectors.
    fn authorization_endpoint(&self, state: &str, requested_scopes: &[String]) -> Option<String>;

    async fn complete_authorization(&self, code: &str) -> Result<TokenGrant, ScmError>;

    async fn renew_token(&self, refresh_token: &str) -> Result<TokenGrant, ScmError>;

    async fn list_repositories(
        &self,
        token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RepoSummary>, bool), ScmError>;

    async fn list_tags(
        &self,
        token: &str,
        repo: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<TagInfo>, ScmError>;

    async fn resolve_tag_to_commit(
        &self,
        token: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, ScmError>;

    /// Fetch the repository at a commit as a gzipped tarball, root-prefixed
    /// neutrally (one uniform top-level directory).
    async fn fetch_archive(
        &self,
        token: &str,
        repo: &str,
        commit_sha: &str,
    ) -> Result<Bytes, ScmError>;

    /// Verify an inbound webhook delivery. Never partially trusts: any
    /// missing or mismatched signature yields a rejected verification.
    fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        shared_secret: &str,
    ) -> WebhookVerification;
}

/// Construct the connector for a persisted SCM provider record.
/// Credentials arrive already decrypted by the Cipher.
pub fn build_connector(
    kind: ScmKind,
    base_url: Option<&str>,
    client_id: Option<String>,
    client_secret: Option<String>,
) -> anyhow::Result<Arc<dyn ScmConnector>> {
    let connector: Arc<dyn ScmConnector> = match kind {
        ScmKind::GitHub => Arc::new(github::GitHubConnector::new(
            base_url,
            client_id,
            client_secret,
        )),
        ScmKind::GitLab => Arc::new(gitlab::GitLabConnector::new(
            base_url,
            client_id,
            client_secret,
        )),
        ScmKind::AzureDevOps => Arc::new(azure_devops::AzureDevOpsConnector::new(
            base_url,
            client_id,
            client_secret,
        )),
        ScmKind::BitbucketDataCenter => {
            let base = base_url
                .ok_or_else(|| anyhow::anyhow!("bitbucket-datacenter requires a base_url"))?;
            Arc::new(bitbucket::BitbucketConnector::new(base))
        }
    };
    Ok(connector)
}

/// Shared HTTP client with the SCM deadline applied.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(SCM_REQUEST_TIMEOUT)
        .user_agent(concat!("terraform-registry/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("reqwest client construction cannot fail with static options")
}

/// Constant-time equality for webhook secrets and signatures.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// HMAC-SHA256 over a webhook body, hex-encoded.
pub(crate) fn hmac_sha256_hex(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ScmKind::GitHub,
            ScmKind::GitLab,
            ScmKind::AzureDevOps,
            ScmKind::BitbucketDataCenter,
        ] {
            assert_eq!(ScmKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ScmKind::parse("svn"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_bitbucket_requires_base_url() {
        assert!(build_connector(ScmKind::BitbucketDataCenter, None, None, None).is_err());
        assert!(build_connector(
            ScmKind::BitbucketDataCenter,
            Some("https://git.corp.example.com"),
            None,
            None
        )
        .is_ok());
    }
}
