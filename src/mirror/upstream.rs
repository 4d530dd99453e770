//! Client for an upstream provider registry (registry.terraform.io or
//! another instance of this server). Endpoints are discovered through the
//! upstream's `/.well-known/terraform.json` document rather than assumed.

use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::scm::SCM_REQUEST_TIMEOUT;

/// One version as enumerated by the upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamVersion {
    pub version: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<UpstreamPlatform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamPlatform {
    pub os: String,
    pub arch: String,
}

/// The upstream's provider download document.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamDownload {
    #[serde(default)]
    pub protocols: Vec<String>,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub download_url: String,
    pub shasums_url: String,
    pub shasums_signature_url: String,
    pub shasum: String,
    #[serde(default)]
    pub signing_keys: SigningKeys,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningKeys {
    #[serde(default)]
    pub gpg_public_keys: Vec<GpgPublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpgPublicKey {
    #[serde(default)]
    pub key_id: Option<String>,
    pub ascii_armor: String,
}

/// Summary entry from the upstream's provider listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamProviderSummary {
    pub namespace: String,
    #[serde(alias = "type", alias = "name")]
    pub provider_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream has no providers.v1 service")]
    NoProviderService,
    #[error("upstream returned {status} for {what}")]
    Status { status: u16, what: String },
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct UpstreamRegistry {
    http: reqwest::Client,
    base: String,
    providers_prefix: OnceCell<String>,
}

impl std::fmt::Debug for UpstreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRegistry")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl UpstreamRegistry {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(SCM_REQUEST_TIMEOUT.max(Duration::from_secs(30)))
                .user_agent(concat!("terraform-registry/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            base: base_url.trim_end_matches('/').to_string(),
            providers_prefix: OnceCell::new(),
        }
    }

    /// Absolute URL for a possibly-relative upstream reference.
    fn absolutize(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base, url.trim_start_matches('/'))
        }
    }

    async fn check(
        response: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(response)
        } else {
            Err(UpstreamError::Status {
                status,
                what: what.to_string(),
            })
        }
    }

    /// Service discovery: resolve and cache the providers.v1 prefix.
    async fn providers_prefix(&self) -> Result<&str, UpstreamError> {
        #[derive(Deserialize)]
        struct Discovery {
            #[serde(rename = "providers.v1")]
            providers_v1: Option<String>,
        }

        let prefix = self
            .providers_prefix
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(format!("{}/.well-known/terraform.json", self.base))
                    .send()
                    .await?;
                let discovery: Discovery =
                    Self::check(response, "service discovery").await?.json().await?;
                let prefix = discovery
                    .providers_v1
                    .ok_or(UpstreamError::NoProviderService)?;
                Ok::<String, UpstreamError>(self.absolutize(&prefix))
            })
            .await?;
        Ok(prefix)
    }

    /// Providers under a namespace via the upstream's listing API.
    #[instrument(skip(self))]
    pub async fn list_providers(
        &self,
        namespace: &str,
    ) -> Result<Vec<UpstreamProviderSummary>, UpstreamError> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            providers: Vec<UpstreamProviderSummary>,
        }

        let response = self
            .http
            .get(format!(
                "{}/v1/providers?namespace={namespace}&limit=100",
                self.base
            ))
            .send()
            .await?;
        let listing: Listing = Self::check(response, "provider listing").await?.json().await?;
        Ok(listing.providers)
    }

    /// All versions of one provider.
    #[instrument(skip(self))]
    pub async fn list_versions(
        &self,
        namespace: &str,
        provider_type: &str,
    ) -> Result<Vec<UpstreamVersion>, UpstreamError> {
        #[derive(Deserialize)]
        struct Versions {
            #[serde(default)]
            versions: Vec<UpstreamVersion>,
        }

        let prefix = self.providers_prefix().await?;
        let url = format!(
            "{}/{namespace}/{provider_type}/versions",
            prefix.trim_end_matches('/')
        );
        let response = self.http.get(url).send().await?;
        let versions: Versions = Self::check(response, "versions").await?.json().await?;
        Ok(versions.versions)
    }

    /// The download document for one (version, os, arch).
    #[instrument(skip(self))]
    pub async fn download_info(
        &self,
        namespace: &str,
        provider_type: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<UpstreamDownload, UpstreamError> {
        let prefix = self.providers_prefix().await?;
        let url = format!(
            "{}/{namespace}/{provider_type}/{version}/download/{os}/{arch}",
            prefix.trim_end_matches('/')
        );
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response, "download document")
            .await?
            .json()
            .await?)
    }

    /// Fetch an artifact or manifest by URL (absolute, or relative to the
    /// upstream base).
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<Bytes, UpstreamError> {
        let response = self.http.get(self.absolutize(url)).send().await?;
        Ok(Self::check(response, "artifact").await?.bytes().await?)
    }
}

/// Parse a SHA256SUMS manifest into (filename, hex digest) pairs.
#[must_use]
pub fn parse_shasums(manifest: &str) -> std::collections::HashMap<String, String> {
    manifest
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let digest = parts.next()?;
            let filename = parts.next()?;
            if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
                Some((
                    filename.trim_start_matches('*').to_string(),
                    digest.to_lowercase(),
                ))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shasums() {
        let manifest = "\
abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789  terraform-provider-random_3.6.0_linux_amd64.zip
0000000000000000000000000000000000000000000000000000000000000000 *terraform-provider-random_3.6.0_darwin_arm64.zip
not-a-digest some-file.zip
";
        let sums = parse_shasums(manifest);
        assert_eq!(sums.len(), 2);
        assert_eq!(
            sums.get("terraform-provider-random_3.6.0_linux_amd64.zip")
                .unwrap(),
            "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789"
        );
        assert!(sums.contains_key("terraform-provider-random_3.6.0_darwin_arm64.zip"));
    }

    #[test]
    fn test_absolutize() {
        let upstream = UpstreamRegistry::new("https://registry.terraform.io/");
        assert_eq!(
            upstream.absolutize("/v1/providers/"),
            "https://registry.terraform.io/v1/providers/"
        );
        assert_eq!(
            upstream.absolutize("https://releases.hashicorp.com/x.zip"),
            "https://releases.hashicorp.com/x.zip"
        );
    }
}
