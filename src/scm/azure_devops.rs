//! Azure DevOps Services connector. Repositories are addressed as
//! `project/repository` under the configured organization URL.
//!
//! The items API only serves zip archives, so `fetch_archive` repacks the
//! zip into the gzipped-tarball shape the rest of the pipeline expects,
//! with the same uniform root prefix the other connectors produce.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::io::Read;
use tracing::instrument;

use super::{
    constant_time_eq, http_client, RepoSummary, ScmConnector, ScmError, ScmKind, TagInfo,
    TokenGrant, WebhookVerification,
};

const OAUTH_BASE: &str = "https://app.vssps.visualstudio.com/oauth2";
const API_VERSION: &str = "7.0";

pub struct AzureDevOpsConnector {
    http: reqwest::Client,
    /// Organization URL, e.g. `https://dev.azure.com/acme`.
    base: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl std::fmt::Debug for AzureDevOpsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureDevOpsConnector")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl AzureDevOpsConnector {
    #[must_use]
    pub fn new(
        base_url: Option<&str>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http: http_client(),
            base: base_url
                .unwrap_or("https://dev.azure.com")
                .trim_end_matches('/')
                .to_string(),
            client_id,
            client_secret,
        }
    }

    fn split_repo(repo: &str) -> Result<(&str, &str), ScmError> {
        repo.split_once('/')
            .ok_or_else(|| ScmError::Api(format!("repository must be project/name: {repo}")))
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ScmError> {
        match response.status().as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(ScmError::Unauthorized),
            404 => Err(ScmError::NotFound(what.to_string())),
            status => Err(ScmError::Api(format!(
                "azure devops returned {status} for {what}"
            ))),
        }
    }

    async fn tag_refs(
        &self,
        token: &str,
        repo: &str,
        filter: &str,
    ) -> Result<Vec<TagInfo>, ScmError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Ref {
            name: String,
            object_id: String,
            peeled_object_id: Option<String>,
        }
        #[derive(Deserialize)]
        struct Refs {
            value: Vec<Ref>,
        }

        let (project, name) = Self::split_repo(repo)?;
        let response = self
            .http
            .get(format!(
                "{}/{project}/_apis/git/repositories/{name}/refs?filter={filter}&peelTags=true&api-version={API_VERSION}",
                self.base
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let refs: Refs = Self::check(response, "refs").await?.json().await?;
        Ok(refs
            .value
            .into_iter()
            .map(|r| TagInfo {
                tag: r.name.trim_start_matches("refs/tags/").to_string(),
                // Annotated tags resolve through the peeled object id.
                commit_sha: r.peeled_object_id.unwrap_or(r.object_id),
            })
            .collect())
    }

    /// Repack a zip archive into a gzipped tarball under `root_prefix/`.
    fn zip_to_tarball(data: &[u8], root_prefix: &str) -> Result<Vec<u8>, ScmError> {
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(data))
            .map_err(|e| ScmError::Api(format!("unreadable repository archive: {e}")))?;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for index in 0..zip.len() {
            let mut file = zip
                .by_index(index)
                .map_err(|e| ScmError::Api(format!("unreadable archive entry: {e}")))?;
            if file.is_dir() {
                continue;
            }
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|e| ScmError::Api(format!("truncated archive entry: {e}")))?;
            let path = format!("{root_prefix}/{}", file.name().trim_start_matches('/'));
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, &path, contents.as_slice())
                .map_err(|e| ScmError::Api(format!("archive repack failed: {e}")))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| ScmError::Api(format!("archive repack failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| ScmError::Api(format!("archive repack failed: {e}")))
    }
}

#[async_trait]
impl ScmConnector for AzureDevOpsConnector {
    fn kind(&self) -> ScmKind {
        ScmKind::AzureDevOps
    }

    fn supports_refresh_token(&self) -> bool {
        true
    }

    fn authorization_endpoint(&self, state: &str, requested_scopes: &[String]) -> Option<String> {
        let client_id = self.client_id.as_deref()?;
        Some(format!(
            "{OAUTH_BASE}/authorize?client_id={client_id}&response_type=Assertion&state={state}&scope={}",
            requested_scopes.join("%20"),
        ))
    }

    async fn complete_authorization(&self, code: &str) -> Result<TokenGrant, ScmError> {
        self.token_exchange("urn:ietf:params:oauth:grant-type:jwt-bearer", code)
            .await
    }

    async fn renew_token(&self, refresh_token: &str) -> Result<TokenGrant, ScmError> {
        self.token_exchange("refresh_token", refresh_token).await
    }

    #[instrument(skip(self, token))]
    async fn list_repositories(
        &self,
        token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RepoSummary>, bool), ScmError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Project {
            name: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Repo {
            name: String,
            project: Project,
            default_branch: Option<String>,
        }
        #[derive(Deserialize)]
        struct Repos {
            value: Vec<Repo>,
        }

        // The repositories API is unpaginated; page locally for a uniform
        // connector surface.
        let response = self
            .http
            .get(format!(
                "{}/_apis/git/repositories?api-version={API_VERSION}",
                self.base
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let repos: Repos = Self::check(response, "repositories").await?.json().await?;
        let all: Vec<RepoSummary> = repos
            .value
            .into_iter()
            .map(|r| RepoSummary {
                id: format!("{}/{}", r.project.name, r.name),
                name: r.name,
                default_branch: r.default_branch,
            })
            .collect();
        let start = (page.saturating_sub(1) * page_size) as usize;
        let end = (start + page_size as usize).min(all.len());
        let has_more = end < all.len();
        Ok((all.get(start..end).unwrap_or_default().to_vec(), has_more))
    }

    #[instrument(skip(self, token))]
    async fn list_tags(
        &self,
        token: &str,
        repo: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<TagInfo>, ScmError> {
        let all = self.tag_refs(token, repo, "tags/").await?;
        let start = (page.saturating_sub(1) * page_size) as usize;
        let end = (start + page_size as usize).min(all.len());
        Ok(all.get(start..end).unwrap_or_default().to_vec())
    }

    #[instrument(skip(self, token))]
    async fn resolve_tag_to_commit(
        &self,
        token: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, ScmError> {
        let matches = self.tag_refs(token, repo, &format!("tags/{tag}")).await?;
        matches
            .into_iter()
            .find(|t| t.tag == tag)
            .map(|t| t.commit_sha)
            .ok_or_else(|| ScmError::NotFound(format!("tag {tag}")))
    }

    #[instrument(skip(self, token))]
    async fn fetch_archive(
        &self,
        token: &str,
        repo: &str,
        commit_sha: &str,
    ) -> Result<Bytes, ScmError> {
        let (project, name) = Self::split_repo(repo)?;
        let response = self
            .http
            .get(format!(
                "{}/{project}/_apis/git/repositories/{name}/items?path=/&versionDescriptor.version={commit_sha}&versionDescriptor.versionType=commit&$format=zip&api-version={API_VERSION}",
                self.base
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let zip_bytes = Self::check(response, "archive").await?.bytes().await?;
        let short_sha = commit_sha.get(..12).unwrap_or(commit_sha);
        let tarball = Self::zip_to_tarball(&zip_bytes, &format!("{name}-{short_sha}"))?;
        Ok(Bytes::from(tarball))
    }

    fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        shared_secret: &str,
    ) -> WebhookVerification {
        // Service hooks authenticate with basic auth configured on the
        // subscription; the password is the shared secret.
        let Some(password) = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|credentials| {
                credentials.split_once(':').map(|(_, pass)| pass.to_string())
            })
        else {
            return WebhookVerification::rejected();
        };
        if !constant_time_eq(password.as_bytes(), shared_secret.as_bytes()) {
            return WebhookVerification::rejected();
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RefUpdate {
            name: Option<String>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Resource {
            #[serde(default)]
            ref_updates: Vec<RefUpdate>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Payload {
            id: Option<String>,
            event_type: Option<String>,
            resource: Option<Resource>,
        }

        let payload: Payload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(_) => return WebhookVerification::rejected(),
        };
        let tag = payload.resource.and_then(|r| {
            r.ref_updates.into_iter().find_map(|u| {
                u.name
                    .and_then(|n| n.strip_prefix("refs/tags/").map(str::to_string))
            })
        });

        WebhookVerification {
            ok: true,
            event_kind: payload.event_type,
            delivery_id: payload.id,
            tag,
        }
    }
}

impl AzureDevOpsConnector {
    async fn token_exchange(&self, grant_type: &str, assertion: &str) -> Result<TokenGrant, ScmError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: Option<i64>,
            scope: Option<String>,
        }

        let client_secret = self.client_secret.clone().unwrap_or_default();
        let response = self
            .http
            .post(format!("{OAUTH_BASE}/token"))
            .form(&[
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", client_secret.as_str()),
                ("grant_type", grant_type),
                ("assertion", assertion),
            ])
            .send()
            .await?;
        let body: TokenResponse = Self::check(response, "oauth token").await?.json().await?;
        Ok(TokenGrant {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            granted_scopes: body
                .scope
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn basic_auth_headers(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode(format!("{user}:{password}"));
        headers.insert("Authorization", format!("Basic {encoded}").parse().unwrap());
        headers
    }

    #[test]
    fn test_webhook_basic_auth_compare() {
        let connector = AzureDevOpsConnector::new(Some("https://dev.azure.com/acme"), None, None);
        let body = br#"{"id":"n1","eventType":"git.push","resource":{"refUpdates":[{"name":"refs/tags/v1.0.0"}]}}"#;

        let ok = connector.verify_webhook(body, &basic_auth_headers("hook", "whsec"), "whsec");
        assert!(ok.ok);
        assert_eq!(ok.event_kind.as_deref(), Some("git.push"));
        assert_eq!(ok.tag.as_deref(), Some("v1.0.0"));

        let bad = connector.verify_webhook(body, &basic_auth_headers("hook", "nope"), "whsec");
        assert!(!bad.ok);

        let missing = connector.verify_webhook(body, &HeaderMap::new(), "whsec");
        assert!(!missing.ok);
    }

    #[test]
    fn test_zip_repack_adds_uniform_root() {
        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("main.tf", options).unwrap();
            std::io::Write::write_all(&mut writer, b"resource {}").unwrap();
            writer.add_directory("modules", options).unwrap();
            writer.start_file("modules/sub.tf", options).unwrap();
            std::io::Write::write_all(&mut writer, b"").unwrap();
            writer.finish().unwrap();
        }

        let tarball = AzureDevOpsConnector::zip_to_tarball(&zip_bytes, "repo-abc").unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(tarball.as_slice()));
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(paths.contains(&"repo-abc/main.tf".to_string()));
        assert!(paths.contains(&"repo-abc/modules/sub.tf".to_string()));
    }

    #[test]
    fn test_split_repo() {
        assert_eq!(
            AzureDevOpsConnector::split_repo("platform/infra").unwrap(),
            ("platform", "infra")
        );
        assert!(AzureDevOpsConnector::split_repo("infra").is_err());
    }
}
