//! GitLab connector: gitlab.com by default, self-managed via `base_url`.
//! Webhooks carry no HMAC; GitLab sends the shared secret verbatim in the
//! `X-Gitlab-Token` header, compared in constant time.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;

use super::{
    constant_time_eq, http_client, RepoSummary, ScmConnector, ScmError, ScmKind, TagInfo,
    TokenGrant, WebhookVerification,
};

pub struct GitLabConnector {
    http: reqwest::Client,
    base: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl std::fmt::Debug for GitLabConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabConnector")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl GitLabConnector {
    #[must_use]
    pub fn new(
        base_url: Option<&str>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http: http_client(),
            base: base_url
                .unwrap_or("https://gitlab.com")
                .trim_end_matches('/')
                .to_string(),
            client_id,
            client_secret,
        }
    }

    /// Project paths are used URL-encoded (`group%2Fproject`).
    fn encode_repo(repo: &str) -> String {
        repo.replace('/', "%2F")
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ScmError> {
        match response.status().as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(ScmError::Unauthorized),
            404 => Err(ScmError::NotFound(what.to_string())),
            status => Err(ScmError::Api(format!("gitlab returned {status} for {what}"))),
        }
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, ScmError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: Option<i64>,
            scope: Option<String>,
        }

        let response = self
            .http
            .post(format!("{}/oauth/token", self.base))
            .form(params)
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

    fn get(&self, token: &str, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}/api/v4{path}", self.base))
            .bearer_auth(token)
    }
}

#[async_trait]
impl ScmConnector for GitLabConnector {
    fn kind(&self) -> ScmKind {
        ScmKind::GitLab
    }

    fn supports_refresh_token(&self) -> bool {
        true
    }

    fn authorization_endpoint(&self, state: &str, requested_scopes: &[String]) -> Option<String> {
        let client_id = self.client_id.as_deref()?;
        Some(format!(
            "{}/oauth/authorize?client_id={client_id}&response_type=code&state={state}&scope={}",
            self.base,
            requested_scopes.join("+"),
        ))
    }

    async fn complete_authorization(&self, code: &str) -> Result<TokenGrant, ScmError> {
        let client_id = self.client_id.clone().unwrap_or_default();
        let client_secret = self.client_secret.clone().unwrap_or_default();
        self.token_request(&[
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
        ])
        .await
    }

    async fn renew_token(&self, refresh_token: &str) -> Result<TokenGrant, ScmError> {
        let client_id = self.client_id.clone().unwrap_or_default();
        let client_secret = self.client_secret.clone().unwrap_or_default();
        self.token_request(&[
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    #[instrument(skip(self, token))]
    async fn list_repositories(
        &self,
        token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RepoSummary>, bool), ScmError> {
        #[derive(Deserialize)]
        struct Project {
            path_with_namespace: String,
            name: String,
            default_branch: Option<String>,
        }

        let response = self
            .get(
                token,
                &format!("/projects?membership=true&page={page}&per_page={page_size}&order_by=last_activity_at"),
            )
            .send()
            .await?;
        let projects: Vec<Project> = Self::check(response, "projects").await?.json().await?;
        let has_more = projects.len() as u32 == page_size;
        Ok((
            projects
                .into_iter()
                .map(|p| RepoSummary {
                    id: p.path_with_namespace,
                    name: p.name,
                    default_branch: p.default_branch,
                })
                .collect(),
            has_more,
        ))
    }

    #[instrument(skip(self, token))]
    async fn list_tags(
        &self,
        token: &str,
        repo: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<TagInfo>, ScmError> {
        #[derive(Deserialize)]
        struct Commit {
            id: String,
        }
        #[derive(Deserialize)]
        struct Tag {
            name: String,
            commit: Commit,
        }

        let response = self
            .get(
                token,
                &format!(
                    "/projects/{}/repository/tags?page={page}&per_page={page_size}",
                    Self::encode_repo(repo)
                ),
            )
            .send()
            .await?;
        let tags: Vec<Tag> = Self::check(response, "tags").await?.json().await?;
        Ok(tags
            .into_iter()
            .map(|t| TagInfo {
                tag: t.name,
                commit_sha: t.commit.id,
            })
            .collect())
    }

    #[instrument(skip(self, token))]
    async fn resolve_tag_to_commit(
        &self,
        token: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String, ScmError> {
        #[derive(Deserialize)]
        struct Commit {
            id: String,
        }

        let response = self
            .get(
                token,
                &format!(
                    "/projects/{}/repository/commits/{tag}",
                    Self::encode_repo(repo)
                ),
            )
            .send()
            .await?;
        let commit: Commit = Self::check(response, &format!("tag {tag}")).await?.json().await?;
        Ok(commit.id)
    }

    #[instrument(skip(self, token))]
    async fn fetch_archive(
        &self,
        token: &str,
        repo: &str,
        commit_sha: &str,
    ) -> Result<Bytes, ScmError> {
        let response = self
            .get(
                token,
                &format!(
                    "/projects/{}/repository/archive.tar.gz?sha={commit_sha}",
                    Self::encode_repo(repo)
                ),
            )
            .send()
            .await?;
        let response = Self::check(response, "archive").await?;
        Ok(response.bytes().await?)
    }

    fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        shared_secret: &str,
    ) -> WebhookVerification {
        let Some(token) = headers.get("X-Gitlab-Token").and_then(|v| v.to_str().ok()) else {
            return WebhookVerification::rejected();
        };
        if !constant_time_eq(token.as_bytes(), shared_secret.as_bytes()) {
            return WebhookVerification::rejected();
        }

        #[derive(Deserialize)]
        struct PushPayload {
            r#ref: Option<String>,
        }
        let event_kind = headers
            .get("X-Gitlab-Event")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let tag = serde_json::from_slice::<PushPayload>(raw_body)
            .ok()
            .and_then(|p| p.r#ref)
            .and_then(|r| r.strip_prefix("refs/tags/").map(str::to_string));

        WebhookVerification {
            ok: true,
            event_kind,
            delivery_id: headers
                .get("X-Gitlab-Event-UUID")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> GitLabConnector {
        GitLabConnector::new(None, None, None)
    }

    #[test]
    fn test_webhook_token_compare() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Gitlab-Token", "whsec".parse().unwrap());
        headers.insert("X-Gitlab-Event", "Tag Push Hook".parse().unwrap());
        let body = br#"{"ref":"refs/tags/v2.0.0"}"#;

        let ok = connector().verify_webhook(body, &headers, "whsec");
        assert!(ok.ok);
        assert_eq!(ok.tag.as_deref(), Some("v2.0.0"));

        let bad = connector().verify_webhook(body, &headers, "different");
        assert!(!bad.ok);
    }

    #[test]
    fn test_repo_encoding() {
        assert_eq!(GitLabConnector::encode_repo("group/sub/project"), "group%2Fsub%2Fproject");
    }
}
