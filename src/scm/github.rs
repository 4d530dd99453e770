//! GitHub connector: github.com by default, GitHub Enterprise via
//! `base_url`. Webhooks are verified with the `X-Hub-Signature-256`
//! HMAC-SHA256 header.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{
    constant_time_eq, hmac_sha256_hex, http_client, RepoSummary, ScmConnector, ScmError,
    ScmKind, TagInfo, TokenGrant, WebhookVerification,
};

pub struct GitHubConnector {
    http: reqwest::Client,
    api_base: String,
    oauth_base: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl std::fmt::Debug for GitHubConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConnector")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl GitHubConnector {
    #[must_use]
    pub fn new(
        base_url: Option<&str>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        // GitHub Enterprise serves the REST API under /api/v3.
        let (api_base, oauth_base) = match base_url {
            Some(base) => {
                let base = base.trim_end_matches('/').to_string();
                (format!("{base}/api/v3"), base)
            }
            None => (
                "https://api.github.com".to_string(),
                "https://github.com".to_string(),
            ),
        };
        Self {
            http: http_client(),
            api_base,
            oauth_base,
            client_id,
            client_secret,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ScmError> {
        match response.status().as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(ScmError::Unauthorized),
            404 => Err(ScmError::NotFound(what.to_string())),
            status => Err(ScmError::Api(format!("github returned {status} for {what}"))),
        }
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, ScmError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: Option<String>,
            refresh_token: Option<String>,
            expires_in: Option<i64>,
            scope: Option<String>,
            error_description: Option<String>,
        }

        let response = self
            .http
            .post(format!("{}/login/oauth/access_token", self.oauth_base))
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;
        let body: TokenResponse = Self::check(response, "oauth token").await?.json().await?;
        let access_token = body.access_token.ok_or_else(|| {
            ScmError::Api(
                body.error_description
                    .unwrap_or_else(|| "token exchange failed".to_string()),
            )
        })?;
        Ok(TokenGrant {
            access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            granted_scopes: body
                .scope
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    fn get(&self, token: &str, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.api_base))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
    }
}

#[async_trait]
impl ScmConnector for GitHubConnector {
    fn kind(&self) -> ScmKind {
        ScmKind::GitHub
    }

    fn supports_refresh_token(&self) -> bool {
        true
    }

    fn authorization_endpoint(&self, state: &str, requested_scopes: &[String]) -> Option<String> {
        let client_id = self.client_id.as_deref()?;
        Some(format!(
            "{}/login/oauth/authorize?client_id={client_id}&state={state}&scope={}",
            self.oauth_base,
            requested_scopes.join("%20"),
        ))
    }

    async fn complete_authorization(&self, code: &str) -> Result<TokenGrant, ScmError> {
        let client_id = self.client_id.clone().unwrap_or_default();
        let client_secret = self.client_secret.clone().unwrap_or_default();
        self.token_request(&[
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
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
        struct Repo {
            full_name: String,
            name: String,
            default_branch: Option<String>,
        }

        let response = self
            .get(token, &format!("/user/repos?page={page}&per_page={page_size}&sort=updated"))
            .send()
            .await?;
        let repos: Vec<Repo> = Self::check(response, "repositories").await?.json().await?;
        let has_more = repos.len() as u32 == page_size;
        Ok((
            repos
                .into_iter()
                .map(|r| RepoSummary {
                    id: r.full_name,
                    name: r.name,
                    default_branch: r.default_branch,
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
            sha: String,
        }
        #[derive(Deserialize)]
        struct Tag {
            name: String,
            commit: Commit,
        }

        let response = self
            .get(
                token,
                &format!("/repos/{repo}/tags?page={page}&per_page={page_size}"),
            )
            .send()
            .await?;
        let tags: Vec<Tag> = Self::check(response, "tags").await?.json().await?;
        Ok(tags
            .into_iter()
            .map(|t| TagInfo {
                tag: t.name,
                commit_sha: t.commit.sha,
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
            sha: String,
        }

        // The commits endpoint peels annotated tags to the target commit.
        let response = self
            .get(token, &format!("/repos/{repo}/commits/{tag}"))
            .send()
            .await?;
        let commit: Commit = Self::check(response, &format!("tag {tag}")).await?.json().await?;
        Ok(commit.sha)
    }

    #[instrument(skip(self, token))]
    async fn fetch_archive(
        &self,
        token: &str,
        repo: &str,
        commit_sha: &str,
    ) -> Result<Bytes, ScmError> {
        let response = self
            .get(token, &format!("/repos/{repo}/tarball/{commit_sha}"))
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
        let Some(signature) = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("sha256="))
        else {
            return WebhookVerification::rejected();
        };
        let expected = hmac_sha256_hex(shared_secret, raw_body);
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            debug!("github webhook signature mismatch");
            return WebhookVerification::rejected();
        }

        #[derive(Deserialize)]
        struct PushPayload {
            r#ref: Option<String>,
        }
        let event_kind = headers
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let delivery_id = headers
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let tag = serde_json::from_slice::<PushPayload>(raw_body)
            .ok()
            .and_then(|p| p.r#ref)
            .and_then(|r| r.strip_prefix("refs/tags/").map(str::to_string));

        WebhookVerification {
            ok: true,
            event_kind,
            delivery_id,
            tag,
        }
    }
}
