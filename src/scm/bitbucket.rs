//! Bitbucket Data Center connector. Always self-hosted (`base_url` is
//! mandatory) and PAT-authenticated: there is no OAuth dance and nothing to
//! refresh. Repositories are addressed as `PROJECT/slug`.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use serde::Deserialize;
use tracing::instrument;

use super::{
    constant_time_eq, hmac_sha256_hex, http_client, RepoSummary, ScmConnector, ScmError,
    ScmKind, TagInfo, TokenGrant, WebhookVerification,
};

pub struct BitbucketConnector {
    http: reqwest::Client,
    base: String,
}

impl std::fmt::Debug for BitbucketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitbucketConnector")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl BitbucketConnector {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            http: http_client(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn split_repo(repo: &str) -> Result<(&str, &str), ScmError> {
        repo.split_once('/')
            .ok_or_else(|| ScmError::Api(format!("repository must be PROJECT/slug: {repo}")))
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ScmError> {
        match response.status().as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(ScmError::Unauthorized),
            404 => Err(ScmError::NotFound(what.to_string())),
            status => Err(ScmError::Api(format!(
                "bitbucket returned {status} for {what}"
            ))),
        }
    }
}

#[async_trait]
impl ScmConnector for BitbucketConnector {
    fn kind(&self) -> ScmKind {
        ScmKind::BitbucketDataCenter
    }

    fn supports_refresh_token(&self) -> bool {
        false
    }

    fn authorization_endpoint(&self, _state: &str, _requested_scopes: &[String]) -> Option<String> {
        // PAT connector: tokens are created in the Bitbucket UI.
        None
    }

    async fn complete_authorization(&self, _code: &str) -> Result<TokenGrant, ScmError> {
        Err(ScmError::Api(
            "bitbucket-datacenter uses personal access tokens; there is no authorization flow"
                .to_string(),
        ))
    }

    async fn renew_token(&self, _refresh_token: &str) -> Result<TokenGrant, ScmError> {
        Err(ScmError::RefreshUnsupported)
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
            key: String,
        }
        #[derive(Deserialize)]
        struct Repo {
            slug: String,
            name: String,
            project: Project,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            values: Vec<Repo>,
            is_last_page: bool,
        }

        let start = page.saturating_sub(1) * page_size;
        let response = self
            .http
            .get(format!(
                "{}/rest/api/1.0/repos?start={start}&limit={page_size}",
                self.base
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let body: Page = Self::check(response, "repositories").await?.json().await?;
        Ok((
            body.values
                .into_iter()
                .map(|r| RepoSummary {
                    id: format!("{}/{}", r.project.key, r.slug),
                    name: r.name,
                    default_branch: None,
                })
                .collect(),
            !body.is_last_page,
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
        #[serde(rename_all = "camelCase")]
        struct Tag {
            display_id: String,
            latest_commit: String,
        }
        #[derive(Deserialize)]
        struct Page {
            values: Vec<Tag>,
        }

        let (project, slug) = Self::split_repo(repo)?;
        let start = page.saturating_sub(1) * page_size;
        let response = self
            .http
            .get(format!(
                "{}/rest/api/1.0/projects/{project}/repos/{slug}/tags?start={start}&limit={page_size}&orderBy=MODIFICATION",
                self.base
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let body: Page = Self::check(response, "tags").await?.json().await?;
        Ok(body
            .values
            .into_iter()
            .map(|t| TagInfo {
                tag: t.display_id,
                commit_sha: t.latest_commit,
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
        #[serde(rename_all = "camelCase")]
        struct Tag {
            latest_commit: String,
        }

        let (project, slug) = Self::split_repo(repo)?;
        let response = self
            .http
            .get(format!(
                "{}/rest/api/1.0/projects/{project}/repos/{slug}/tags/{tag}",
                self.base
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let body: Tag = Self::check(response, &format!("tag {tag}")).await?.json().await?;
        Ok(body.latest_commit)
    }

    #[instrument(skip(self, token))]
    async fn fetch_archive(
        &self,
        token: &str,
        repo: &str,
        commit_sha: &str,
    ) -> Result<Bytes, ScmError> {
        let (project, slug) = Self::split_repo(repo)?;
        let short_sha = commit_sha.get(..12).unwrap_or(commit_sha);
        // The prefix parameter gives the archive the same uniform root the
        // other connectors produce.
        let response = self
            .http
            .get(format!(
                "{}/rest/api/1.0/projects/{project}/repos/{slug}/archive?at={commit_sha}&format=tar.gz&prefix={slug}-{short_sha}/",
                self.base
            ))
            .bearer_auth(token)
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
            .get("X-Hub-Signature")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("sha256="))
        else {
            return WebhookVerification::rejected();
        };
        let expected = hmac_sha256_hex(shared_secret, raw_body);
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return WebhookVerification::rejected();
        }

        #[derive(Deserialize)]
        struct Ref {
            id: Option<String>,
        }
        #[derive(Deserialize)]
        struct Change {
            r#ref: Option<Ref>,
        }
        #[derive(Deserialize)]
        struct Payload {
            #[serde(default)]
            changes: Vec<Change>,
        }

        let tag = serde_json::from_slice::<Payload>(raw_body)
            .ok()
            .and_then(|p| {
                p.changes.into_iter().find_map(|c| {
                    c.r#ref
                        .and_then(|r| r.id)
                        .and_then(|id| id.strip_prefix("refs/tags/").map(str::to_string))
                })
            });

        WebhookVerification {
            ok: true,
            event_kind: headers
                .get("X-Event-Key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            delivery_id: headers
                .get("X-Request-Id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            tag,
        }
    }
}
