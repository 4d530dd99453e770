//! # Publisher Service
//!
//! Turns SCM events into module versions. Webhook deliveries and admin
//! manual-sync requests converge on [`Publisher::publish_tag`]:
//! resolve the link and its connector, resolve tag to commit, enforce
//! version immutability against the recorded commit, rebuild the archive
//! with an embedded commit manifest, then hand it to the ingestion
//! pipeline under a synthesized link principal.
//!
//! At-most-once per (module, version): a process-local advisory lock keyed
//! on the pair serializes concurrent attempts, and the metadata unique
//! constraint backs it up across processes. The lock wraps only an
//! in-memory set mutation; no await happens while the set mutex is held.

use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::crypto::Cipher;
use crate::db::modules::{ModuleRepository, ModuleVersion};
use crate::db::scm::{ScmProvider, ScmRepository};
use crate::error::{RegistryError, Result};
use crate::ingest::{archive, Ingestor, ModuleUpload};
use crate::observability::metrics;
use crate::scm::{build_connector, ScmConnector, ScmKind};

/// Queue depth between the webhook receiver and the publisher task.
const QUEUE_CAPACITY: usize = 256;

/// Builds a connector for a persisted SCM provider record. The seam lets
/// tests drive the publishing pipeline with a stub connector.
pub trait ConnectorFactory: Send + Sync {
    fn build(&self, provider: &ScmProvider) -> anyhow::Result<Arc<dyn ScmConnector>>;
}

/// Production factory: decrypts the provider credentials and constructs the
/// matching connector variant.
pub struct DefaultConnectorFactory {
    cipher: Arc<Cipher>,
}

impl DefaultConnectorFactory {
    #[must_use]
    pub fn new(cipher: Arc<Cipher>) -> Self {
        Self { cipher }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn build(&self, provider: &ScmProvider) -> anyhow::Result<Arc<dyn ScmConnector>> {
        let kind = ScmKind::parse(&provider.kind)
            .ok_or_else(|| anyhow::anyhow!("unknown scm kind {}", provider.kind))?;
        let client_id = provider
            .client_id_sealed
            .as_deref()
            .map(|sealed| self.cipher.open_str(sealed))
            .transpose()?
            .map(|open| open.to_string());
        let client_secret = provider
            .client_secret_sealed
            .as_deref()
            .map(|sealed| self.cipher.open_str(sealed))
            .transpose()?
            .map(|open| open.to_string());
        build_connector(kind, provider.base_url.as_deref(), client_id, client_secret)
    }
}

/// A unit of work for the publisher task.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub link_id: String,
    pub tag: String,
    /// Webhook event row to annotate with the outcome, when the request
    /// came from a delivery.
    pub event_id: Option<String>,
}

/// Outcome of a publish attempt.
#[derive(Debug)]
pub enum PublishOutcome {
    Published(ModuleVersion),
    /// The version already exists at the same commit; idempotent success.
    AlreadyCurrent,
}

/// Advisory lock over (module, version) pairs. Guard removal on drop keeps
/// the set accurate across early returns.
#[derive(Default)]
struct PairLocks {
    held: Mutex<HashSet<(String, String)>>,
}

struct PairLockGuard {
    locks: Arc<PairLocks>,
    key: (String, String),
}

impl Drop for PairLockGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .expect("pair lock set is never poisoned")
            .remove(&self.key);
    }
}

impl PairLocks {
    /// Wait until the pair is free, then hold it. The inner mutex is only
    /// held for the set mutation, never across an await.
    async fn acquire(self: Arc<Self>, module_id: &str, version: &str) -> PairLockGuard {
        let key = (module_id.to_string(), version.to_string());
        loop {
            let acquired = {
                let mut held = self
                    .held
                    .lock()
                    .expect("pair lock set is never poisoned");
                held.insert(key.clone())
            };
            if acquired {
                return PairLockGuard { locks: self, key };
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }
}

pub struct Publisher {
    pool: SqlitePool,
    ingestor: Arc<Ingestor>,
    connectors: Arc<dyn ConnectorFactory>,
    cipher: Arc<Cipher>,
    locks: Arc<PairLocks>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl Publisher {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        ingestor: Arc<Ingestor>,
        connectors: Arc<dyn ConnectorFactory>,
        cipher: Arc<Cipher>,
    ) -> Self {
        Self {
            pool,
            ingestor,
            connectors,
            cipher,
            locks: Arc::new(PairLocks::default()),
        }
    }

    /// Resolve the access token for a link: the linked user's OAuth token
    /// when one exists, otherwise the provider's PAT credential.
    async fn resolve_token(
        &self,
        link_user_id: Option<&str>,
        provider: &ScmProvider,
    ) -> Result<String> {
        let scm = ScmRepository::new(self.pool.clone());
        if let Some(user_id) = link_user_id {
            if let Some(token) = scm.get_user_token(user_id, &provider.id).await? {
                let open = self
                    .cipher
                    .open_str(&token.access_token_sealed)
                    .map_err(|e| RegistryError::Internal(e.into()))?;
                return Ok(open.to_string());
            }
        }
        if let Some(sealed) = &provider.client_secret_sealed {
            let open = self
                .cipher
                .open_str(sealed)
                .map_err(|e| RegistryError::Internal(e.into()))?;
            return Ok(open.to_string());
        }
        Err(RegistryError::Internal(anyhow::anyhow!(
            "no usable credential for scm provider {}",
            provider.id
        )))
    }

    /// Execute the publishing procedure for a link and tag.
    #[instrument(skip(self), fields(link_id, tag))]
    pub async fn publish_tag(&self, link_id: &str, tag: &str) -> Result<PublishOutcome> {
        let scm = ScmRepository::new(self.pool.clone());
        let modules = ModuleRepository::new(self.pool.clone());

        let link = scm
            .get_link(link_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("scm link {link_id}")))?;
        if !link.active {
            return Err(RegistryError::BadRequest("scm link is inactive".to_string()));
        }
        let module = modules
            .get(&link.module_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound("module".to_string()))?;
        let provider = scm
            .get_provider(&link.scm_provider_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound("scm provider".to_string()))?;
        if !provider.active {
            return Err(RegistryError::BadRequest(
                "scm provider is inactive".to_string(),
            ));
        }

        let connector = self
            .connectors
            .build(&provider)
            .map_err(RegistryError::Internal)?;
        let token = self.resolve_token(link.user_id.as_deref(), &provider).await?;

        let commit_sha = connector
            .resolve_tag_to_commit(&token, &link.repository, tag)
            .await?;

        // The publisher strips a single leading `v`; the version itself must
        // then be plain SemVer.
        let version = tag.strip_prefix('v').unwrap_or(tag).to_string();
        Ingestor::validate_version(&version)?;

        let _guard = Arc::clone(&self.locks).acquire(&module.id, &version).await;

        // Immutability check under the lock: same commit is an idempotent
        // success, a moved tag is refused loudly.
        if let Some(existing) = modules.find_version(&module.id, &version).await? {
            return if existing.commit_sha.as_deref() == Some(commit_sha.as_str()) {
                metrics::record_publish("noop");
                Ok(PublishOutcome::AlreadyCurrent)
            } else {
                error!(
                    module = %format!("{}/{}/{}", module.namespace, module.name, module.system),
                    version = %version,
                    recorded_commit = existing.commit_sha.as_deref().unwrap_or("<none>"),
                    new_commit = %commit_sha,
                    "immutability violation: tag now resolves to a different commit"
                );
                metrics::record_publish("immutability_violation");
                Err(RegistryError::VersionExistsDiffers)
            };
        }

        let raw = connector
            .fetch_archive(&token, &link.repository, &commit_sha)
            .await?;
        let commit_for_manifest = commit_sha.clone();
        let rebuilt = tokio::task::spawn_blocking(move || {
            archive::rebuild_with_commit_manifest(&raw, &commit_for_manifest)
        })
        .await
        .map_err(|e| RegistryError::Internal(e.into()))?
        .map_err(|_| RegistryError::BadRequest("malformed_archive".to_string()))?;

        let ingested = self
            .ingestor
            .ingest_module(ModuleUpload {
                namespace: module.namespace.clone(),
                name: module.name.clone(),
                system: module.system.clone(),
                version: version.clone(),
                description: module.description.clone(),
                published_by: Some(format!("scm-link:{link_id}")),
                commit_sha: Some(commit_sha.clone()),
                organization_id: Some(module.organization_id.clone()),
                data: bytes::Bytes::from(rebuilt),
            })
            .await;

        match ingested {
            Ok(published) => {
                metrics::record_publish("published");
                info!(version = %version, commit = %commit_sha, "module published from scm tag");
                Ok(PublishOutcome::Published(published))
            }
            // Lost a cross-process race after the local lock; re-apply the
            // duplicate branch.
            Err(RegistryError::VersionExists) => {
                let existing = modules.find_version(&module.id, &version).await?;
                match existing {
                    Some(v) if v.commit_sha.as_deref() == Some(commit_sha.as_str()) => {
                        metrics::record_publish("noop");
                        Ok(PublishOutcome::AlreadyCurrent)
                    }
                    _ => {
                        metrics::record_publish("immutability_violation");
                        Err(RegistryError::VersionExistsDiffers)
                    }
                }
            }
            Err(other) => {
                metrics::record_publish("error");
                Err(other)
            }
        }
    }
}

/// Handle for enqueueing publish work from the webhook receiver.
#[derive(Clone, Debug)]
pub struct PublishQueue {
    tx: mpsc::Sender<PublishRequest>,
}

impl PublishQueue {
    /// Enqueue; drops the request (with a log line) when the queue is full
    /// rather than blocking the receiver.
    pub fn enqueue(&self, request: PublishRequest) {
        if let Err(err) = self.tx.try_send(request) {
            warn!(error = %err, "publish queue full; dropping webhook-triggered publish");
        }
    }
}

/// Spawn the single consumer task draining the publish queue.
pub fn spawn_publisher_task(
    publisher: Arc<Publisher>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> PublishQueue {
    let (tx, mut rx) = mpsc::channel::<PublishRequest>(QUEUE_CAPACITY);
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("publisher task shutting down");
                        break;
                    }
                    continue;
                }
            };

            let outcome = publisher
                .publish_tag(&request.link_id, &request.tag)
                .await;
            let outcome_label = match &outcome {
                Ok(PublishOutcome::Published(v)) => format!("published {}", v.version),
                Ok(PublishOutcome::AlreadyCurrent) => "noop".to_string(),
                Err(err) => format!("failed: {err}"),
            };
            if let Err(error) = &outcome {
                warn!(link_id = %request.link_id, tag = %request.tag, %error, "webhook publish failed");
            }
            if let Some(event_id) = &request.event_id {
                let scm = ScmRepository::new(publisher.pool.clone());
                if let Err(error) = scm.update_webhook_outcome(event_id, &outcome_label).await {
                    warn!(%error, "failed to record webhook outcome");
                }
            }
        }
    });
    PublishQueue { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalStorageSettings;
    use crate::db::orgs::OrgRepository;
    use crate::db::scm::NewScmProvider;
    use crate::ingest::archive::test_archives::tarball;
    use crate::scm::{RepoSummary, ScmError, TagInfo, TokenGrant, WebhookVerification};
    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Stub connector resolving tags from an in-memory map.
    struct StubConnector {
        tags: StdMutex<HashMap<String, String>>,
    }

    impl StubConnector {
        fn new(tags: &[(&str, &str)]) -> Self {
            Self {
                tags: StdMutex::new(
                    tags.iter()
                        .map(|(t, c)| ((*t).to_string(), (*c).to_string()))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl ScmConnector for StubConnector {
        fn kind(&self) -> ScmKind {
            ScmKind::GitHub
        }
        fn supports_refresh_token(&self) -> bool {
            false
        }
        fn authorization_endpoint(&self, _: &str, _: &[String]) -> Option<String> {
            None
        }
        async fn complete_authorization(&self, _: &str) -> Result<TokenGrant, ScmError> {
            Err(ScmError::RefreshUnsupported)
        }
        async fn renew_token(&self, _: &str) -> Result<TokenGrant, ScmError> {
            Err(ScmError::RefreshUnsupported)
        }
        async fn list_repositories(
            &self,
            _: &str,
            _: u32,
            _: u32,
        ) -> Result<(Vec<RepoSummary>, bool), ScmError> {
            Ok((vec![], false))
        }
        async fn list_tags(
            &self,
            _: &str,
            _: &str,
            _: u32,
            _: u32,
        ) -> Result<Vec<TagInfo>, ScmError> {
            Ok(vec![])
        }
        async fn resolve_tag_to_commit(
            &self,
            _: &str,
            _: &str,
            tag: &str,
        ) -> Result<String, ScmError> {
            self.tags
                .lock()
                .unwrap()
                .get(tag)
                .cloned()
                .ok_or_else(|| ScmError::NotFound(format!("tag {tag}")))
        }
        async fn fetch_archive(&self, _: &str, _: &str, _: &str) -> Result<Bytes, ScmError> {
            Ok(Bytes::from(tarball(&[
                ("repo-abc/main.tf", b"resource {}".as_slice()),
                ("repo-abc/README.md", b"# from scm".as_slice()),
            ])))
        }
        fn verify_webhook(&self, _: &[u8], _: &HeaderMap, _: &str) -> WebhookVerification {
            WebhookVerification::rejected()
        }
    }

    struct StubFactory {
        connector: Arc<StubConnector>,
    }

    impl ConnectorFactory for StubFactory {
        fn build(&self, _: &ScmProvider) -> anyhow::Result<Arc<dyn ScmConnector>> {
            Ok(Arc::clone(&self.connector) as Arc<dyn ScmConnector>)
        }
    }

    async fn publisher_with(
        tags: &[(&str, &str)],
    ) -> (tempfile::TempDir, Arc<Publisher>, String, Arc<StubConnector>) {
        let pool = crate::db::test_pool().await;
        let org = OrgRepository::new(pool.clone())
            .create_organization("default", "Default")
            .await
            .unwrap();
        let module = ModuleRepository::new(pool.clone())
            .ensure(&org.id, "acme", "vpc", "aws", None)
            .await
            .unwrap();
        let scm = ScmRepository::new(pool.clone());
        let cipher = Arc::new(Cipher::new(&[9u8; 32]));
        let provider = scm
            .create_provider(NewScmProvider {
                organization_id: org.id.clone(),
                display_name: "Stub".to_string(),
                kind: "github".to_string(),
                base_url: None,
                client_id_sealed: None,
                client_secret_sealed: Some(cipher.seal_str("pat-token").unwrap()),
                webhook_secret_sealed: None,
            })
            .await
            .unwrap();
        let link = scm
            .create_link(&module.id, &provider.id, None, "acme/vpc", "v*", "whsec")
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            crate::storage::local::LocalStorage::new(&LocalStorageSettings {
                root_path: dir.path().to_string_lossy().to_string(),
                serve_directly: true,
            })
            .unwrap(),
        );
        let ingestor = Arc::new(Ingestor::new(storage, pool.clone(), "default".to_string()));
        let connector = Arc::new(StubConnector::new(tags));
        let publisher = Arc::new(Publisher::new(
            pool,
            ingestor,
            Arc::new(StubFactory {
                connector: Arc::clone(&connector),
            }),
            cipher,
        ));
        (dir, publisher, link.id, connector)
    }

    #[tokio::test]
    async fn test_publish_embeds_commit_and_strips_v() {
        let commit = "c".repeat(40);
        let (_dir, publisher, link_id, _) = publisher_with(&[("v2.0.0", &commit)]).await;
        let outcome = publisher.publish_tag(&link_id, "v2.0.0").await.unwrap();
        let PublishOutcome::Published(version) = outcome else {
            panic!("expected a published version");
        };
        assert_eq!(version.version, "2.0.0");
        assert_eq!(version.commit_sha.as_deref(), Some(commit.as_str()));
        assert!(version
            .published_by
            .as_deref()
            .unwrap()
            .starts_with("scm-link:"));
    }

    #[tokio::test]
    async fn test_republish_same_commit_is_noop() {
        let commit = "c".repeat(40);
        let (_dir, publisher, link_id, _) = publisher_with(&[("v2.0.0", &commit)]).await;
        publisher.publish_tag(&link_id, "v2.0.0").await.unwrap();
        let outcome = publisher.publish_tag(&link_id, "v2.0.0").await.unwrap();
        assert!(matches!(outcome, PublishOutcome::AlreadyCurrent));
    }

    #[tokio::test]
    async fn test_moved_tag_is_refused() {
        let commit = "c".repeat(40);
        let (_dir, publisher, link_id, connector) = publisher_with(&[("v2.0.0", &commit)]).await;
        publisher.publish_tag(&link_id, "v2.0.0").await.unwrap();

        // The tag now points at a different commit.
        connector
            .tags
            .lock()
            .unwrap()
            .insert("v2.0.0".to_string(), "d".repeat(40));
        let err = publisher.publish_tag(&link_id, "v2.0.0").await.unwrap_err();
        assert!(matches!(err, RegistryError::VersionExistsDiffers));
    }

    #[tokio::test]
    async fn test_bad_tag_version_rejected() {
        let (_dir, publisher, link_id, _) = publisher_with(&[("release-1", "abc")]).await;
        let err = publisher.publish_tag(&link_id, "release-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_not_found() {
        let (_dir, publisher, link_id, _) = publisher_with(&[]).await;
        let err = publisher.publish_tag(&link_id, "v9.9.9").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
