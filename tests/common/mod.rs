//! Shared fixtures for the integration suites: an in-memory registry with
//! local storage, a stub SCM connector and an always-valid signature
//! verifier, served through axum-test.

#![allow(
    dead_code,
    reason = "each test binary uses a different subset of these fixtures"
)]

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum_test::TestServer;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use terraform_registry::api::{router, AppState};
use terraform_registry::auth::{Authenticator, JwtSigner};
use terraform_registry::config::{AppConfig, LocalStorageSettings};
use terraform_registry::crypto::{Cipher, SignatureVerifier};
use terraform_registry::db::api_keys::ApiKeyRepository;
use terraform_registry::db::orgs::OrgRepository;
use terraform_registry::ingest::Ingestor;
use terraform_registry::mirror::{spawn_mirror_scheduler, MirrorEngine};
use terraform_registry::publish::{spawn_publisher_task, ConnectorFactory, Publisher};
use terraform_registry::scm::{
    RepoSummary, ScmConnector, ScmError, ScmKind, TagInfo, TokenGrant, WebhookVerification,
};
use terraform_registry::storage::local::LocalStorage;

/// Stub connector with scriptable tag resolution and HMAC-verified
/// webhooks, mimicking the GitHub wire behavior.
pub struct StubConnector {
    pub tags: Mutex<HashMap<String, String>>,
    pub archive_entries: Mutex<Vec<(String, Vec<u8>)>>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self {
            tags: Mutex::new(HashMap::new()),
            archive_entries: Mutex::new(vec![
                ("repo-head/main.tf".to_string(), b"resource {}".to_vec()),
                ("repo-head/README.md".to_string(), b"# scm module".to_vec()),
            ]),
        }
    }

    pub fn set_tag(&self, tag: &str, commit: &str) {
        self.tags
            .lock()
            .unwrap()
            .insert(tag.to_string(), commit.to_string());
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
    async fn list_tags(&self, _: &str, _: &str, _: u32, _: u32) -> Result<Vec<TagInfo>, ScmError> {
        Ok(self
            .tags
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, commit)| TagInfo {
                tag: tag.clone(),
                commit_sha: commit.clone(),
            })
            .collect())
    }
    async fn resolve_tag_to_commit(&self, _: &str, _: &str, tag: &str) -> Result<String, ScmError> {
        self.tags
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("tag {tag}")))
    }
    async fn fetch_archive(&self, _: &str, _: &str, _: &str) -> Result<Bytes, ScmError> {
        let entries = self.archive_entries.lock().unwrap().clone();
        let pairs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(path, data)| (path.as_str(), data.as_slice()))
            .collect();
        Ok(Bytes::from(tarball(&pairs)))
    }
    fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        shared_secret: &str,
    ) -> WebhookVerification {
        // Same scheme as GitHub: sha256 HMAC over the raw body.
        let Some(signature) = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("sha256="))
        else {
            return WebhookVerification::rejected();
        };
        if signature != hmac_hex(shared_secret, raw_body) {
            return WebhookVerification::rejected();
        }

        #[derive(serde::Deserialize)]
        struct Payload {
            r#ref: Option<String>,
        }
        let tag = serde_json::from_slice::<Payload>(raw_body)
            .ok()
            .and_then(|p| p.r#ref)
            .and_then(|r| r.strip_prefix("refs/tags/").map(str::to_string));
        WebhookVerification {
            ok: true,
            event_kind: Some("push".to_string()),
            delivery_id: headers
                .get("X-GitHub-Delivery")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            tag,
        }
    }
}

pub struct StubFactory {
    pub connector: Arc<StubConnector>,
}

impl ConnectorFactory for StubFactory {
    fn build(
        &self,
        _: &terraform_registry::db::scm::ScmProvider,
    ) -> anyhow::Result<Arc<dyn ScmConnector>> {
        Ok(Arc::clone(&self.connector) as Arc<dyn ScmConnector>)
    }
}

/// Signature verifier that accepts or rejects everything, per test.
pub struct StubVerifier {
    pub accept: bool,
}

#[async_trait]
impl SignatureVerifier for StubVerifier {
    async fn verify_detached(&self, _: &str, _: &[u8], _: &[u8]) -> anyhow::Result<()> {
        if self.accept {
            Ok(())
        } else {
            anyhow::bail!("signature verification failed")
        }
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub pool: SqlitePool,
    pub state: Arc<AppState>,
    pub connector: Arc<StubConnector>,
    pub org_id: String,
    _artifacts: tempfile::TempDir,
}

/// Registry wired for tests: in-memory SQLite, local storage in a
/// tempdir, dev-mode auth, stub connectors.
pub async fn spawn_app() -> TestApp {
    spawn_app_with_verifier(true).await
}

pub async fn spawn_app_with_verifier(accept_signatures: bool) -> TestApp {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    terraform_registry::db::migrate(&pool).await.expect("migrations");

    let orgs = OrgRepository::new(pool.clone());
    let org = orgs
        .create_organization("default", "Default")
        .await
        .expect("default organization");

    let mut config = AppConfig::default();
    config.server.base_url = "http://registry.test".to_string();
    config.auth.dev_mode = true;
    config.jwt.secret = "integration-test-secret".to_string();

    let artifacts = tempfile::tempdir().expect("artifact dir");
    let storage = Arc::new(
        LocalStorage::new(&LocalStorageSettings {
            root_path: artifacts.path().to_string_lossy().to_string(),
            serve_directly: true,
        })
        .expect("local storage"),
    );

    let cipher = Arc::new(Cipher::new(&[11u8; 32]));
    let authenticator = Arc::new(Authenticator::new(
        JwtSigner::new(config.jwt.secret.as_bytes(), Duration::from_secs(3600)),
        ApiKeyRepository::new(pool.clone()),
        orgs,
    ));
    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(&storage) as Arc<dyn terraform_registry::storage::StorageBackend>,
        pool.clone(),
        "default".to_string(),
    ));
    let connector = Arc::new(StubConnector::new());
    let connectors = Arc::new(StubFactory {
        connector: Arc::clone(&connector),
    });
    let publisher = Arc::new(Publisher::new(
        pool.clone(),
        Arc::clone(&ingestor),
        Arc::clone(&connectors) as Arc<dyn ConnectorFactory>,
        Arc::clone(&cipher),
    ));

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    // Leak the sender so background tasks stay alive for the test duration.
    std::mem::forget(_shutdown_tx);
    let publish_queue = spawn_publisher_task(Arc::clone(&publisher), shutdown_rx.clone());

    let engine = Arc::new(MirrorEngine::new(
        pool.clone(),
        Arc::clone(&ingestor),
        Arc::new(StubVerifier {
            accept: accept_signatures,
        }),
        config.mirror.clone(),
    ));
    let mirror = spawn_mirror_scheduler(engine, shutdown_rx);

    let state = Arc::new(AppState {
        config: Arc::new(config),
        pool: pool.clone(),
        storage,
        cipher,
        auth: authenticator,
        ingestor,
        publisher,
        publish_queue,
        mirror,
        connectors,
    });
    let server = TestServer::new(router(Arc::clone(&state))).expect("test server");

    TestApp {
        server,
        pool,
        state,
        connector,
        org_id: org.id,
        _artifacts: artifacts,
    }
}

impl TestApp {
    /// Dev-mode token with the given scopes.
    pub async fn token(&self, scopes: &[&str]) -> String {
        let response = self
            .server
            .post("/api/v1/auth/dev-token")
            .json(&serde_json::json!({
                "sub": "test-user",
                "scopes": scopes,
            }))
            .await;
        assert_eq!(response.status_code(), 200, "dev token issuance failed");
        response.json::<serde_json::Value>()["token"]
            .as_str()
            .expect("token in response")
            .to_string()
    }
}

/// Build a gzipped tarball from (path, contents) pairs.
///
/// Writes the path bytes directly into the header rather than going
/// through `Header::set_path`, since that validates against `..`
/// components and these fixtures intentionally include unsafe paths
/// to exercise the archive inspector's own rejection of them.
pub fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in entries {
        let mut header = tar::Header::new_gnu();
        let name_field = &mut header.as_gnu_mut().unwrap().name;
        let path_bytes = path.as_bytes();
        name_field[..path_bytes.len()].copy_from_slice(path_bytes);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Hex HMAC-SHA256, matching the GitHub-style webhook signature scheme.
pub fn hmac_hex(secret: &str, body: &[u8]) -> String {
    use hmac::Mac;
    let mut mac =
        hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Read entries back out of a gzipped tarball.
pub fn untar(data: &[u8]) -> HashMap<String, Vec<u8>> {
    use std::io::Read;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(data));
    let mut out = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().display().to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        out.insert(path, contents);
    }
    out
}
