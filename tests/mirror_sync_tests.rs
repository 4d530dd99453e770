//! Mirror synchronization against a stubbed upstream registry: happy path,
//! tampered archives, policy denial and approval gating.

mod common;

use axum::extract::Path as AxumPath;
use axum::routing::get;
use axum::Json;
use axum::Router;
use common::{spawn_app, spawn_app_with_verifier, TestApp};
use serde_json::{json, Value};
use std::net::SocketAddr;
use terraform_registry::db::mirrors::{MirrorRepository, NewMirrorConfiguration, NewMirrorPolicy};
use terraform_registry::storage::sha256_hex;

const ARCHIVE_BYTES: &[u8] = b"PK\x03\x04mirrored-provider-binary";

/// Serve a minimal upstream provider registry for `hashicorp/random` with
/// the given versions. When `tamper` is set the served archive bytes do
/// not match the shasums manifest.
async fn spawn_upstream(versions: &[&str], tamper: bool) -> SocketAddr {
    let versions: Vec<String> = versions.iter().map(|v| (*v).to_string()).collect();

    let version_entries: Vec<Value> = versions
        .iter()
        .map(|v| {
            json!({
                "version": v,
                "protocols": ["5.0"],
                "platforms": [{ "os": "linux", "arch": "amd64" }],
            })
        })
        .collect();

    let shasums: String = versions
        .iter()
        .map(|v| {
            format!(
                "{}  terraform-provider-random_{v}_linux_amd64.zip\n",
                sha256_hex(ARCHIVE_BYTES)
            )
        })
        .collect();

    let served_archive: &'static [u8] = if tamper { b"PK\x03\x04tampered" } else { ARCHIVE_BYTES };
    let shasums_clone = shasums.clone();

    let router = Router::new()
        .route(
            "/.well-known/terraform.json",
            get(|| async { Json(json!({ "providers.v1": "/v1/providers/" })) }),
        )
        .route(
            "/v1/providers/hashicorp/random/versions",
            get(move || {
                let entries = version_entries.clone();
                async move { Json(json!({ "versions": entries })) }
            }),
        )
        .route(
            "/v1/providers/hashicorp/random/{version}/download/{os}/{arch}",
            get(
                move |AxumPath((version, os, arch)): AxumPath<(String, String, String)>| async move {
                    Json(json!({
                        "protocols": ["5.0"],
                        "os": os,
                        "arch": arch,
                        "filename": format!("terraform-provider-random_{version}_{os}_{arch}.zip"),
                        "download_url": format!("/files/terraform-provider-random_{version}_{os}_{arch}.zip"),
                        "shasums_url": "/files/terraform-provider-random_SHA256SUMS",
                        "shasums_signature_url": "/files/terraform-provider-random_SHA256SUMS.sig",
                        "shasum": sha256_hex(ARCHIVE_BYTES),
                        "signing_keys": {
                            "gpg_public_keys": [{
                                "key_id": "51852D87348FFC4C",
                                "ascii_armor": "-----BEGIN PGP PUBLIC KEY BLOCK-----\nstub\n-----END PGP PUBLIC KEY BLOCK-----",
                            }],
                        },
                    }))
                },
            ),
        )
        .route(
            "/files/{name}",
            get(move |AxumPath(name): AxumPath<String>| {
                let shasums = shasums_clone.clone();
                async move {
                    if name.ends_with("SHA256SUMS") {
                        shasums.into_bytes()
                    } else if name.ends_with(".sig") {
                        b"detached-signature".to_vec()
                    } else {
                        served_archive.to_vec()
                    }
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn mirror_config(app: &TestApp, upstream: SocketAddr) -> String {
    let repo = MirrorRepository::new(app.pool.clone());
    repo.create_configuration(NewMirrorConfiguration {
        organization_id: app.org_id.clone(),
        upstream_url: format!("http://{upstream}"),
        namespace_filters: vec!["hashicorp".to_string()],
        provider_filters: vec!["random".to_string()],
        sync_interval_seconds: 600,
    })
    .await
    .unwrap()
    .id
}

async fn run_tick(app: &TestApp, config_id: &str) -> terraform_registry::mirror::SyncReport {
    let repo = MirrorRepository::new(app.pool.clone());
    let config = repo.get_configuration(config_id).await.unwrap().unwrap();
    let engine = terraform_registry::mirror::MirrorEngine::new(
        app.pool.clone(),
        std::sync::Arc::clone(&app.state.ingestor),
        std::sync::Arc::new(common::StubVerifier { accept: true }),
        app.state.config.mirror.clone(),
    );
    let (_tx, rx) = tokio::sync::watch::channel(false);
    engine.sync_configuration(&config, &rx).await
}

#[tokio::test]
async fn test_mirror_happy_path() {
    let app = spawn_app().await;
    let upstream = spawn_upstream(&["3.5.0", "3.6.0"], false).await;
    let config_id = mirror_config(&app, upstream).await;

    let report = run_tick(&app, &config_id).await;
    assert_eq!(report.added, 2);
    assert_eq!(report.failed, 0);

    // Both versions are now served through the mirror protocol.
    let index = app
        .server
        .get("/terraform/providers/registry.terraform.io/hashicorp/random/index.json")
        .await;
    assert_eq!(index.status_code(), 200);
    assert_eq!(
        index.json::<Value>(),
        json!({ "versions": { "3.5.0": {}, "3.6.0": {} } })
    );

    // last_sync bookkeeping is updated.
    let repo = MirrorRepository::new(app.pool.clone());
    let config = repo.get_configuration(&config_id).await.unwrap().unwrap();
    assert!(config.last_sync_at.is_some());
    assert!(config.last_sync_status.unwrap().starts_with("ok:"));
}

#[tokio::test]
async fn test_mirror_tick_is_incremental() {
    let app = spawn_app().await;
    let upstream = spawn_upstream(&["3.5.0"], false).await;
    let config_id = mirror_config(&app, upstream).await;

    let first = run_tick(&app, &config_id).await;
    assert_eq!(first.added, 1);

    // A second tick over the same upstream finds nothing new and still
    // completes, updating last_sync.
    let second = run_tick(&app, &config_id).await;
    assert_eq!(second.scanned, 0);
    assert_eq!(second.added, 0);
    assert_eq!(second.failed, 0);
}

#[tokio::test]
async fn test_tampered_archive_is_isolated() {
    let app = spawn_app().await;
    let upstream = spawn_upstream(&["3.5.0"], true).await;
    let config_id = mirror_config(&app, upstream).await;

    let report = run_tick(&app, &config_id).await;
    assert_eq!(report.added, 0);
    assert_eq!(report.failed, 1);

    // No metadata state exists for the tampered version.
    let index = app
        .server
        .get("/terraform/providers/up/hashicorp/random/index.json")
        .await;
    assert_eq!(index.status_code(), 404);

    // The tick itself reports partial success rather than failing.
    let repo = MirrorRepository::new(app.pool.clone());
    let config = repo.get_configuration(&config_id).await.unwrap().unwrap();
    assert!(config.last_sync_status.unwrap().contains("failed=1"));
}

#[tokio::test]
async fn test_signature_failure_blocks_ingest() {
    let app = spawn_app_with_verifier(false).await;
    let upstream = spawn_upstream(&["3.5.0"], false).await;
    let config_id = mirror_config(&app, upstream).await;

    // Engine with a rejecting verifier.
    let repo = MirrorRepository::new(app.pool.clone());
    let config = repo.get_configuration(&config_id).await.unwrap().unwrap();
    let engine = terraform_registry::mirror::MirrorEngine::new(
        app.pool.clone(),
        std::sync::Arc::clone(&app.state.ingestor),
        std::sync::Arc::new(common::StubVerifier { accept: false }),
        app.state.config.mirror.clone(),
    );
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let report = engine.sync_configuration(&config, &rx).await;

    assert_eq!(report.added, 0);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_policy_deny_and_approval_gate() {
    let app = spawn_app().await;
    let upstream = spawn_upstream(&["3.5.0"], false).await;
    let config_id = mirror_config(&app, upstream).await;
    let repo = MirrorRepository::new(app.pool.clone());

    // Deny policy: candidate is skipped without touching the upstream
    // archives.
    let deny = repo
        .create_policy(NewMirrorPolicy {
            organization_id: app.org_id.clone(),
            upstream_url: None,
            namespace_pattern: "hashicorp".to_string(),
            provider_pattern: "*".to_string(),
            action: "deny".to_string(),
            requires_approval: false,
            priority: 1,
        })
        .await
        .unwrap();
    let report = run_tick(&app, &config_id).await;
    assert_eq!(report.denied, 1);
    assert_eq!(report.added, 0);
    repo.delete_policy(&deny.id).await.unwrap();

    // Approval-requiring allow: first tick raises a request and skips.
    repo.create_policy(NewMirrorPolicy {
        organization_id: app.org_id.clone(),
        upstream_url: None,
        namespace_pattern: "*".to_string(),
        provider_pattern: "*".to_string(),
        action: "allow".to_string(),
        requires_approval: true,
        priority: 1,
    })
    .await
    .unwrap();
    let report = run_tick(&app, &config_id).await;
    assert_eq!(report.awaiting_approval, 1);
    assert_eq!(report.added, 0);

    let pending = repo
        .find_approval_request(&config_id, "hashicorp", Some("random"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, "pending");

    // Approve and re-tick: the candidate is ingested.
    repo.review_approval_request(&pending.id, "approved", "admin", None)
        .await
        .unwrap();
    let report = run_tick(&app, &config_id).await;
    assert_eq!(report.added, 1);
}
