//! Provider upload, protocol listing, download document and the network
//! mirror protocol synthesis.

mod common;

use axum_test::multipart::{MultipartForm, Part};
use common::spawn_app;
use serde_json::{json, Value};

fn provider_form(version: &str, os: &str, arch: &str) -> MultipartForm {
    let filename = format!("terraform-provider-random_v{version}_{os}_{arch}.zip");
    MultipartForm::new()
        .add_text("namespace", "hashicorp")
        .add_text("type", "random")
        .add_text("version", version)
        .add_text("os", os)
        .add_text("arch", arch)
        .add_text("protocols", "5.0,6.0")
        .add_part(
            "file",
            Part::bytes(format!("PK\x03\x04{os}-{arch}-binary").into_bytes())
                .file_name(filename)
                .mime_type("application/zip"),
        )
}

#[tokio::test]
async fn test_provider_upload_listing_and_download() {
    let app = spawn_app().await;
    let token = app.token(&["providers:write"]).await;

    for (os, arch) in [("linux", "amd64"), ("darwin", "arm64")] {
        let response = app
            .server
            .post("/api/v1/providers")
            .authorization_bearer(&token)
            .multipart(provider_form("3.6.0", os, arch))
            .await;
        assert_eq!(response.status_code(), 201);
    }

    // Listing carries version, protocols and platform pairs, no URLs.
    let listing = app.server.get("/v1/providers/hashicorp/random/versions").await;
    assert_eq!(listing.status_code(), 200);
    let body = listing.json::<Value>();
    let version = &body["versions"][0];
    assert_eq!(version["version"], "3.6.0");
    assert_eq!(version["protocols"], json!(["5.0", "6.0"]));
    let platforms = version["platforms"].as_array().unwrap();
    assert_eq!(platforms.len(), 2);
    assert!(platforms.iter().all(|p| p.get("url").is_none()));

    // Download document.
    let download = app
        .server
        .get("/v1/providers/hashicorp/random/3.6.0/download/linux/amd64")
        .await;
    assert_eq!(download.status_code(), 200);
    let doc = download.json::<Value>();
    assert_eq!(doc["os"], "linux");
    assert_eq!(doc["arch"], "amd64");
    assert_eq!(
        doc["filename"],
        "terraform-provider-random_v3.6.0_linux_amd64.zip"
    );
    assert!(doc["download_url"].as_str().unwrap().contains("/v1/files/"));
    assert_eq!(doc["shasum"].as_str().unwrap().len(), 64);

    // Unknown platform is a 404.
    let missing = app
        .server
        .get("/v1/providers/hashicorp/random/3.6.0/download/windows/386")
        .await;
    assert_eq!(missing.status_code(), 404);
}

#[tokio::test]
async fn test_duplicate_platform_rejected() {
    let app = spawn_app().await;
    let token = app.token(&["providers:write"]).await;

    let first = app
        .server
        .post("/api/v1/providers")
        .authorization_bearer(&token)
        .multipart(provider_form("3.6.0", "linux", "amd64"))
        .await;
    assert_eq!(first.status_code(), 201);

    let replay = app
        .server
        .post("/api/v1/providers")
        .authorization_bearer(&token)
        .multipart(provider_form("3.6.0", "linux", "amd64"))
        .await;
    assert_eq!(replay.status_code(), 409);
    assert_eq!(replay.json::<Value>(), json!({ "error": "version_exists" }));
}

#[tokio::test]
async fn test_non_zip_payload_rejected() {
    let app = spawn_app().await;
    let token = app.token(&["providers:write"]).await;

    let form = MultipartForm::new()
        .add_text("namespace", "hashicorp")
        .add_text("type", "random")
        .add_text("version", "3.6.0")
        .add_text("os", "linux")
        .add_text("arch", "amd64")
        .add_part(
            "file",
            Part::bytes(b"ELF not a zip".to_vec())
                .file_name("terraform-provider-random_v3.6.0_linux_amd64.zip"),
        );
    let response = app
        .server
        .post("/api/v1/providers")
        .authorization_bearer(&token)
        .multipart(form)
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_mirror_protocol_documents() {
    let app = spawn_app().await;
    let token = app.token(&["providers:write"]).await;

    for version in ["3.5.0", "3.6.0"] {
        let response = app
            .server
            .post("/api/v1/providers")
            .authorization_bearer(&token)
            .multipart(provider_form(version, "linux", "amd64"))
            .await;
        assert_eq!(response.status_code(), 201);
    }

    // index.json aggregates all versions regardless of origin; the mirror
    // protocol needs no authentication.
    let index = app
        .server
        .get("/terraform/providers/registry.test/hashicorp/random/index.json")
        .await;
    assert_eq!(index.status_code(), 200);
    assert_eq!(
        index.json::<Value>(),
        json!({ "versions": { "3.5.0": {}, "3.6.0": {} } })
    );

    // Per-version archives with sha256-prefixed hashes and resolvable URLs.
    let platform_index = app
        .server
        .get("/terraform/providers/registry.test/hashicorp/random/3.6.0.json")
        .await;
    assert_eq!(platform_index.status_code(), 200);
    let body = platform_index.json::<Value>();
    let entry = &body["archives"]["linux_amd64"];
    assert!(entry["url"].as_str().unwrap().contains("/v1/files/"));
    let hash = entry["hashes"][0].as_str().unwrap();
    assert!(hash.starts_with("sha256:"));

    // Unknown documents 404.
    let missing = app
        .server
        .get("/terraform/providers/registry.test/hashicorp/random/9.9.9.json")
        .await;
    assert_eq!(missing.status_code(), 404);
}
