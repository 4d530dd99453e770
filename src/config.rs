//! # Configuration
//!
//! Configuration surface for the registry process.
//!
//! Settings are read from a YAML file (path from `--config` or the
//! `REGISTRY_CONFIG` environment variable, default `registry.yaml`) with a
//! small set of environment overrides for secrets so they never need to live
//! in the file:
//!
//! - `DATABASE_URL` - overrides `database.url`
//! - `REGISTRY_JWT_SECRET` - overrides `jwt.secret`
//! - `REGISTRY_ENCRYPTION_KEY` - overrides `encryption.key`
//!
//! A local `.env` is loaded in development via dotenvy before the overrides
//! are applied.

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level process configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageSettings,
    pub auth: AuthConfig,
    pub jwt: JwtConfig,
    pub encryption: EncryptionConfig,
    pub multi_tenancy: MultiTenancyConfig,
    pub mirror: MirrorDefaults,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    /// Public URL used to synthesize absolute redirect URLs,
    /// e.g. `https://registry.example.com`.
    pub base_url: String,
    pub listen_host: String,
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://registry.db?mode=rwc`.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://registry.db?mode=rwc".to_string(),
            max_connections: 16,
        }
    }
}

/// Which object storage backend to construct at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Local,
    Azure,
    S3,
    Gcs,
}

impl std::fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Azure => "azure",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageSettings {
    pub default_backend: StorageBackendKind,
    pub local: LocalStorageSettings,
    pub s3: S3StorageSettings,
    pub gcs: GcsStorageSettings,
    pub azure: AzureStorageSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            default_backend: StorageBackendKind::Local,
            local: LocalStorageSettings::default(),
            s3: S3StorageSettings::default(),
            gcs: GcsStorageSettings::default(),
            azure: AzureStorageSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LocalStorageSettings {
    pub root_path: String,
    /// When enabled, downloads are served by this process under `/v1/files/`.
    /// When disabled, local signed-URL resolution fails and callers stream
    /// via the backend directly.
    pub serve_directly: bool,
}

impl Default for LocalStorageSettings {
    fn default() -> Self {
        Self {
            root_path: "./data/artifacts".to_string(),
            serve_directly: true,
        }
    }
}

/// Credential selection per backend. `default` means the platform chain
/// (instance profile, workload identity, ambient environment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageAuthMethod {
    #[default]
    Default,
    Static,
    Oidc,
    AssumeRole,
    ServiceAccount,
    WorkloadIdentity,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct S3StorageSettings {
    pub bucket: String,
    pub region: String,
    /// Non-AWS S3-compatible endpoint, e.g. MinIO.
    pub endpoint: Option<String>,
    pub auth_method: StorageAuthMethod,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GcsStorageSettings {
    pub bucket: String,
    pub auth_method: StorageAuthMethod,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AzureStorageSettings {
    pub account: String,
    pub container: String,
    /// Base64 Shared Key. Sealed by the Cipher when persisted in the
    /// storage_configurations table; plaintext here is for file-based boot.
    pub account_key: Option<String>,
    /// Override for Azurite or sovereign clouds.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AuthConfig {
    /// When enabled, `POST /api/v1/auth/dev-token` issues a short-lived JWT
    /// for an arbitrary principal without completing an OIDC flow. Never
    /// enable outside local development.
    pub dev_mode: bool,
    /// Session token lifetime in seconds.
    pub token_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            token_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct JwtConfig {
    /// HMAC key for session tokens.
    pub secret: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EncryptionConfig {
    /// 32-byte Cipher key, hex (64 chars) or base64 encoded.
    pub key: String,
}

impl EncryptionConfig {
    /// Decode the configured key into raw bytes.
    pub fn key_bytes(&self) -> Result<[u8; 32]> {
        if self.key.is_empty() {
            bail!("encryption.key is required (32 bytes, hex or base64)");
        }
        let decoded = if self.key.len() == 64 && self.key.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(&self.key).context("invalid hex encryption key")?
        } else {
            base64::engine::general_purpose::STANDARD
                .decode(&self.key)
                .context("invalid base64 encryption key")?
        };
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("encryption.key must decode to exactly 32 bytes"))?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MultiTenancyConfig {
    pub enabled: bool,
    /// Organization slug that owns unqualified uploads when multi-tenancy
    /// is disabled.
    pub default_organization: String,
}

impl Default for MultiTenancyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_organization: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MirrorDefaults {
    /// Scheduler tick interval in seconds.
    pub tick_interval_seconds: u64,
    /// Maximum configurations synced concurrently.
    pub concurrency: usize,
    /// Per-tick cap on downloaded platform archives per configuration.
    pub max_archives_per_tick: usize,
}

impl Default for MirrorDefaults {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 600,
            concurrency: 4,
            max_archives_per_tick: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "terraform_registry=info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(secret) = std::env::var("REGISTRY_JWT_SECRET") {
            self.jwt.secret = secret;
        }
        if let Ok(key) = std::env::var("REGISTRY_ENCRYPTION_KEY") {
            self.encryption.key = key;
        }
    }

    /// Absolute URL under the configured public base.
    #[must_use]
    pub fn absolute_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.server.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = AppConfig::default();
        assert_eq!(config.server.listen_port, 8080);
        assert_eq!(config.storage.default_backend, StorageBackendKind::Local);
        assert_eq!(config.mirror.tick_interval_seconds, 600);
        assert_eq!(config.mirror.concurrency, 4);
    }

    #[test]
    fn test_parse_yaml_subset() {
        let yaml = r"
server:
  base_url: https://registry.example.com
  listen_port: 9000
storage:
  default_backend: s3
  s3:
    bucket: artifacts
    region: eu-west-1
";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.base_url, "https://registry.example.com");
        assert_eq!(config.server.listen_port, 9000);
        assert_eq!(config.storage.default_backend, StorageBackendKind::S3);
        assert_eq!(config.storage.s3.bucket, "artifacts");
        // Unspecified sections fall back to defaults.
        assert_eq!(config.database.max_connections, 16);
    }

    #[test]
    fn test_encryption_key_hex_and_base64() {
        let hex_key = "00".repeat(32);
        let config = EncryptionConfig { key: hex_key };
        assert_eq!(config.key_bytes().unwrap(), [0u8; 32]);

        let b64 = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let config = EncryptionConfig { key: b64 };
        assert_eq!(config.key_bytes().unwrap(), [7u8; 32]);

        let config = EncryptionConfig {
            key: "too-short".to_string(),
        };
        assert!(config.key_bytes().is_err());
    }

    #[test]
    fn test_absolute_url_joining() {
        let mut config = AppConfig::default();
        config.server.base_url = "https://registry.example.com/".to_string();
        assert_eq!(
            config.absolute_url("/v1/files/modules/a.tar.gz"),
            "https://registry.example.com/v1/files/modules/a.tar.gz"
        );
    }
}
