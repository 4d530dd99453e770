//! # Terraform Registry Server
//!
//! Entry point: load configuration, initialize logging and metrics, run
//! the server until a shutdown signal.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use terraform_registry::config::AppConfig;
use terraform_registry::observability;
use terraform_registry::server;

#[tokio::main]
async fn main() -> Result<()> {
    // A local .env is a development convenience; absence is fine.
    let _ = dotenvy::dotenv();

    let config_path = config_path();
    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    observability::init_tracing(&config.logging);
    observability::metrics::register_metrics()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "starting terraform registry"
    );
    server::run(config).await
}

/// `--config <path>` wins over `REGISTRY_CONFIG`; a bare `registry.yaml`
/// next to the process is picked up when present.
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    if let Ok(path) = std::env::var("REGISTRY_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from("registry.yaml");
    default.exists().then_some(default)
}
