//! # Server
//!
//! Wires configuration into the component graph (database, storage,
//! cipher, authenticator, ingestor, publisher, mirror scheduler), then
//! serves the assembled router until a shutdown signal arrives. Background
//! tasks get 15 seconds to flush after the signal.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{router, AppState};
use crate::auth::{scopes, Authenticator, JwtSigner};
use crate::config::AppConfig;
use crate::crypto::{Cipher, GpgCliVerifier};
use crate::db;
use crate::db::api_keys::ApiKeyRepository;
use crate::db::orgs::OrgRepository;
use crate::ingest::Ingestor;
use crate::mirror::{spawn_mirror_scheduler, MirrorEngine};
use crate::publish::{spawn_publisher_task, DefaultConnectorFactory, Publisher};
use crate::storage::build_backend;

/// Grace period between the shutdown signal and hard stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// System role templates seeded at boot. These rows are immutable.
const SYSTEM_ROLE_TEMPLATES: &[(&str, &[&str])] = &[
    ("administrator", &[scopes::ADMIN]),
    (
        "publisher",
        &[
            scopes::MODULES_READ,
            scopes::MODULES_WRITE,
            scopes::PROVIDERS_READ,
            scopes::PROVIDERS_WRITE,
        ],
    ),
    (
        "reader",
        &[
            scopes::MODULES_READ,
            scopes::PROVIDERS_READ,
            scopes::MIRRORS_READ,
            scopes::ORGANIZATIONS_READ,
        ],
    ),
];

/// Build the full component graph from configuration.
///
/// Returns the shared state plus the shutdown sender that stops the
/// background tasks.
pub async fn bootstrap(config: AppConfig) -> Result<(Arc<AppState>, watch::Sender<bool>)> {
    let config = Arc::new(config);

    let pool = db::connect(&config.database.url, config.database.max_connections).await?;

    // Default organization and system role templates exist before the first
    // request.
    let orgs = OrgRepository::new(pool.clone());
    let default_org = orgs
        .ensure_organization(
            &config.multi_tenancy.default_organization,
            &config.multi_tenancy.default_organization,
        )
        .await
        .context("failed to ensure default organization")?;
    for (name, scope_list) in SYSTEM_ROLE_TEMPLATES {
        if orgs.find_role_template_by_name(None, name).await?.is_none() {
            let scope_strings: Vec<String> =
                scope_list.iter().map(|s| (*s).to_string()).collect();
            orgs.create_role_template(None, name, &scope_strings, true)
                .await?;
        }
    }
    info!(organization = %default_org.slug, "default organization ready");

    let key = config
        .encryption
        .key_bytes()
        .context("encryption.key is invalid")?;
    let cipher = Arc::new(Cipher::new(&key));

    if config.jwt.secret.is_empty() {
        anyhow::bail!("jwt.secret is required");
    }
    let authenticator = Arc::new(Authenticator::new(
        JwtSigner::new(
            config.jwt.secret.as_bytes(),
            Duration::from_secs(config.auth.token_ttl_seconds),
        ),
        ApiKeyRepository::new(pool.clone()),
        orgs,
    ));

    let storage = build_backend(&config.storage)
        .await
        .context("failed to construct storage backend")?;
    info!(backend = storage.name(), "storage backend ready");

    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(&storage),
        pool.clone(),
        config.multi_tenancy.default_organization.clone(),
    ));

    let connectors: Arc<dyn crate::publish::ConnectorFactory> =
        Arc::new(DefaultConnectorFactory::new(Arc::clone(&cipher)));
    let publisher = Arc::new(Publisher::new(
        pool.clone(),
        Arc::clone(&ingestor),
        Arc::clone(&connectors),
        Arc::clone(&cipher),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publish_queue = spawn_publisher_task(Arc::clone(&publisher), shutdown_rx.clone());

    let mirror_engine = Arc::new(MirrorEngine::new(
        pool.clone(),
        Arc::clone(&ingestor),
        Arc::new(GpgCliVerifier),
        config.mirror.clone(),
    ));
    let mirror = spawn_mirror_scheduler(mirror_engine, shutdown_rx);

    let state = Arc::new(AppState {
        config,
        pool,
        storage,
        cipher,
        auth: authenticator,
        ingestor,
        publisher,
        publish_queue,
        mirror,
        connectors,
    });
    Ok((state, shutdown_tx))
}

/// Bootstrap and serve until SIGTERM or ctrl-c.
pub async fn run(config: AppConfig) -> Result<()> {
    let listen = format!("{}:{}", config.server.listen_host, config.server.listen_port);
    let (state, shutdown_tx) = bootstrap(config).await?;
    let app = router(state);

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("registry listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Tell background tasks to flush; give them the grace period.
    if shutdown_tx.send(true).is_err() {
        warn!("background tasks already gone at shutdown");
    }
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("registry stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
