//! # Mirror Sync Scheduler
//!
//! A single long-lived task that walks enabled mirror configurations on a
//! fixed tick, pulls provider deltas from their upstream registries,
//! verifies checksums and GPG signatures, applies mirror policies and
//! approval gates, and ingests what survives.
//!
//! Per configuration the engine moves through
//! `scanning -> downloading -> verifying -> committing`; every per-provider
//! failure is logged with its (provider, version) context and never aborts
//! the outer loop. Ticks for distinct configurations run on a small bounded
//! pool; ticks for one configuration never overlap. A manual trigger
//! coalesces with the next tick instead of preempting a running one.

use rand::Rng;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::MirrorDefaults;
use crate::crypto::SignatureVerifier;
use crate::db::mirrors::{MirrorConfiguration, MirrorRepository};
use crate::db::providers::ProviderRepository;
use crate::error::RegistryError;
use crate::ingest::{Ingestor, ProviderUpload};
use crate::observability::metrics;
use crate::storage::sha256_hex;

pub mod policy;
pub mod upstream;

use policy::PolicyDecision;
use upstream::{parse_shasums, UpstreamRegistry, UpstreamVersion};

/// Principal recorded on approval requests raised by the scheduler.
const SCHEDULER_PRINCIPAL: &str = "mirror-scheduler";

/// Outcome counts for one configuration tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub scanned: usize,
    pub added: usize,
    pub failed: usize,
    pub denied: usize,
    pub awaiting_approval: usize,
    /// True when a shutdown signal cut the tick short.
    pub interrupted: bool,
}

impl SyncReport {
    #[must_use]
    pub fn status_line(&self) -> String {
        if self.interrupted {
            format!(
                "interrupted: added={} failed={} denied={} awaiting_approval={}",
                self.added, self.failed, self.denied, self.awaiting_approval
            )
        } else {
            format!(
                "ok: added={} failed={} denied={} awaiting_approval={}",
                self.added, self.failed, self.denied, self.awaiting_approval
            )
        }
    }
}

/// The sync engine, shared by the scheduler task and manual triggers.
pub struct MirrorEngine {
    pool: SqlitePool,
    ingestor: Arc<Ingestor>,
    verifier: Arc<dyn SignatureVerifier>,
    defaults: MirrorDefaults,
}

impl std::fmt::Debug for MirrorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorEngine")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl MirrorEngine {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        ingestor: Arc<Ingestor>,
        verifier: Arc<dyn SignatureVerifier>,
        defaults: MirrorDefaults,
    ) -> Self {
        Self {
            pool,
            ingestor,
            verifier,
            defaults,
        }
    }

    /// Run one sync pass for a configuration and record the result.
    #[instrument(skip(self, config, shutdown), fields(mirror = %config.id, upstream = %config.upstream_url))]
    pub async fn sync_configuration(
        &self,
        config: &MirrorConfiguration,
        shutdown: &watch::Receiver<bool>,
    ) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::default();
        let mirrors = MirrorRepository::new(self.pool.clone());
        let upstream = UpstreamRegistry::new(&config.upstream_url);

        let policies = match mirrors.list_policies(&config.organization_id).await {
            Ok(policies) => policies,
            Err(error) => {
                warn!(%error, "failed to load mirror policies; skipping tick");
                return report;
            }
        };

        debug!("scanning upstream for candidates");
        let candidates = match self.scan(config, &upstream).await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(%error, "upstream scan failed");
                let _ = mirrors
                    .record_sync_result(&config.id, &format!("failed: {error}"))
                    .await;
                return report;
            }
        };
        report.scanned = candidates.len();

        let mut archives_this_tick = 0usize;
        for (namespace, provider_type, version) in candidates {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            if archives_this_tick >= self.defaults.max_archives_per_tick {
                debug!("per-tick archive cap reached; remaining candidates wait for the next tick");
                break;
            }

            match policy::evaluate(&policies, &config.upstream_url, &namespace, &provider_type) {
                PolicyDecision::Deny => {
                    metrics::record_mirror_item("denied");
                    report.denied += 1;
                    continue;
                }
                PolicyDecision::RequiresApproval => {
                    let approved = mirrors
                        .find_approval_request(&config.id, &namespace, Some(&provider_type))
                        .await
                        .ok()
                        .flatten()
                        .is_some_and(|r| r.status == "approved");
                    if !approved {
                        if let Err(error) = mirrors
                            .ensure_approval_request(
                                &config.id,
                                &namespace,
                                Some(&provider_type),
                                SCHEDULER_PRINCIPAL,
                            )
                            .await
                        {
                            warn!(%error, "failed to raise approval request");
                        }
                        metrics::record_mirror_item("awaiting_approval");
                        report.awaiting_approval += 1;
                        continue;
                    }
                }
                PolicyDecision::Allow => {}
            }

            match self
                .sync_candidate(config, &upstream, &namespace, &provider_type, &version, shutdown)
                .await
            {
                Ok(archives) => {
                    archives_this_tick += archives;
                    metrics::record_mirror_item("added");
                    report.added += 1;
                }
                Err(error) => {
                    // Per-item isolation: log with context, keep going.
                    warn!(
                        namespace = %namespace,
                        provider = %provider_type,
                        version = %version.version,
                        %error,
                        "mirror candidate failed"
                    );
                    metrics::record_mirror_item("failed");
                    report.failed += 1;
                }
            }
        }

        if !report.interrupted {
            if let Err(error) = mirrors
                .record_sync_result(&config.id, &report.status_line())
                .await
            {
                warn!(%error, "failed to record sync result");
            }
        }
        metrics::increment_mirror_ticks();
        metrics::observe_mirror_tick_duration(started.elapsed().as_secs_f64());
        info!(
            added = report.added,
            failed = report.failed,
            denied = report.denied,
            awaiting_approval = report.awaiting_approval,
            "mirror tick finished"
        );
        report
    }

    /// Enumerate candidate (namespace, provider, version) tuples not yet
    /// present in metadata.
    async fn scan(
        &self,
        config: &MirrorConfiguration,
        upstream: &UpstreamRegistry,
    ) -> anyhow::Result<Vec<(String, String, UpstreamVersion)>> {
        let providers_repo = ProviderRepository::new(self.pool.clone());
        let namespaces = config.namespace_filter_list();
        if namespaces.is_empty() {
            // An unbounded walk of a public registry is never intended.
            anyhow::bail!("mirror configuration has no namespace filters");
        }
        let provider_filters = config.provider_filter_list();

        let mut pairs: Vec<(String, String)> = Vec::new();
        for namespace in &namespaces {
            if provider_filters.is_empty() {
                for summary in upstream.list_providers(namespace).await? {
                    pairs.push((summary.namespace, summary.provider_type));
                }
            } else {
                for provider_type in &provider_filters {
                    pairs.push((namespace.clone(), provider_type.clone()));
                }
            }
        }

        let mut candidates = Vec::new();
        for (namespace, provider_type) in pairs {
            let known = providers_repo.find(&namespace, &provider_type).await?;
            let versions = upstream.list_versions(&namespace, &provider_type).await?;
            for version in versions {
                let present = match &known {
                    Some(provider) => providers_repo
                        .find_version(&provider.id, &version.version)
                        .await?
                        .is_some(),
                    None => false,
                };
                if !present {
                    candidates.push((namespace.clone(), provider_type.clone(), version));
                }
            }
        }
        Ok(candidates)
    }

    /// Download, verify and commit one provider version. Returns the number
    /// of platform archives ingested.
    async fn sync_candidate(
        &self,
        config: &MirrorConfiguration,
        upstream: &UpstreamRegistry,
        namespace: &str,
        provider_type: &str,
        version: &UpstreamVersion,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<usize> {
        if version.platforms.is_empty() {
            anyhow::bail!("upstream lists no platforms for {}", version.version);
        }

        debug!(version = %version.version, "downloading platform documents");
        let mut downloads = Vec::with_capacity(version.platforms.len());
        for platform in &version.platforms {
            let info = upstream
                .download_info(
                    namespace,
                    provider_type,
                    &version.version,
                    &platform.os,
                    &platform.arch,
                )
                .await?;
            downloads.push(info);
        }

        // One shasums manifest and signature cover every platform of the
        // version; verify once before touching any archive.
        let first = &downloads[0];
        let signing_key = first
            .signing_keys
            .gpg_public_keys
            .first()
            .ok_or_else(|| anyhow::anyhow!("upstream download document carries no signing key"))?
            .clone();
        let shasums_bytes = upstream.fetch(&first.shasums_url).await?;
        let signature = upstream.fetch(&first.shasums_signature_url).await?;

        debug!(version = %version.version, "verifying shasums signature");
        self.verifier
            .verify_detached(&signing_key.ascii_armor, &shasums_bytes, &signature)
            .await?;
        let shasums = parse_shasums(&String::from_utf8_lossy(&shasums_bytes));

        let mut ingested = 0usize;
        for info in &downloads {
            if *shutdown.borrow() {
                anyhow::bail!("shutdown during download");
            }
            let archive = upstream.fetch(&info.download_url).await?;
            let digest = sha256_hex(&archive);
            let expected = shasums.get(&info.filename).ok_or_else(|| {
                anyhow::anyhow!("{} is missing from the shasums manifest", info.filename)
            })?;
            if digest != *expected {
                anyhow::bail!(
                    "checksum mismatch for {}: manifest says {expected}, archive hashes to {digest}",
                    info.filename
                );
            }

            debug!(filename = %info.filename, "committing platform archive");
            let result = self
                .ingestor
                .ingest_provider(ProviderUpload {
                    namespace: namespace.to_string(),
                    provider_type: provider_type.to_string(),
                    version: version.version.clone(),
                    os: info.os.clone(),
                    arch: info.arch.clone(),
                    filename: info.filename.clone(),
                    protocols: if info.protocols.is_empty() {
                        version.protocols.clone()
                    } else {
                        info.protocols.clone()
                    },
                    gpg_public_key: Some(signing_key.ascii_armor.clone()),
                    gpg_key_id: signing_key.key_id.clone(),
                    shasums_url: Some(first.shasums_url.clone()),
                    shasums_signature_url: Some(first.shasums_signature_url.clone()),
                    published_by: Some(SCHEDULER_PRINCIPAL.to_string()),
                    organization_id: Some(config.organization_id.clone()),
                    mirror_configuration_id: Some(config.id.clone()),
                    data: archive,
                })
                .await;
            match result {
                Ok(_) => ingested += 1,
                // Another tick or registry got there first.
                Err(RegistryError::VersionExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(ingested)
    }
}

/// Handle for requesting an immediate scan.
#[derive(Clone, Debug)]
pub struct MirrorHandle {
    trigger: Arc<Notify>,
}

impl MirrorHandle {
    /// Coalesces: multiple triggers before the next scan collapse into one.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }
}

/// Spawn the scheduler loop. Due configurations run on a bounded pool; a
/// uniform 0-10% jitter is applied to each tick so fleets of registries do
/// not stampede a shared upstream.
pub fn spawn_mirror_scheduler(
    engine: Arc<MirrorEngine>,
    shutdown: watch::Receiver<bool>,
) -> MirrorHandle {
    let trigger = Arc::new(Notify::new());
    let handle = MirrorHandle {
        trigger: Arc::clone(&trigger),
    };

    tokio::spawn(async move {
        let tick = Duration::from_secs(engine.defaults.tick_interval_seconds.max(1));
        let mut shutdown_rx = shutdown.clone();
        loop {
            let jitter = {
                let max_jitter = (tick.as_secs() / 10).max(1);
                Duration::from_secs(rand::thread_rng().gen_range(0..max_jitter))
            };
            let forced = tokio::select! {
                () = tokio::time::sleep(tick + jitter) => false,
                () = trigger.notified() => true,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("mirror scheduler shutting down");
                        return;
                    }
                    continue;
                }
            };

            let configs = match MirrorRepository::new(engine.pool.clone())
                .list_enabled_configurations()
                .await
            {
                Ok(configs) => configs,
                Err(error) => {
                    warn!(%error, "failed to list mirror configurations");
                    continue;
                }
            };

            let now = crate::db::now();
            let due: Vec<_> = configs
                .into_iter()
                .filter(|c| forced || c.is_due(now))
                .collect();
            if due.is_empty() {
                continue;
            }
            info!(count = due.len(), forced, "starting mirror ticks");

            let semaphore = Arc::new(Semaphore::new(engine.defaults.concurrency.max(1)));
            let mut tasks = JoinSet::new();
            for config in due {
                let engine = Arc::clone(&engine);
                let semaphore = Arc::clone(&semaphore);
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    engine.sync_configuration(&config, &shutdown).await;
                });
            }
            while tasks.join_next().await.is_some() {}
        }
    });

    handle
}
