//! # Metrics
//!
//! Prometheus metrics for monitoring the registry.
//!
//! ## Metrics Exposed
//!
//! - `registry_module_downloads_total` - Module archive downloads served
//! - `registry_provider_downloads_total` - Provider archive downloads served
//! - `registry_module_ingest_total` - Module ingest attempts by outcome
//! - `registry_provider_ingest_total` - Provider ingest attempts by outcome
//! - `registry_webhook_deliveries_total` - Inbound webhook deliveries by verification result
//! - `registry_publish_total` - SCM publish attempts by outcome
//! - `registry_mirror_ticks_total` - Completed mirror sync ticks
//! - `registry_mirror_tick_duration_seconds` - Duration of mirror sync ticks
//! - `registry_mirror_items_total` - Per-candidate mirror outcomes

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static MODULE_DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_module_downloads_total",
        "Total number of module archive downloads served",
    )
    .expect("Failed to create MODULE_DOWNLOADS_TOTAL metric - this should never happen")
});

static PROVIDER_DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_provider_downloads_total",
        "Total number of provider archive downloads served",
    )
    .expect("Failed to create PROVIDER_DOWNLOADS_TOTAL metric - this should never happen")
});

static MODULE_INGEST_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "registry_module_ingest_total",
            "Total number of module ingest attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create MODULE_INGEST_TOTAL metric - this should never happen")
});

static PROVIDER_INGEST_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "registry_provider_ingest_total",
            "Total number of provider ingest attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create PROVIDER_INGEST_TOTAL metric - this should never happen")
});

static WEBHOOK_DELIVERIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "registry_webhook_deliveries_total",
            "Total number of inbound webhook deliveries by verification result",
        ),
        &["verified"],
    )
    .expect("Failed to create WEBHOOK_DELIVERIES_TOTAL metric - this should never happen")
});

static PUBLISH_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "registry_publish_total",
            "Total number of SCM publish attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create PUBLISH_TOTAL metric - this should never happen")
});

static MIRROR_TICKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_mirror_ticks_total",
        "Total number of completed mirror sync ticks",
    )
    .expect("Failed to create MIRROR_TICKS_TOTAL metric - this should never happen")
});

static MIRROR_TICK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "registry_mirror_tick_duration_seconds",
            "Duration of mirror sync ticks in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 600.0]),
    )
    .expect("Failed to create MIRROR_TICK_DURATION metric - this should never happen")
});

static MIRROR_ITEMS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "registry_mirror_items_total",
            "Per-candidate mirror outcomes (added, failed, denied, awaiting_approval)",
        ),
        &["outcome"],
    )
    .expect("Failed to create MIRROR_ITEMS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    // Prometheus Registry::register() takes ownership (Box<dyn Collector>)
    // Since metrics are stored in LazyLock, we must clone them; metric data
    // is shared via Arc, so the clone is a cheap wrapper copy at startup.
    REGISTRY.register(Box::new(MODULE_DOWNLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_DOWNLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MODULE_INGEST_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_INGEST_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_DELIVERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MIRROR_TICKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MIRROR_TICK_DURATION.clone()))?;
    REGISTRY.register(Box::new(MIRROR_ITEMS_TOTAL.clone()))?;

    Ok(())
}

/// Gather all registered metric families for the `/metrics` endpoint.
#[must_use]
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn increment_module_downloads() {
    MODULE_DOWNLOADS_TOTAL.inc();
}

pub fn increment_provider_downloads() {
    PROVIDER_DOWNLOADS_TOTAL.inc();
}

pub fn record_module_ingest(outcome: &str) {
    MODULE_INGEST_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_provider_ingest(outcome: &str) {
    PROVIDER_INGEST_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_webhook_delivery(verified: bool) {
    let label = if verified { "true" } else { "false" };
    WEBHOOK_DELIVERIES_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_publish(outcome: &str) {
    PUBLISH_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn increment_mirror_ticks() {
    MIRROR_TICKS_TOTAL.inc();
}

pub fn observe_mirror_tick_duration(duration: f64) {
    MIRROR_TICK_DURATION.observe(duration);
}

pub fn record_mirror_item(outcome: &str) {
    MIRROR_ITEMS_TOTAL.with_label_values(&[outcome]).inc();
}
