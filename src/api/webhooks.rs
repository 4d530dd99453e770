//! SCM webhook receiver.
//!
//! Hardening contract: signature failures never retry and never emit a 500.
//! Every delivery, verified or not, is acknowledged with 204 and recorded
//! in the append-only webhook event log; only verified tag pushes matching
//! the link's tag filter reach the publisher queue.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db::scm::ScmRepository;
use crate::mirror::policy::glob_matches;
use crate::observability::metrics;
use crate::publish::PublishRequest;
use crate::scm::constant_time_eq;
use crate::storage::sha256_hex;

use super::AppState;

/// `POST /webhooks/scm/{link_id}/{webhook_secret}`
#[instrument(skip(state, headers, body), fields(link_id))]
pub async fn receive(
    State(state): State<Arc<AppState>>,
    Path((link_id, webhook_secret)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    // The handler resolves everything itself so that every failure branch
    // can fall through to the same silent 204.
    let body_hash = sha256_hex(&body);
    let scm = ScmRepository::new(state.pool.clone());

    let link = match scm.get_link(&link_id).await {
        Ok(Some(link)) if link.active => link,
        Ok(_) => {
            info!("webhook for unknown or inactive link");
            metrics::record_webhook_delivery(false);
            return StatusCode::NO_CONTENT;
        }
        Err(error) => {
            warn!(%error, "webhook link lookup failed");
            return StatusCode::NO_CONTENT;
        }
    };

    // The URL path secret is the first authentication factor.
    if !constant_time_eq(webhook_secret.as_bytes(), link.webhook_secret.as_bytes()) {
        record_rejected(&scm, &link.id, &body_hash, "path secret mismatch").await;
        return StatusCode::NO_CONTENT;
    }

    let provider = match scm.get_provider(&link.scm_provider_id).await {
        Ok(Some(provider)) if provider.active => provider,
        _ => {
            record_rejected(&scm, &link.id, &body_hash, "provider missing or inactive").await;
            return StatusCode::NO_CONTENT;
        }
    };
    let connector = match state.connectors.build(&provider) {
        Ok(connector) => connector,
        Err(error) => {
            warn!(%error, "failed to build connector for webhook");
            record_rejected(&scm, &link.id, &body_hash, "connector construction failed").await;
            return StatusCode::NO_CONTENT;
        }
    };

    let verification = connector.verify_webhook(&body, &headers, &link.webhook_secret);
    metrics::record_webhook_delivery(verification.ok);
    if !verification.ok {
        // Mis-signed deliveries must leave zero side effects beyond the
        // audit row.
        info!("webhook signature verification failed");
        let _ = scm
            .record_webhook_event(
                Some(&link.id),
                None,
                &body_hash,
                false,
                None,
                "rejected: invalid signature",
            )
            .await;
        return StatusCode::NO_CONTENT;
    }

    let Some(tag) = verification.tag.clone() else {
        let _ = scm
            .record_webhook_event(
                Some(&link.id),
                verification.delivery_id.as_deref(),
                &body_hash,
                true,
                verification.event_kind.as_deref(),
                "ignored: not a tag push",
            )
            .await;
        return StatusCode::NO_CONTENT;
    };

    if !glob_matches(&link.tag_filter, &tag) {
        let _ = scm
            .record_webhook_event(
                Some(&link.id),
                verification.delivery_id.as_deref(),
                &body_hash,
                true,
                verification.event_kind.as_deref(),
                &format!("ignored: tag {tag} does not match filter {}", link.tag_filter),
            )
            .await;
        return StatusCode::NO_CONTENT;
    }

    let event = match scm
        .record_webhook_event(
            Some(&link.id),
            verification.delivery_id.as_deref(),
            &body_hash,
            true,
            verification.event_kind.as_deref(),
            "queued",
        )
        .await
    {
        Ok(event) => event,
        Err(error) => {
            warn!(%error, "failed to record webhook event");
            return StatusCode::NO_CONTENT;
        }
    };

    info!(tag = %tag, "webhook accepted; publish queued");
    state.publish_queue.enqueue(PublishRequest {
        link_id: link.id,
        tag,
        event_id: Some(event.id),
    });
    StatusCode::NO_CONTENT
}

async fn record_rejected(scm: &ScmRepository, link_id: &str, body_hash: &str, reason: &str) {
    metrics::record_webhook_delivery(false);
    if let Err(error) = scm
        .record_webhook_event(
            Some(link_id),
            None,
            body_hash,
            false,
            None,
            &format!("rejected: {reason}"),
        )
        .await
    {
        warn!(%error, "failed to record rejected webhook");
    }
}
