// ABOUTME: At-least-once webhook delivery with persistent backing and retries
// ABOUTME: Bounded queue, signing, exponential backoff, subscription auto-disable
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Webhook delivery.
//!
//! Emission writes the event row *before* the first HTTP attempt, then nudges
//! the in-process queue; a restart therefore re-seeds delivery from the
//! undelivered rows and at-least-once holds across crashes. The worker owns
//! all HTTP; emitters never block on a subscriber.
//!
//! Retry backoff: 30s, 2m, 10m, 1h, 6h — five attempts total. Five
//! consecutive failures on a subscription disable it.

use super::{events, sign_payload, WebhookEnvelope};
use crate::constants::{headers, limits, service, WEBHOOK_RETRY_FINAL_SECS, WEBHOOK_RETRY_SCHEDULE_SECS};
use crate::crypto::SecretCipher;
use crate::models::{WebhookEventRow, WebhookEventStatus};
use crate::store::Store;
use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sending half handed to emitters; cheap to clone
#[derive(Clone)]
pub struct WebhookQueue {
    tx: mpsc::Sender<String>,
}

/// Seconds until the next attempt after `attempts` failures
fn backoff_secs(attempts: u32) -> u64 {
    WEBHOOK_RETRY_SCHEDULE_SECS
        .get(attempts.saturating_sub(1) as usize)
        .copied()
        .unwrap_or(WEBHOOK_RETRY_FINAL_SECS)
}

/// Emits lifecycle events and runs the delivery worker
pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    cipher: Arc<SecretCipher>,
    http: reqwest::Client,
    queue: WebhookQueue,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl WebhookDispatcher {
    /// Build the dispatcher and its bounded queue
    #[must_use]
    pub fn new(store: Arc<dyn Store>, cipher: Arc<SecretCipher>) -> Self {
        let (tx, rx) = mpsc::channel(limits::WEBHOOK_QUEUE_DEPTH);
        let http = reqwest::Client::builder()
            .user_agent(service::USER_AGENT)
            .connect_timeout(std::time::Duration::from_secs(
                limits::WEBHOOK_CONNECT_TIMEOUT_SECS,
            ))
            .timeout(std::time::Duration::from_secs(
                limits::WEBHOOK_TOTAL_TIMEOUT_SECS,
            ))
            .build()
            .unwrap_or_default();
        Self {
            store,
            cipher,
            http,
            queue: WebhookQueue { tx },
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Emit an event to every enabled subscription of the project whose
    /// subscribed set includes `event_type`.
    ///
    /// Each matching subscription gets its own event row (and its own
    /// envelope id); the rows are durable before any delivery happens.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failures; delivery failures are the
    /// worker's business.
    pub async fn emit(&self, project_id: Uuid, event_type: &str, data: Value) -> Result<()> {
        let subscriptions = self
            .store
            .subscriptions_for_event(project_id, event_type)
            .await?;
        if subscriptions.is_empty() {
            debug!(%project_id, event_type, "no matching webhook subscriptions");
            return Ok(());
        }

        for subscription in subscriptions {
            let envelope = WebhookEnvelope {
                id: WebhookEventRow::new_id(),
                event_type: event_type.to_owned(),
                timestamp: Utc::now(),
                data: data.clone(),
            };
            let payload = serde_json::to_string(&envelope)?;
            let row = WebhookEventRow {
                id: envelope.id.clone(),
                subscription_id: subscription.id,
                event_type: event_type.to_owned(),
                payload,
                status: WebhookEventStatus::Pending,
                attempts: 0,
                next_attempt_at: Utc::now(),
                created_at: Utc::now(),
            };
            self.store.insert_webhook_event(&row).await?;

            // best effort nudge; the due-event poller covers a full queue
            if self.queue.tx.try_send(row.id.clone()).is_err() {
                debug!(event_id = %row.id, "webhook queue full, deferring to poller");
            }
        }
        Ok(())
    }

    /// Handle on the emission queue
    #[must_use]
    pub fn queue(&self) -> WebhookQueue {
        self.queue.clone()
    }

    /// Run the delivery worker until `shutdown` fires.
    ///
    /// Drains queue nudges as they arrive and polls for due retries on an
    /// interval; on shutdown, in-flight deliveries finish and pending rows
    /// stay durable for the next boot.
    pub async fn run_worker(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("webhook delivery worker started");
        let mut poll = tokio::time::interval(std::time::Duration::from_secs(5));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // single worker; the receiver stays locked for its lifetime
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                maybe_id = rx.recv() => {
                    match maybe_id {
                        Some(event_id) => self.deliver_if_due(&event_id).await,
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    self.deliver_due_batch().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("webhook delivery worker stopped");
    }

    async fn deliver_due_batch(&self) {
        let due = match self
            .store
            .due_webhook_events(Utc::now(), limits::WEBHOOK_QUEUE_DEPTH)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to poll due webhook events");
                return;
            }
        };
        for event in due {
            self.attempt_delivery(event).await;
        }
    }

    async fn deliver_if_due(&self, event_id: &str) {
        match self.store.get_webhook_event(event_id).await {
            Ok(Some(event))
                if event.status == WebhookEventStatus::Pending
                    && event.next_attempt_at <= Utc::now() =>
            {
                self.attempt_delivery(event).await;
            }
            Ok(_) => {}
            Err(e) => warn!(event_id, error = %e, "failed to load webhook event"),
        }
    }

    async fn attempt_delivery(&self, event: WebhookEventRow) {
        let subscription = match self.store.get_webhook_subscription(event.subscription_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                warn!(event_id = %event.id, "subscription gone, dropping event");
                let _ = self
                    .store
                    .update_webhook_event(
                        &event.id,
                        WebhookEventStatus::Failed,
                        event.attempts,
                        Utc::now(),
                    )
                    .await;
                return;
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "subscription load failed");
                return;
            }
        };

        if !subscription.enabled {
            let _ = self
                .store
                .update_webhook_event(
                    &event.id,
                    WebhookEventStatus::Failed,
                    event.attempts,
                    Utc::now(),
                )
                .await;
            return;
        }

        let secret = match self.cipher.decrypt_str(&subscription.secret_encrypted) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(subscription_id = %subscription.id, error = %e, "signing secret unreadable");
                return;
            }
        };

        let body = event.payload.clone();
        let signature = sign_payload(&secret, body.as_bytes());
        let sent_at = Utc::now();

        let outcome = self
            .http
            .post(&subscription.url)
            .header(headers::WEBHOOK_EVENT, &event.event_type)
            .header(headers::WEBHOOK_TIMESTAMP, sent_at.timestamp().to_string())
            .header(headers::WEBHOOK_SIGNATURE, &signature)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        let attempts = event.attempts + 1;
        let status_code = outcome.as_ref().ok().map(|r| r.status().as_u16());
        let success = status_code.is_some_and(|code| (200..300).contains(&code));

        if success {
            debug!(event_id = %event.id, attempts, "webhook delivered");
            if let Err(e) = self
                .store
                .update_webhook_event(&event.id, WebhookEventStatus::Delivered, attempts, sent_at)
                .await
            {
                // the event will be re-delivered; receivers dedupe on id
                warn!(event_id = %event.id, error = %e, "delivered but could not mark");
            }
            let _ = self
                .store
                .record_webhook_outcome(subscription.id, status_code, true, false)
                .await;
            return;
        }

        let exhausted = attempts >= u32::try_from(WEBHOOK_RETRY_SCHEDULE_SECS.len() + 1).unwrap_or(5);
        let disable =
            subscription.consecutive_failures + 1 >= limits::WEBHOOK_DISABLE_THRESHOLD;

        warn!(
            event_id = %event.id,
            attempts,
            status = ?status_code,
            exhausted,
            "webhook delivery failed"
        );

        let (next_status, next_at) = if exhausted {
            (WebhookEventStatus::Failed, sent_at)
        } else {
            (
                WebhookEventStatus::Pending,
                sent_at + Duration::seconds(backoff_secs(attempts) as i64),
            )
        };
        let _ = self
            .store
            .update_webhook_event(&event.id, next_status, attempts, next_at)
            .await;
        let _ = self
            .store
            .record_webhook_outcome(subscription.id, status_code, false, disable)
            .await;
        if disable {
            info!(subscription_id = %subscription.id, "subscription auto-disabled after consecutive failures");
        }
    }

    /// Deliver one specific event immediately, ignoring its schedule.
    ///
    /// Test hook: drives the retry machinery without waiting out the backoff.
    pub async fn force_attempt(&self, event_id: &str) {
        if let Ok(Some(event)) = self.store.get_webhook_event(event_id).await {
            if event.status == WebhookEventStatus::Pending {
                self.attempt_delivery(event).await;
            }
        }
    }
}

/// Payload helpers shared by the emitting services
#[must_use]
pub fn connection_event_data(
    connection_id: &str,
    provider: &str,
    external_user_id: &str,
    scopes: &[String],
) -> Value {
    serde_json::json!({
        "connectionId": connection_id,
        "provider": provider,
        "userId": external_user_id,
        "scopes": scopes,
    })
}

/// True when `event_type` is one the broker emits
#[must_use]
pub fn is_known_event(event_type: &str) -> bool {
    events::ALL.contains(&event_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_schedule() {
        assert_eq!(backoff_secs(1), 30);
        assert_eq!(backoff_secs(2), 120);
        assert_eq!(backoff_secs(3), 600);
        assert_eq!(backoff_secs(4), 3_600);
        assert_eq!(backoff_secs(5), 21_600);
        assert_eq!(backoff_secs(9), 21_600);
    }

    #[test]
    fn known_events() {
        assert!(is_known_event("connection.created"));
        assert!(is_known_event("connection.revoked"));
        assert!(!is_known_event("connection.sneezed"));
    }
}
