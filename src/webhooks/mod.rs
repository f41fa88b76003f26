// ABOUTME: Webhook module: lifecycle event types, envelope, and signing
// ABOUTME: The dispatcher submodule owns queueing and delivery
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Webhooks
//!
//! Lifecycle events (`connection.created`, `connection.expired`,
//! `connection.revoked`, `connection.error`) are delivered at-least-once to
//! every enabled subscription of the owning project whose event set includes
//! the type. Receivers deduplicate on the envelope `id`.

pub mod dispatcher;

pub use dispatcher::{WebhookDispatcher, WebhookQueue};

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names
pub mod events {
    /// A connection reached `active` through a successful callback
    pub const CONNECTION_CREATED: &str = "connection.created";
    /// A refresh failed because the grant expired
    pub const CONNECTION_EXPIRED: &str = "connection.expired";
    /// The provider or the developer revoked the credentials
    pub const CONNECTION_REVOKED: &str = "connection.revoked";
    /// A refresh failed with a non-terminal provider rejection
    pub const CONNECTION_ERROR: &str = "connection.error";

    /// Every event type a subscription may subscribe to
    pub const ALL: &[&str] = &[
        CONNECTION_CREATED,
        CONNECTION_EXPIRED,
        CONNECTION_REVOKED,
        CONNECTION_ERROR,
    ];
}

/// JSON body POSTed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Unique per emission; receivers deduplicate on this
    pub id: String,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload
    pub data: Value,
}

/// Compute the delivery signature over the raw body.
///
/// The value rides in `X-Link-Signature: sha256=<hex>`; the timestamp header
/// does not participate in the HMAC.
#[must_use]
pub fn sign_payload(secret: &str, raw_body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    format!("sha256={}", hex::encode(hmac::sign(&key, raw_body).as_ref()))
}
