// ABOUTME: Core data model for projects, keys, end users, connections, and webhooks
// ABOUTME: Owns entity semantics; persistence lives behind the store contract
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Entity definitions shared by the request pipeline and the store contract.
//!
//! All secret-valued fields hold *ciphertext* produced by [`crate::crypto`];
//! plaintext secrets only exist transiently inside the services that need
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Deployment environment a project or key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentTag {
    /// Sandbox keys and connections
    Test,
    /// Production keys and connections
    Live,
}

impl EnvironmentTag {
    /// Short tag used inside key strings (`pk_test_…`, `pk_live_…`)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Live => "live",
        }
    }
}

/// A platform customer's integration tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Identifier
    pub id: Uuid,
    /// Owner reference (dashboard account)
    pub owner_id: Uuid,
    /// Environment the project operates in
    pub environment: EnvironmentTag,
    /// Display name
    pub name: String,
    /// Free-form settings map managed by the dashboard
    pub settings: serde_json::Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Status of an api-key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    /// Key accepted for signing
    Active,
    /// Key rejected; revoked by the dashboard
    Revoked,
}

/// Signing credentials for a project.
///
/// The secret is stored encrypted (not hashed): signature verification
/// recomputes the HMAC server-side and therefore needs the raw secret bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyPair {
    /// Identifier
    pub id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Opaque public key string, `pk_{env}_<24 base64url chars>`, globally unique
    pub public_key: String,
    /// Encrypted secret material (versioned AES-GCM ciphertext)
    pub secret_encrypted: String,
    /// Environment this key signs for
    pub environment: EnvironmentTag,
    /// Key status
    pub status: ApiKeyStatus,
    /// Last successful verification (write may lag)
    pub last_used_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Static configuration for a third-party provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfigRecord {
    /// Canonical provider name, e.g. `gmail`
    pub name: String,
    /// Authorization endpoint
    pub auth_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Scopes the broker may request
    pub permitted_scopes: Vec<String>,
    /// Scopes requested when the caller names none
    pub default_scopes: Vec<String>,
    /// OAuth client id
    pub client_id: String,
    /// Encrypted OAuth client secret
    pub client_secret_encrypted: String,
    /// Whether new connections may be initiated
    pub enabled: bool,
}

/// An identity owned by a project; `(project_id, external_id)` is unique
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndUser {
    /// Identifier
    pub id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Project-supplied identifier
    pub external_id: String,
    /// Optional email
    pub email: Option<String>,
    /// Optional display name
    pub display_name: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A single-use, short-lived authorization-in-progress record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    /// Identifier
    pub id: Uuid,
    /// Opaque random token carried through the provider round-trip
    pub state_token: String,
    /// Owning project
    pub project_id: Uuid,
    /// Provider being connected
    pub provider: String,
    /// End user being connected
    pub end_user_id: Uuid,
    /// Where to send the user after the flow finishes
    pub redirect_uri: String,
    /// Scopes requested for this authorization
    pub scopes: Vec<String>,
    /// PKCE code verifier held until the code exchange
    pub pkce_verifier: String,
    /// Hard expiry; at most 10 minutes after creation
    pub expires_at: DateTime<Utc>,
    /// Consumption marker; a state is consumed at most once
    pub used_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl OAuthState {
    /// Whether this state can still be consumed
    #[must_use]
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.expires_at > now
    }
}

/// Connection lifecycle status; transitions are owned by the token manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Authorization started, no tokens yet
    Pending,
    /// Tokens held and believed valid
    Active,
    /// Refresh token expired per provider policy; user must re-connect
    Expired,
    /// Credentials revoked at the provider or by the developer
    Revoked,
    /// Non-terminal provider error recorded on last refresh
    Error,
}

impl ConnectionStatus {
    /// Terminal statuses fail fast without a provider round-trip
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown connection status {other}")),
        }
    }
}

/// The long-lived credential record; `(project, provider, end_user)` is unique
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Identifier, `conn_<uuid>`
    pub id: String,
    /// Owning project
    pub project_id: Uuid,
    /// Provider name
    pub provider: String,
    /// Connected end user
    pub end_user_id: Uuid,
    /// Provider-side user id, opaque to the core
    pub provider_user_id: Option<String>,
    /// Provider-side email, opaque to the core
    pub provider_email: Option<String>,
    /// Encrypted access token
    pub access_token_encrypted: String,
    /// Encrypted refresh token; some providers issue none
    pub refresh_token_encrypted: Option<String>,
    /// Token type as reported by the provider, usually `Bearer`
    pub token_type: String,
    /// Access-token expiry; `None` means the token does not expire
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes actually granted
    pub scopes: Vec<String>,
    /// Lifecycle status
    pub status: ConnectionStatus,
    /// Message recorded when status is `error`
    pub error_message: Option<String>,
    /// Last dispatch through this connection
    pub last_used_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Build a fresh connection id
    #[must_use]
    pub fn new_id() -> String {
        format!("{}{}", crate::constants::key_prefixes::CONNECTION, Uuid::new_v4())
    }
}

/// Project event delivery endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Identifier
    pub id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Target URL for POST deliveries
    pub url: String,
    /// Encrypted signing secret
    pub secret_encrypted: String,
    /// Event types this subscription receives
    pub events: Vec<String>,
    /// Disabled subscriptions receive nothing
    pub enabled: bool,
    /// Last delivery attempt
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Status code of the last attempt
    pub last_status_code: Option<u16>,
    /// Failures since the last 2xx
    pub consecutive_failures: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Delivery state of a persisted webhook event row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    /// Written, not yet delivered
    Pending,
    /// A 2xx was observed
    Delivered,
    /// All attempts exhausted
    Failed,
}

/// A webhook event persisted before the first delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRow {
    /// Unique per emission, `evt_<uuid>`
    pub id: String,
    /// Target subscription
    pub subscription_id: Uuid,
    /// Event type, e.g. `connection.created`
    pub event_type: String,
    /// Serialized envelope body delivered verbatim
    pub payload: String,
    /// Delivery state
    pub status: WebhookEventStatus,
    /// Attempts made so far
    pub attempts: u32,
    /// Earliest time of the next attempt
    pub next_attempt_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl WebhookEventRow {
    /// Build a fresh event id
    #[must_use]
    pub fn new_id() -> String {
        format!("{}{}", crate::constants::key_prefixes::WEBHOOK_EVENT, Uuid::new_v4())
    }
}

/// Append-only per-request observability record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLogEntry {
    /// Identifier
    pub id: Uuid,
    /// Project that made the call
    pub project_id: Uuid,
    /// Provider dispatched to, when applicable
    pub provider: Option<String>,
    /// Connection used, when applicable
    pub connection_id: Option<String>,
    /// Endpoint path
    pub endpoint: String,
    /// HTTP method
    pub method: String,
    /// Response status
    pub status_code: u16,
    /// Wall-clock latency
    pub latency_ms: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ConnectionStatus::Expired.is_terminal());
        assert!(ConnectionStatus::Revoked.is_terminal());
        assert!(!ConnectionStatus::Active.is_terminal());
        assert!(!ConnectionStatus::Error.is_terminal());
        assert!(!ConnectionStatus::Pending.is_terminal());
    }

    #[test]
    fn state_consumability() {
        let now = Utc::now();
        let mut state = OAuthState {
            id: Uuid::new_v4(),
            state_token: "tok".into(),
            project_id: Uuid::new_v4(),
            provider: "gmail".into(),
            end_user_id: Uuid::new_v4(),
            redirect_uri: "https://app.example.com/done".into(),
            scopes: vec![],
            pkce_verifier: "v".into(),
            expires_at: now + chrono::Duration::minutes(10),
            used_at: None,
            created_at: now,
        };
        assert!(state.is_consumable(now));

        state.used_at = Some(now);
        assert!(!state.is_consumable(now));

        state.used_at = None;
        state.expires_at = now - chrono::Duration::seconds(1);
        assert!(!state.is_consumable(now));
    }

    #[test]
    fn connection_ids_carry_prefix() {
        assert!(Connection::new_id().starts_with("conn_"));
        assert!(WebhookEventRow::new_id().starts_with("evt_"));
    }
}
