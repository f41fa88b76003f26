// ABOUTME: Data-access contract the broker core consumes
// ABOUTME: Trait over the relational store plus the backends implementing it
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Store contract
//!
//! The relational database is an external collaborator; the core only sees
//! this trait. The contract deliberately exposes the three primitives the
//! pipeline's correctness rests on:
//!
//! - conditional updates with affected-row counts (the single-use OAuth
//!   state guard),
//! - upserts keyed by composite unique constraints (connection reuse),
//! - advisory locks (cross-process refresh single-flight).
//!
//! [`PostgresStore`] is the production backend; [`MemoryStore`] backs tests
//! with the same observable semantics.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::models::{
    ApiKeyPair, ApiLogEntry, Connection, ConnectionStatus, EndUser, OAuthState, Project,
    ProviderConfigRecord, WebhookEventRow, WebhookEventStatus, WebhookSubscription,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Filters accepted by [`Store::list_connections`]
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    /// Project-supplied external user id
    pub external_user_id: Option<String>,
    /// Provider name
    pub provider: Option<String>,
    /// Lifecycle status
    pub status: Option<ConnectionStatus>,
}

/// New-token values written after a successful refresh or exchange
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    /// Encrypted access token
    pub access_token_encrypted: String,
    /// Encrypted refresh token; `None` keeps the existing one
    pub refresh_token_encrypted: Option<String>,
    /// New expiry; `None` means non-expiring
    pub expires_at: Option<DateTime<Utc>>,
}

/// The data-access contract.
///
/// Implementations must be cheap to clone behind an `Arc`; every method is a
/// suspension point.
#[async_trait]
pub trait Store: Send + Sync {
    // ── projects and keys ───────────────────────────────────────────────

    /// Project by id
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>>;

    /// Api-key pair by its globally unique public key string
    async fn get_api_key_by_public_key(&self, public_key: &str) -> Result<Option<ApiKeyPair>>;

    /// Record a successful verification; callers may defer this write
    async fn touch_api_key(&self, key_id: Uuid, when: DateTime<Utc>) -> Result<()>;

    /// Page of api keys for the rotation migration, ordered by id
    async fn api_keys_page(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<ApiKeyPair>>;

    /// Replace an api key's encrypted secret (rotation)
    async fn update_api_key_secret(&self, key_id: Uuid, secret_encrypted: &str) -> Result<()>;

    // ── provider descriptors ────────────────────────────────────────────

    /// Provider configuration by canonical name
    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfigRecord>>;

    /// Insert or replace a provider configuration (seeding)
    async fn upsert_provider_config(&self, config: &ProviderConfigRecord) -> Result<()>;

    // ── end users ───────────────────────────────────────────────────────

    /// Resolve or insert the end user for `(project, external_id)`
    async fn upsert_end_user(&self, project_id: Uuid, external_id: &str) -> Result<EndUser>;

    /// End user by id
    async fn get_end_user(&self, id: Uuid) -> Result<Option<EndUser>>;

    // ── oauth states ────────────────────────────────────────────────────

    /// Persist a new authorization-in-progress record
    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<()>;

    /// Load a state row by its opaque token
    async fn get_oauth_state(&self, state_token: &str) -> Result<Option<OAuthState>>;

    /// Atomically mark a state consumed.
    ///
    /// The update is conditional on `used_at IS NULL` and the expiry being in
    /// the future; returns `true` iff exactly one row changed. This is the
    /// authoritative single-use guard under concurrent callbacks.
    async fn consume_oauth_state(&self, state_token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Delete expired, unused states created before `older_than`; consumed
    /// rows are retained for audit. Returns the number deleted.
    async fn sweep_oauth_states(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ── connections ─────────────────────────────────────────────────────

    /// Upsert keyed on `(project, provider, end_user)`.
    ///
    /// On conflict the existing row keeps its id and creation time; tokens,
    /// scopes, status, and provider identity fields are replaced. Returns
    /// the stored row.
    async fn upsert_connection(&self, connection: &Connection) -> Result<Connection>;

    /// Connection by id
    async fn get_connection(&self, id: &str) -> Result<Option<Connection>>;

    /// Connections of a project matching the filter
    async fn list_connections(
        &self,
        project_id: Uuid,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Connection>>;

    /// Write refreshed tokens; bumps `updated_at`, keeps status `active`
    async fn update_connection_tokens(&self, id: &str, update: &TokenUpdate) -> Result<()>;

    /// Transition a connection's lifecycle status
    async fn set_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Record a dispatch through the connection
    async fn touch_connection(&self, id: &str, when: DateTime<Utc>) -> Result<()>;

    /// Page of connections for the rotation migration, ordered by id
    async fn connections_page(&self, after: Option<&str>, limit: usize)
        -> Result<Vec<Connection>>;

    /// Replace a connection's ciphertexts without touching its lifecycle
    /// (rotation)
    async fn update_connection_ciphertexts(
        &self,
        id: &str,
        access_token_encrypted: &str,
        refresh_token_encrypted: Option<&str>,
    ) -> Result<()>;

    // ── advisory locks ──────────────────────────────────────────────────

    /// Try to take the process-spanning advisory lock for `key`.
    ///
    /// Non-blocking: returns `false` when another holder has it.
    async fn try_advisory_lock(&self, key: &str) -> Result<bool>;

    /// Release an advisory lock taken by this caller
    async fn advisory_unlock(&self, key: &str) -> Result<()>;

    // ── webhooks ────────────────────────────────────────────────────────

    /// Create a subscription
    async fn insert_webhook_subscription(&self, subscription: &WebhookSubscription) -> Result<()>;

    /// Subscription by id
    async fn get_webhook_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>>;

    /// All subscriptions of a project
    async fn list_webhook_subscriptions(&self, project_id: Uuid)
        -> Result<Vec<WebhookSubscription>>;

    /// Delete a project's subscription; returns whether a row existed
    async fn delete_webhook_subscription(&self, project_id: Uuid, id: Uuid) -> Result<bool>;

    /// Enabled subscriptions of a project that include `event_type`
    async fn subscriptions_for_event(
        &self,
        project_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>>;

    /// Persist an event row before the first delivery attempt
    async fn insert_webhook_event(&self, event: &WebhookEventRow) -> Result<()>;

    /// Event row by id
    async fn get_webhook_event(&self, id: &str) -> Result<Option<WebhookEventRow>>;

    /// Update delivery bookkeeping after an attempt
    async fn update_webhook_event(
        &self,
        id: &str,
        status: WebhookEventStatus,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Pending events whose next attempt is due, oldest first
    async fn due_webhook_events(
        &self,
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEventRow>>;

    /// Record a delivery outcome on the subscription's health counters.
    ///
    /// Success resets `consecutive_failures` to zero; failure increments it.
    /// `disable` turns the subscription off (auto-disable threshold reached).
    async fn record_webhook_outcome(
        &self,
        subscription_id: Uuid,
        status_code: Option<u16>,
        success: bool,
        disable: bool,
    ) -> Result<()>;

    // ── observability ───────────────────────────────────────────────────

    /// Append a per-request log row
    async fn append_api_log(&self, entry: &ApiLogEntry) -> Result<()>;
}
