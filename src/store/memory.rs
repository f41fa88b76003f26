// ABOUTME: In-memory store used by tests and local development
// ABOUTME: Mirrors the relational backend's observable semantics behind one mutex
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! In-memory [`Store`] implementation.
//!
//! All state lives behind a single async mutex, which serializes every
//! operation; the conditional-update and upsert semantics the contract
//! promises therefore hold trivially. Tests lean on this to exercise the
//! same races the SQL backend resolves with row locks.

use super::{ConnectionFilter, Store, TokenUpdate};
use crate::models::{
    ApiKeyPair, ApiLogEntry, Connection, ConnectionStatus, EndUser, OAuthState, Project,
    ProviderConfigRecord, WebhookEventRow, WebhookEventStatus, WebhookSubscription,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    api_keys: HashMap<Uuid, ApiKeyPair>,
    provider_configs: HashMap<String, ProviderConfigRecord>,
    end_users: HashMap<Uuid, EndUser>,
    oauth_states: HashMap<String, OAuthState>,
    connections: HashMap<String, Connection>,
    subscriptions: HashMap<Uuid, WebhookSubscription>,
    webhook_events: HashMap<String, WebhookEventRow>,
    api_logs: Vec<ApiLogEntry>,
    advisory_locks: HashSet<String>,
}

/// Test and development backend
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project row (tests; production rows come from the dashboard)
    pub async fn seed_project(&self, project: Project) {
        self.inner.lock().await.projects.insert(project.id, project);
    }

    /// Seed an api-key row
    pub async fn seed_api_key(&self, key: ApiKeyPair) {
        self.inner.lock().await.api_keys.insert(key.id, key);
    }

    /// Number of api-log rows written so far
    pub async fn api_log_len(&self) -> usize {
        self.inner.lock().await.api_logs.len()
    }

    /// Snapshot of api-log rows (tests)
    pub async fn api_logs(&self) -> Vec<ApiLogEntry> {
        self.inner.lock().await.api_logs.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        Ok(self.inner.lock().await.projects.get(&project_id).cloned())
    }

    async fn get_api_key_by_public_key(&self, public_key: &str) -> Result<Option<ApiKeyPair>> {
        Ok(self
            .inner
            .lock()
            .await
            .api_keys
            .values()
            .find(|k| k.public_key == public_key)
            .cloned())
    }

    async fn touch_api_key(&self, key_id: Uuid, when: DateTime<Utc>) -> Result<()> {
        if let Some(key) = self.inner.lock().await.api_keys.get_mut(&key_id) {
            key.last_used_at = Some(when);
        }
        Ok(())
    }

    async fn api_keys_page(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<ApiKeyPair>> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<ApiKeyPair> = inner.api_keys.values().cloned().collect();
        keys.sort_by_key(|k| k.id);
        let keys = keys
            .into_iter()
            .filter(|k| after.is_none_or(|a| k.id > a))
            .take(limit)
            .collect();
        Ok(keys)
    }

    async fn update_api_key_secret(&self, key_id: Uuid, secret_encrypted: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .api_keys
            .get_mut(&key_id)
            .ok_or_else(|| anyhow!("api key {key_id} not found"))?;
        key.secret_encrypted = secret_encrypted.to_owned();
        Ok(())
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfigRecord>> {
        Ok(self.inner.lock().await.provider_configs.get(name).cloned())
    }

    async fn upsert_provider_config(&self, config: &ProviderConfigRecord) -> Result<()> {
        self.inner
            .lock()
            .await
            .provider_configs
            .insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn upsert_end_user(&self, project_id: Uuid, external_id: &str) -> Result<EndUser> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .end_users
            .values()
            .find(|u| u.project_id == project_id && u.external_id == external_id)
        {
            return Ok(existing.clone());
        }
        let user = EndUser {
            id: Uuid::new_v4(),
            project_id,
            external_id: external_id.to_owned(),
            email: None,
            display_name: None,
            created_at: Utc::now(),
        };
        inner.end_users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_end_user(&self, id: Uuid) -> Result<Option<EndUser>> {
        Ok(self.inner.lock().await.end_users.get(&id).cloned())
    }

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.oauth_states.contains_key(&state.state_token) {
            return Err(anyhow!("state token collision"));
        }
        inner
            .oauth_states
            .insert(state.state_token.clone(), state.clone());
        Ok(())
    }

    async fn get_oauth_state(&self, state_token: &str) -> Result<Option<OAuthState>> {
        Ok(self.inner.lock().await.oauth_states.get(state_token).cloned())
    }

    async fn consume_oauth_state(&self, state_token: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.oauth_states.get_mut(state_token) {
            Some(state) if state.used_at.is_none() && state.expires_at > now => {
                state.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_oauth_states(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.oauth_states.len();
        inner
            .oauth_states
            .retain(|_, s| s.used_at.is_some() || s.created_at >= older_than);
        Ok((before - inner.oauth_states.len()) as u64)
    }

    async fn upsert_connection(&self, connection: &Connection) -> Result<Connection> {
        let mut inner = self.inner.lock().await;
        let existing_id = inner
            .connections
            .values()
            .find(|c| {
                c.project_id == connection.project_id
                    && c.provider == connection.provider
                    && c.end_user_id == connection.end_user_id
            })
            .map(|c| (c.id.clone(), c.created_at));

        let stored = if let Some((id, created_at)) = existing_id {
            // conflict target hit: keep identity, replace the credential state
            let mut updated = connection.clone();
            updated.id = id.clone();
            updated.created_at = created_at;
            updated.updated_at = Utc::now();
            inner.connections.insert(id, updated.clone());
            updated
        } else {
            inner
                .connections
                .insert(connection.id.clone(), connection.clone());
            connection.clone()
        };
        Ok(stored)
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        Ok(self.inner.lock().await.connections.get(id).cloned())
    }

    async fn list_connections(
        &self,
        project_id: Uuid,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Connection>> {
        let inner = self.inner.lock().await;
        let external_user: Option<Uuid> = match &filter.external_user_id {
            Some(external_id) => {
                let found = inner
                    .end_users
                    .values()
                    .find(|u| u.project_id == project_id && &u.external_id == external_id)
                    .map(|u| u.id);
                // unknown external user matches nothing
                match found {
                    Some(id) => Some(id),
                    None => return Ok(vec![]),
                }
            }
            None => None,
        };

        let mut out: Vec<Connection> = inner
            .connections
            .values()
            .filter(|c| c.project_id == project_id)
            .filter(|c| external_user.is_none_or(|u| c.end_user_id == u))
            .filter(|c| filter.provider.as_ref().is_none_or(|p| &c.provider == p))
            .filter(|c| filter.status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn update_connection_tokens(&self, id: &str, update: &TokenUpdate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conn = inner
            .connections
            .get_mut(id)
            .ok_or_else(|| anyhow!("connection {id} not found"))?;
        conn.access_token_encrypted = update.access_token_encrypted.clone();
        if let Some(refresh) = &update.refresh_token_encrypted {
            conn.refresh_token_encrypted = Some(refresh.clone());
        }
        conn.expires_at = update.expires_at;
        conn.status = ConnectionStatus::Active;
        conn.error_message = None;
        conn.updated_at = Utc::now();
        Ok(())
    }

    async fn set_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conn = inner
            .connections
            .get_mut(id)
            .ok_or_else(|| anyhow!("connection {id} not found"))?;
        conn.status = status;
        conn.error_message = error_message.map(ToOwned::to_owned);
        conn.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_connection(&self, id: &str, when: DateTime<Utc>) -> Result<()> {
        if let Some(conn) = self.inner.lock().await.connections.get_mut(id) {
            conn.last_used_at = Some(when);
        }
        Ok(())
    }

    async fn connections_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Connection>> {
        let inner = self.inner.lock().await;
        let mut all: Vec<Connection> = inner.connections.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all
            .into_iter()
            .filter(|c| after.is_none_or(|a| c.id.as_str() > a))
            .take(limit)
            .collect())
    }

    async fn update_connection_ciphertexts(
        &self,
        id: &str,
        access_token_encrypted: &str,
        refresh_token_encrypted: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conn = inner
            .connections
            .get_mut(id)
            .ok_or_else(|| anyhow!("connection {id} not found"))?;
        conn.access_token_encrypted = access_token_encrypted.to_owned();
        if let Some(refresh) = refresh_token_encrypted {
            conn.refresh_token_encrypted = Some(refresh.to_owned());
        }
        Ok(())
    }

    async fn try_advisory_lock(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().await.advisory_locks.insert(key.to_owned()))
    }

    async fn advisory_unlock(&self, key: &str) -> Result<()> {
        if !self.inner.lock().await.advisory_locks.remove(key) {
            return Err(anyhow!("advisory lock {key} is not held by this process"));
        }
        Ok(())
    }

    async fn insert_webhook_subscription(&self, subscription: &WebhookSubscription) -> Result<()> {
        self.inner
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_webhook_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        Ok(self.inner.lock().await.subscriptions.get(&id).cloned())
    }

    async fn list_webhook_subscriptions(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>> {
        let inner = self.inner.lock().await;
        let mut subs: Vec<WebhookSubscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn delete_webhook_subscription(&self, project_id: Uuid, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.subscriptions.get(&id) {
            Some(sub) if sub.project_id == project_id => {
                inner.subscriptions.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn subscriptions_for_event(
        &self,
        project_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| {
                s.project_id == project_id
                    && s.enabled
                    && s.events.iter().any(|e| e == event_type)
            })
            .cloned()
            .collect())
    }

    async fn insert_webhook_event(&self, event: &WebhookEventRow) -> Result<()> {
        self.inner
            .lock()
            .await
            .webhook_events
            .insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get_webhook_event(&self, id: &str) -> Result<Option<WebhookEventRow>> {
        Ok(self.inner.lock().await.webhook_events.get(id).cloned())
    }

    async fn update_webhook_event(
        &self,
        id: &str,
        status: WebhookEventStatus,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .webhook_events
            .get_mut(id)
            .ok_or_else(|| anyhow!("webhook event {id} not found"))?;
        event.status = status;
        event.attempts = attempts;
        event.next_attempt_at = next_attempt_at;
        Ok(())
    }

    async fn due_webhook_events(
        &self,
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEventRow>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<WebhookEventRow> = inner
            .webhook_events
            .values()
            .filter(|e| e.status == WebhookEventStatus::Pending && e.next_attempt_at <= due_before)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn record_webhook_outcome(
        &self,
        subscription_id: Uuid,
        status_code: Option<u16>,
        success: bool,
        disable: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;
        sub.last_triggered_at = Some(Utc::now());
        sub.last_status_code = status_code;
        if success {
            sub.consecutive_failures = 0;
        } else {
            sub.consecutive_failures += 1;
        }
        if disable {
            sub.enabled = false;
        }
        Ok(())
    }

    async fn append_api_log(&self, entry: &ApiLogEntry) -> Result<()> {
        self.inner.lock().await.api_logs.push(entry.clone());
        Ok(())
    }
}
