// ABOUTME: Uniform-verb dispatcher routing project calls through provider adapters
// ABOUTME: Ownership checks, token acquisition, outcome classification, api logging
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Dispatcher
//!
//! `(connection, verb, params)` in, normalized payload out. The dispatcher is
//! stateless across requests and never caches provider responses; every call
//! re-validates ownership and token freshness.

use crate::crypto::SecretCipher;
use crate::errors::{AppError, AppResult};
use crate::models::{ApiLogEntry, Connection, ConnectionStatus};
use crate::providers::{AdapterRegistry, ConnectionHandle, Verb};
use crate::tokens::TokenManager;
use crate::store::Store;
use crate::webhooks::dispatcher::connection_event_data;
use crate::webhooks::{events, WebhookDispatcher};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Routes verbs to adapters on behalf of authenticated projects
pub struct Gateway {
    store: Arc<dyn Store>,
    cipher: Arc<SecretCipher>,
    registry: Arc<AdapterRegistry>,
    tokens: Arc<TokenManager>,
    webhooks: Arc<WebhookDispatcher>,
}

impl Gateway {
    /// Build the dispatcher
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<SecretCipher>,
        registry: Arc<AdapterRegistry>,
        tokens: Arc<TokenManager>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            store,
            cipher,
            registry,
            tokens,
            webhooks,
        }
    }

    /// Dispatch one verb through the connection's adapter.
    ///
    /// # Errors
    ///
    /// `CONNECTION_NOT_FOUND` when the id is unknown *or* belongs to another
    /// project (the two are indistinguishable to the caller on purpose);
    /// otherwise whatever the token manager or the adapter's error
    /// normalization surfaces.
    pub async fn dispatch(
        &self,
        project_id: Uuid,
        connection_id: &str,
        verb: Verb,
        params: Value,
        endpoint: &str,
    ) -> AppResult<Value> {
        let started = Instant::now();
        let connection = self.owned_connection(project_id, connection_id).await?;

        let adapter = self.registry.get(&connection.provider).ok_or_else(|| {
            AppError::internal(format!("no adapter registered for {}", connection.provider))
        })?;

        let outcome = async {
            let lease = self.tokens.get_valid_access_token(connection_id).await?;
            let handle = ConnectionHandle {
                connection_id: connection_id.to_owned(),
                access_token: lease.access_token,
                token_type: lease.connection.token_type.clone(),
                scopes: lease.connection.scopes.clone(),
                provider_user_id: lease.connection.provider_user_id.clone(),
            };

            let result = match verb {
                Verb::Fetch => adapter.fetch(&handle, params).await,
                Verb::Create => adapter.create(&handle, params).await,
                Verb::Update => adapter.update(&handle, params).await,
                Verb::Delete => adapter.delete(&handle, params).await,
            };

            result.map_err(|provider_error| {
                let code = adapter.normalize_error(&provider_error);
                AppError::new(code, provider_error.to_string())
            })
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let status_code = match &outcome {
            Ok(_) => 200,
            Err(error) => error.http_status().as_u16(),
        };
        self.append_log(
            project_id,
            Some(&connection.provider),
            Some(connection_id),
            endpoint,
            status_code,
            latency_ms,
        )
        .await;

        if outcome.is_ok() {
            if let Err(e) = self.store.touch_connection(connection_id, Utc::now()).await {
                warn!(connection_id, error = %e, "last_used_at update failed");
            }
        }
        outcome
    }

    /// Revoke a connection on the developer's request.
    ///
    /// Best-effort provider-side revocation, then the terminal `revoked`
    /// status and its lifecycle event. Provider refusal does not block the
    /// local revocation.
    ///
    /// # Errors
    ///
    /// `CONNECTION_NOT_FOUND` for unknown or foreign connections; store
    /// failures surface as internal errors.
    pub async fn revoke_connection(
        &self,
        project_id: Uuid,
        connection_id: &str,
    ) -> AppResult<Connection> {
        let connection = self.owned_connection(project_id, connection_id).await?;

        if connection.status == ConnectionStatus::Active {
            if let Some(adapter) = self.registry.get(&connection.provider) {
                if let Ok(access_token) =
                    self.cipher.decrypt_str(&connection.access_token_encrypted)
                {
                    if let Err(e) = adapter.revoke(&access_token).await {
                        warn!(connection_id, error = %e, "provider-side revocation failed");
                    }
                }
            }
        }

        self.store
            .set_connection_status(
                connection_id,
                ConnectionStatus::Revoked,
                Some("revoked by project"),
            )
            .await
            .map_err(|e| AppError::internal(format!("status persist failed: {e}")))?;

        let external_user_id = self
            .store
            .get_end_user(connection.end_user_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.external_id)
            .unwrap_or_default();
        if let Err(e) = self
            .webhooks
            .emit(
                project_id,
                events::CONNECTION_REVOKED,
                connection_event_data(
                    connection_id,
                    &connection.provider,
                    &external_user_id,
                    &connection.scopes,
                ),
            )
            .await
        {
            warn!(connection_id, error = %e, "connection.revoked emit failed");
        }

        info!(connection_id, "connection revoked");
        self.store
            .get_connection(connection_id)
            .await
            .map_err(|e| AppError::internal(format!("connection reload failed: {e}")))?
            .ok_or_else(|| AppError::connection_not_found(connection_id))
    }

    /// Load a connection and verify it belongs to the calling project.
    async fn owned_connection(
        &self,
        project_id: Uuid,
        connection_id: &str,
    ) -> AppResult<Connection> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| AppError::internal(format!("connection load failed: {e}")))?
            .ok_or_else(|| AppError::connection_not_found(connection_id))?;
        // defense in depth against connection-id guessing
        if connection.project_id != project_id {
            return Err(AppError::connection_not_found(connection_id));
        }
        Ok(connection)
    }

    async fn append_log(
        &self,
        project_id: Uuid,
        provider: Option<&str>,
        connection_id: Option<&str>,
        endpoint: &str,
        status_code: u16,
        latency_ms: u64,
    ) {
        let entry = ApiLogEntry {
            id: Uuid::new_v4(),
            project_id,
            provider: provider.map(ToOwned::to_owned),
            connection_id: connection_id.map(ToOwned::to_owned),
            endpoint: endpoint.to_owned(),
            // every verb arrives over POST on the project surface
            method: "POST".to_owned(),
            status_code,
            latency_ms,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_api_log(&entry).await {
            warn!(error = %e, "api log append failed");
        }
    }
}
