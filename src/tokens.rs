// ABOUTME: Token lifecycle manager: freshness, single-flight refresh, classification
// ABOUTME: The hot path between the dispatcher and every provider round-trip
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Token manager
//!
//! [`TokenManager::get_valid_access_token`] returns a usable access token or
//! a terminal classification, refreshing through the provider when the
//! stored token is within the expiry skew.
//!
//! Refreshes are single-flight per connection: the first caller performs the
//! provider round-trip and publishes the outcome into a watch slot; callers
//! that arrive while it is in flight await the slot instead of dialing the
//! provider themselves. Across processes the leader additionally holds the
//! store's advisory lock and re-reads the row on contention, so losing a
//! cross-process race costs a read, never a second round-trip.

use crate::constants::limits;
use crate::crypto::SecretCipher;
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{Connection, ConnectionStatus};
use crate::providers::{AdapterRegistry, ClientCredentials, ProviderError};
use crate::store::{Store, TokenUpdate};
use crate::webhooks::dispatcher::connection_event_data;
use crate::webhooks::{events, WebhookDispatcher};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// A fresh access token plus the row it came from
#[derive(Debug, Clone)]
pub struct AccessLease {
    /// Decrypted access token
    pub access_token: String,
    /// Connection state as of the lease
    pub connection: Connection,
}

type RefreshSlot = watch::Receiver<Option<Result<AccessLease, AppError>>>;

/// Owns token freshness for every connection
pub struct TokenManager {
    store: Arc<dyn Store>,
    cipher: Arc<SecretCipher>,
    registry: Arc<AdapterRegistry>,
    webhooks: Arc<WebhookDispatcher>,
    // single-flight: connection id → slot the leader publishes into
    inflight: Mutex<HashMap<String, RefreshSlot>>,
}

impl TokenManager {
    /// Build the manager
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<SecretCipher>,
        registry: Arc<AdapterRegistry>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            store,
            cipher,
            registry,
            webhooks,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Return a valid access token for the connection, refreshing if needed.
    ///
    /// Terminal statuses fail fast: a `revoked` or `expired` connection never
    /// triggers a provider call.
    ///
    /// # Errors
    ///
    /// `CONNECTION_NOT_FOUND`, `CONNECTION_REVOKED`, `CONNECTION_EXPIRED`,
    /// `PROVIDER_ERROR`, or the adapter's normalization of a refresh
    /// rejection.
    pub async fn get_valid_access_token(&self, connection_id: &str) -> AppResult<AccessLease> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| AppError::internal(format!("connection load failed: {e}")))?
            .ok_or_else(|| AppError::connection_not_found(connection_id))?;

        match connection.status {
            ConnectionStatus::Revoked => {
                return Err(AppError::new(
                    ErrorCode::ConnectionRevoked,
                    ErrorCode::ConnectionRevoked.description(),
                ))
            }
            ConnectionStatus::Expired => {
                return Err(AppError::new(
                    ErrorCode::ConnectionExpired,
                    ErrorCode::ConnectionExpired.description(),
                ))
            }
            ConnectionStatus::Pending => {
                return Err(AppError::validation(
                    "connection is pending authorization",
                ))
            }
            ConnectionStatus::Active | ConnectionStatus::Error => {}
        }

        if is_fresh(&connection) {
            let access_token = self
                .cipher
                .decrypt_str(&connection.access_token_encrypted)
                .map_err(|e| AppError::internal(format!("access token unreadable: {e}")))?;
            return Ok(AccessLease {
                access_token,
                connection,
            });
        }

        self.refresh_single_flight(connection).await
    }

    /// Join or lead the refresh for one connection.
    async fn refresh_single_flight(&self, connection: Connection) -> AppResult<AccessLease> {
        let connection_id = connection.id.clone();

        let mut slot = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&connection_id) {
                Some(slot) => slot.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(connection_id.clone(), rx);
                    drop(inflight);
                    // leader: perform the refresh, publish, clear the slot
                    let outcome = self.lead_refresh(&connection).await;
                    let _ = tx.send(Some(outcome.clone()));
                    self.inflight.lock().await.remove(&connection_id);
                    return outcome;
                }
            }
        };

        // follower: await the leader's published result
        loop {
            let published = slot.borrow().clone();
            if let Some(result) = published {
                debug!(connection_id = %connection_id, "joined in-flight refresh");
                return result;
            }
            if slot.changed().await.is_err() {
                // leader vanished without publishing; start over
                return Box::pin(self.get_valid_access_token(&connection_id)).await;
            }
        }
    }

    /// The leader's path: cross-process lock, re-read, provider round-trip,
    /// classified persistence.
    async fn lead_refresh(&self, connection: &Connection) -> AppResult<AccessLease> {
        let lock_key = format!("refresh:{}", connection.id);

        // cross-process arm: on contention, re-read; someone else may have
        // just refreshed
        let mut holding_lock = false;
        for _ in 0..50 {
            match self.store.try_advisory_lock(&lock_key).await {
                Ok(true) => {
                    holding_lock = true;
                    break;
                }
                Ok(false) => {
                    if let Ok(Some(fresh)) = self.store.get_connection(&connection.id).await {
                        if is_fresh(&fresh) && fresh.status == ConnectionStatus::Active {
                            let access_token = self
                                .cipher
                                .decrypt_str(&fresh.access_token_encrypted)
                                .map_err(|e| {
                                    AppError::internal(format!("access token unreadable: {e}"))
                                })?;
                            return Ok(AccessLease {
                                access_token,
                                connection: fresh,
                            });
                        }
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(AppError::internal(format!("advisory lock failed: {e}")))
                }
            }
        }
        if !holding_lock {
            return Err(AppError::provider(
                "token refresh lock contention, try again",
            ));
        }

        let outcome = self.refresh_against_provider(connection).await;

        if let Err(e) = self.store.advisory_unlock(&lock_key).await {
            warn!(connection_id = %connection.id, error = %e, "advisory unlock failed");
        }
        outcome
    }

    async fn refresh_against_provider(&self, connection: &Connection) -> AppResult<AccessLease> {
        // holder of the lock may still be behind another process's refresh
        let connection = self
            .store
            .get_connection(&connection.id)
            .await
            .map_err(|e| AppError::internal(format!("connection reload failed: {e}")))?
            .ok_or_else(|| AppError::connection_not_found(&connection.id))?;
        if is_fresh(&connection) && connection.status == ConnectionStatus::Active {
            let access_token = self
                .cipher
                .decrypt_str(&connection.access_token_encrypted)
                .map_err(|e| AppError::internal(format!("access token unreadable: {e}")))?;
            return Ok(AccessLease {
                access_token,
                connection,
            });
        }

        let adapter = self.registry.get(&connection.provider).ok_or_else(|| {
            AppError::internal(format!("no adapter registered for {}", connection.provider))
        })?;

        let Some(refresh_encrypted) = connection.refresh_token_encrypted.clone() else {
            // nothing to refresh with; the grant is gone for good
            return self
                .terminalize(
                    &connection,
                    ConnectionStatus::Expired,
                    "access token expired and no refresh token is held",
                )
                .await;
        };
        let refresh_token = self
            .cipher
            .decrypt_str(&refresh_encrypted)
            .map_err(|e| AppError::internal(format!("refresh token unreadable: {e}")))?;

        let credentials = self.provider_credentials(&connection.provider).await?;

        info!(connection_id = %connection.id, provider = %connection.provider, "refreshing access token");
        match adapter.refresh(&credentials, &refresh_token).await {
            Ok(grant) => {
                let access_encrypted = self
                    .cipher
                    .encrypt_str(&grant.access_token)
                    .map_err(|e| AppError::internal(format!("token encryption failed: {e}")))?;
                // keep the existing refresh token when the provider rotates none
                let refresh_encrypted = match &grant.refresh_token {
                    Some(token) => Some(self.cipher.encrypt_str(token).map_err(|e| {
                        AppError::internal(format!("token encryption failed: {e}"))
                    })?),
                    None => None,
                };
                let update = TokenUpdate {
                    access_token_encrypted: access_encrypted,
                    refresh_token_encrypted: refresh_encrypted,
                    expires_at: grant.expires_at,
                };
                self.store
                    .update_connection_tokens(&connection.id, &update)
                    .await
                    .map_err(|e| AppError::internal(format!("token persist failed: {e}")))?;

                let connection = self
                    .store
                    .get_connection(&connection.id)
                    .await
                    .map_err(|e| AppError::internal(format!("connection reload failed: {e}")))?
                    .ok_or_else(|| AppError::connection_not_found(&connection.id))?;

                Ok(AccessLease {
                    access_token: grant.access_token,
                    connection,
                })
            }
            Err(error) => self.classify_refresh_failure(&connection, &error).await,
        }
    }

    /// Map a refresh rejection onto the connection's next status.
    async fn classify_refresh_failure(
        &self,
        connection: &Connection,
        error: &ProviderError,
    ) -> AppResult<AccessLease> {
        match error {
            ProviderError::InvalidGrant(message) => {
                self.terminalize(connection, ConnectionStatus::Revoked, message)
                    .await
            }
            ProviderError::ExpiredGrant(message) => {
                self.terminalize(connection, ConnectionStatus::Expired, message)
                    .await
            }
            ProviderError::Transient(message) => {
                // status unchanged; the caller may retry
                warn!(connection_id = %connection.id, error = %message, "transient refresh failure");
                Err(AppError::provider(message.clone()))
            }
            ProviderError::ScopeInsufficient(message)
            | ProviderError::Api { message, .. } => {
                self.store
                    .set_connection_status(&connection.id, ConnectionStatus::Error, Some(message))
                    .await
                    .map_err(|e| AppError::internal(format!("status persist failed: {e}")))?;
                self.emit_lifecycle(connection, events::CONNECTION_ERROR).await;
                Err(AppError::new(error.error_code(), message.clone()))
            }
        }
    }

    /// Transition to a terminal status, emit its event, and surface the
    /// matching error.
    async fn terminalize(
        &self,
        connection: &Connection,
        status: ConnectionStatus,
        message: &str,
    ) -> AppResult<AccessLease> {
        self.store
            .set_connection_status(&connection.id, status, Some(message))
            .await
            .map_err(|e| AppError::internal(format!("status persist failed: {e}")))?;

        let (event, code) = match status {
            ConnectionStatus::Revoked => (events::CONNECTION_REVOKED, ErrorCode::ConnectionRevoked),
            _ => (events::CONNECTION_EXPIRED, ErrorCode::ConnectionExpired),
        };
        self.emit_lifecycle(connection, event).await;
        Err(AppError::new(code, message))
    }

    async fn emit_lifecycle(&self, connection: &Connection, event_type: &str) {
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
                connection.project_id,
                event_type,
                connection_event_data(
                    &connection.id,
                    &connection.provider,
                    &external_user_id,
                    &connection.scopes,
                ),
            )
            .await
        {
            warn!(connection_id = %connection.id, event_type, error = %e, "lifecycle emit failed");
        }
    }

    async fn provider_credentials(&self, provider: &str) -> AppResult<ClientCredentials> {
        let config = self
            .store
            .get_provider_config(provider)
            .await
            .map_err(|e| AppError::internal(format!("provider config load failed: {e}")))?
            .ok_or_else(|| AppError::internal(format!("provider {provider} not configured")))?;
        let client_secret = self
            .cipher
            .decrypt_str(&config.client_secret_encrypted)
            .map_err(|e| AppError::internal(format!("client secret unreadable: {e}")))?;
        Ok(ClientCredentials {
            client_id: config.client_id,
            client_secret,
        })
    }
}

/// Fresh means no expiry, or an expiry further out than the skew buffer.
fn is_fresh(connection: &Connection) -> bool {
    connection.expires_at.is_none_or(|expires_at| {
        expires_at > Utc::now() + Duration::seconds(limits::TOKEN_EXPIRY_SKEW_SECS)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn connection_with_expiry(expires_at: Option<chrono::DateTime<Utc>>) -> Connection {
        let now = Utc::now();
        Connection {
            id: Connection::new_id(),
            project_id: Uuid::new_v4(),
            provider: "mock".into(),
            end_user_id: Uuid::new_v4(),
            provider_user_id: None,
            provider_email: None,
            access_token_encrypted: String::new(),
            refresh_token_encrypted: None,
            token_type: "Bearer".into(),
            expires_at,
            scopes: vec![],
            status: ConnectionStatus::Active,
            error_message: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn freshness_honors_skew_buffer() {
        // non-expiring tokens are always fresh
        assert!(is_fresh(&connection_with_expiry(None)));
        // well in the future: fresh
        assert!(is_fresh(&connection_with_expiry(Some(
            Utc::now() + Duration::hours(1)
        ))));
        // inside the 60s skew: stale even though not yet expired
        assert!(!is_fresh(&connection_with_expiry(Some(
            Utc::now() + Duration::seconds(30)
        ))));
        // past expiry: stale
        assert!(!is_fresh(&connection_with_expiry(Some(
            Utc::now() - Duration::seconds(10)
        ))));
    }
}
