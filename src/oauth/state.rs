// ABOUTME: OAuth authorization state machine: initiate, callback, sweep
// ABOUTME: Anti-CSRF state issuance and single-use consumption with PKCE
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Initiation and callback handling for end-user authorization.
//!
//! The provider redirects to the *broker's* callback URI; the caller's
//! redirect URI is remembered on the state row and only used for the final
//! hop back to the project. Concurrent callbacks with the same state race on
//! the store's conditional update; exactly one wins.

use crate::crypto::SecretCipher;
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{Connection, ConnectionStatus, OAuthState, ProviderConfigRecord};
use crate::oauth::PkcePair;
use crate::providers::{AdapterRegistry, AuthorizationRequest, ClientCredentials, ProviderError};
use crate::store::Store;
use crate::webhooks::dispatcher::connection_event_data;
use crate::webhooks::{events, WebhookDispatcher};
use crate::constants::limits;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of a successful initiation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInitiation {
    /// Provider authorization URL the end user should be sent to
    pub authorization_url: String,
    /// Opaque state token bound to this flow
    pub state: String,
    /// When the state stops being consumable
    pub expires_at: DateTime<Utc>,
}

/// Where the callback sends the user, success or not
#[derive(Debug, Clone)]
pub struct CallbackRedirect {
    /// Full redirect target with status parameters appended
    pub location: String,
}

/// Issues and consumes authorization states
pub struct OAuthStateManager {
    store: Arc<dyn Store>,
    cipher: Arc<SecretCipher>,
    registry: Arc<AdapterRegistry>,
    webhooks: Arc<WebhookDispatcher>,
    callback_url: String,
}

impl OAuthStateManager {
    /// Build the manager
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<SecretCipher>,
        registry: Arc<AdapterRegistry>,
        webhooks: Arc<WebhookDispatcher>,
        callback_url: String,
    ) -> Self {
        Self {
            store,
            cipher,
            registry,
            webhooks,
            callback_url,
        }
    }

    /// Start an authorization: resolve the end user, persist a single-use
    /// state row with PKCE, and build the provider authorization URL.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` for unknown/disabled providers, malformed redirect
    /// URIs, or scopes outside the provider's permitted set.
    pub async fn initiate(
        &self,
        project_id: Uuid,
        provider_name: &str,
        external_user_id: &str,
        redirect_uri: &str,
        requested_scopes: Option<Vec<String>>,
    ) -> AppResult<ConnectInitiation> {
        if external_user_id.is_empty() {
            return Err(AppError::validation("userId must not be empty"));
        }
        url::Url::parse(redirect_uri)
            .map_err(|_| AppError::validation("redirectUri must be an absolute URL"))?;

        let config = self.provider_config(provider_name).await?;
        let adapter = self
            .registry
            .get(provider_name)
            .ok_or_else(|| AppError::validation(format!("unknown provider {provider_name}")))?;

        // scope union: provider defaults plus whatever the caller added
        let mut scopes = config.default_scopes.clone();
        for scope in requested_scopes.unwrap_or_default() {
            if !config.permitted_scopes.contains(&scope) {
                return Err(AppError::validation(format!(
                    "scope {scope} is not permitted for {provider_name}"
                )));
            }
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }

        let end_user = self
            .store
            .upsert_end_user(project_id, external_user_id)
            .await
            .map_err(|e| AppError::internal(format!("end user upsert failed: {e}")))?;

        let state_token = crate::crypto::random_token(32);
        let pkce = PkcePair::generate();
        let now = Utc::now();
        let state = OAuthState {
            id: Uuid::new_v4(),
            state_token: state_token.clone(),
            project_id,
            provider: provider_name.to_owned(),
            end_user_id: end_user.id,
            redirect_uri: redirect_uri.to_owned(),
            scopes: scopes.clone(),
            pkce_verifier: pkce.verifier.clone(),
            expires_at: now + Duration::seconds(limits::OAUTH_STATE_TTL_SECS),
            used_at: None,
            created_at: now,
        };
        self.store
            .insert_oauth_state(&state)
            .await
            .map_err(|e| AppError::internal(format!("state insert failed: {e}")))?;

        let provider_scopes = adapter.translate_scopes(&scopes);
        let authorization_url = adapter.build_authorization_url(&AuthorizationRequest {
            auth_url: &config.auth_url,
            client_id: &config.client_id,
            redirect_uri: &self.callback_url,
            scopes: &provider_scopes,
            state: &state_token,
            pkce_challenge: &pkce.challenge,
        });

        info!(%project_id, provider = provider_name, user = external_user_id, "authorization initiated");
        Ok(ConnectInitiation {
            authorization_url,
            state: state_token,
            expires_at: state.expires_at,
        })
    }

    /// Consume a provider callback.
    ///
    /// Exactly one of N concurrent callbacks with the same state token gets
    /// the success redirect; the rest get `error_code=INVALID_STATE`. A
    /// failed exchange leaves the state consumed, so the same code cannot be
    /// replayed through us.
    ///
    /// # Errors
    ///
    /// `INVALID_STATE` without a redirect only when the state token is
    /// unknown (there is no redirect URI to send the user to).
    pub async fn handle_callback(&self, code: &str, state_token: &str) -> AppResult<CallbackRedirect> {
        let state = self
            .store
            .get_oauth_state(state_token)
            .await
            .map_err(|e| AppError::internal(format!("state lookup failed: {e}")))?
            .ok_or_else(AppError::invalid_state)?;

        let consumed = self
            .store
            .consume_oauth_state(state_token, Utc::now())
            .await
            .map_err(|e| AppError::internal(format!("state consume failed: {e}")))?;
        if !consumed {
            return Ok(error_redirect(&state.redirect_uri, ErrorCode::InvalidState));
        }

        match self.complete_connection(code, &state).await {
            Ok(connection_id) => Ok(success_redirect(&state.redirect_uri, &connection_id)),
            Err(error_code) => {
                warn!(provider = %state.provider, error = ?error_code, "callback completion failed");
                Ok(error_redirect(&state.redirect_uri, error_code))
            }
        }
    }

    /// Handle a callback that arrived without an authorization code: the
    /// provider reported an error, typically the user declining consent.
    ///
    /// The state is consumed so the flow cannot be resumed, and the user is
    /// sent back to the project with `status=error`. Losing the consume race
    /// downgrades the redirect to `INVALID_STATE`.
    ///
    /// # Errors
    ///
    /// `INVALID_STATE` without a redirect only when the state token is
    /// unknown.
    pub async fn handle_denied_callback(&self, state_token: &str) -> AppResult<CallbackRedirect> {
        let state = self
            .store
            .get_oauth_state(state_token)
            .await
            .map_err(|e| AppError::internal(format!("state lookup failed: {e}")))?
            .ok_or_else(AppError::invalid_state)?;

        let consumed = self
            .store
            .consume_oauth_state(state_token, Utc::now())
            .await
            .map_err(|e| AppError::internal(format!("state consume failed: {e}")))?;
        if !consumed {
            return Ok(error_redirect(&state.redirect_uri, ErrorCode::InvalidState));
        }

        warn!(provider = %state.provider, "authorization denied at provider");
        Ok(error_redirect(&state.redirect_uri, ErrorCode::Forbidden))
    }

    /// The post-consume half of the callback: exchange, identity capture,
    /// connection upsert, lifecycle emit.
    async fn complete_connection(&self, code: &str, state: &OAuthState) -> Result<String, ErrorCode> {
        let adapter = self
            .registry
            .get(&state.provider)
            .ok_or(ErrorCode::ValidationError)?;
        let config = self
            .provider_config(&state.provider)
            .await
            .map_err(|e| e.code)?;
        let credentials = self.client_credentials(&config).map_err(|e| e.code)?;

        let grant = adapter
            .exchange_code(&credentials, code, &state.pkce_verifier, &self.callback_url)
            .await
            .map_err(|e| classify_callback_error(adapter.normalize_error(&e), &e))?;

        let user_info = adapter
            .fetch_user_info(&grant.access_token)
            .await
            .map_err(|e| classify_callback_error(adapter.normalize_error(&e), &e))?
            .unwrap_or_default();

        let access_encrypted = self
            .cipher
            .encrypt_str(&grant.access_token)
            .map_err(|_| ErrorCode::InternalError)?;
        let refresh_encrypted = match &grant.refresh_token {
            Some(token) => Some(
                self.cipher
                    .encrypt_str(token)
                    .map_err(|_| ErrorCode::InternalError)?,
            ),
            None => None,
        };

        let now = Utc::now();
        let scopes = if grant.scopes.is_empty() {
            state.scopes.clone()
        } else {
            grant.scopes.clone()
        };
        let connection = Connection {
            id: Connection::new_id(),
            project_id: state.project_id,
            provider: state.provider.clone(),
            end_user_id: state.end_user_id,
            provider_user_id: user_info.user_id,
            provider_email: user_info.email,
            access_token_encrypted: access_encrypted,
            refresh_token_encrypted: refresh_encrypted,
            token_type: grant.token_type.clone(),
            expires_at: grant.expires_at,
            scopes,
            status: ConnectionStatus::Active,
            error_message: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self
            .store
            .upsert_connection(&connection)
            .await
            .map_err(|_| ErrorCode::InternalError)?;

        let external_user_id = self
            .store
            .get_end_user(state.end_user_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.external_id)
            .unwrap_or_default();

        if let Err(e) = self
            .webhooks
            .emit(
                state.project_id,
                events::CONNECTION_CREATED,
                connection_event_data(&stored.id, &stored.provider, &external_user_id, &stored.scopes),
            )
            .await
        {
            warn!(connection_id = %stored.id, error = %e, "connection.created emit failed");
        }

        info!(connection_id = %stored.id, provider = %stored.provider, "connection established");
        Ok(stored.id)
    }

    /// Delete expired unused states older than the audit horizon.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn sweep_expired(&self) -> AppResult<u64> {
        let horizon = Utc::now() - Duration::seconds(limits::OAUTH_STATE_SWEEP_AFTER_SECS);
        self.store
            .sweep_oauth_states(horizon)
            .await
            .map_err(|e| AppError::internal(format!("state sweep failed: {e}")))
    }

    async fn provider_config(&self, provider: &str) -> AppResult<ProviderConfigRecord> {
        let config = self
            .store
            .get_provider_config(provider)
            .await
            .map_err(|e| AppError::internal(format!("provider config load failed: {e}")))?
            .ok_or_else(|| AppError::validation(format!("unknown provider {provider}")))?;
        if !config.enabled {
            return Err(AppError::validation(format!("provider {provider} is disabled")));
        }
        Ok(config)
    }

    fn client_credentials(&self, config: &ProviderConfigRecord) -> AppResult<ClientCredentials> {
        let client_secret = self
            .cipher
            .decrypt_str(&config.client_secret_encrypted)
            .map_err(|e| AppError::internal(format!("client secret unreadable: {e}")))?;
        Ok(ClientCredentials {
            client_id: config.client_id.clone(),
            client_secret,
        })
    }
}

/// A transient failure during the exchange must not masquerade as a
/// connection-level status; everything non-transient keeps the adapter's
/// normalization.
fn classify_callback_error(normalized: ErrorCode, raw: &ProviderError) -> ErrorCode {
    match raw {
        ProviderError::Transient(_) => ErrorCode::ProviderError,
        _ => normalized,
    }
}

fn success_redirect(redirect_uri: &str, connection_id: &str) -> CallbackRedirect {
    CallbackRedirect {
        location: append_params(
            redirect_uri,
            &[("connection_id", connection_id), ("status", "success")],
        ),
    }
}

fn error_redirect(redirect_uri: &str, code: ErrorCode) -> CallbackRedirect {
    CallbackRedirect {
        location: append_params(
            redirect_uri,
            &[("status", "error"), ("error_code", code.as_str())],
        ),
    }
}

fn append_params(redirect_uri: &str, params: &[(&str, &str)]) -> String {
    match url::Url::parse(redirect_uri) {
        Ok(mut url) => {
            for (key, value) in params {
                url.query_pairs_mut().append_pair(key, value);
            }
            url.to_string()
        }
        // initiate validated the URI; keep a usable fallback anyway
        Err(_) => {
            let query: Vec<String> = params
                .iter()
                .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
                .collect();
            let separator = if redirect_uri.contains('?') { '&' } else { '?' };
            format!("{redirect_uri}{separator}{}", query.join("&"))
        }
    }
}
