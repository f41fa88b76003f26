// ABOUTME: Provider adapter framework and process-local registry
// ABOUTME: Uniform-verb capability set every third-party integration implements
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Provider adapters
//!
//! An adapter is a capability bundle, not a class hierarchy: one trait object
//! per provider, held in a by-name map that is built at process start and
//! never mutated afterwards (so reads take no lock).
//!
//! Adapters translate the broker's four verbs into provider-specific calls,
//! own the broker-scope → provider-scope mapping, and classify provider
//! failures into [`ProviderError`] so the rest of the pipeline never sees a
//! raw provider payload it did not ask for.

pub mod gmail;
pub mod mock;
pub mod normalized;

pub use gmail::GmailAdapter;
pub use normalized::{
    Attendee, EmailAddress, EventStatus, EventTime, MessageBody, NormalizedEvent,
    NormalizedMessage, Page,
};

use crate::errors::ErrorCode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Providers the broker can be configured for; used when scanning the
/// environment for `<NAME>_CLIENT_ID` / `<NAME>_CLIENT_SECRET` pairs.
pub const KNOWN_PROVIDERS: &[&str] = &["gmail"];

/// The four uniform verbs of the project-facing surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Read data from the provider
    Fetch,
    /// Create a resource at the provider
    Create,
    /// Mutate an existing resource
    Update,
    /// Remove a resource
    Delete,
}

impl Verb {
    /// Parse from the URL path segment
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(Self::Fetch),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Canonical lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough service category an adapter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCategory {
    /// Mailbox providers
    Mail,
    /// Calendar providers
    Calendar,
    /// Document stores
    Documents,
    /// Issue trackers
    Issues,
}

/// Errors surfaced by adapters, classified for the token manager and
/// dispatcher
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Refresh/authorization grant explicitly rejected as invalid or revoked
    #[error("grant rejected: {0}")]
    InvalidGrant(String),

    /// Grant expired per provider policy; the user must re-authorize
    #[error("grant expired: {0}")]
    ExpiredGrant(String),

    /// Provider rejected the call for a missing scope
    #[error("insufficient scope: {0}")]
    ScopeInsufficient(String),

    /// Network failure, timeout, or provider 5xx; safe to retry later
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Any other provider 4xx
    #[error("provider rejected the request ({status}): {message}")]
    Api {
        /// HTTP status the provider returned
        status: u16,
        /// Provider-supplied message
        message: String,
    },
}

impl ProviderError {
    /// Default taxonomy mapping; adapters may override via
    /// [`ProviderAdapter::normalize_error`]
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidGrant(_) => ErrorCode::ConnectionRevoked,
            Self::ExpiredGrant(_) => ErrorCode::ConnectionExpired,
            Self::ScopeInsufficient(_) => ErrorCode::ScopeInsufficient,
            Self::Transient(_) | Self::Api { .. } => ErrorCode::ProviderError,
        }
    }
}

/// OAuth client credentials, decrypted for the duration of one round-trip
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
}

/// Tokens granted by a code exchange or refresh
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// Access token
    pub access_token: String,
    /// Refresh token; absent when the provider rotates none
    pub refresh_token: Option<String>,
    /// Access-token expiry; `None` means non-expiring
    pub expires_at: Option<DateTime<Utc>>,
    /// Token type, usually `Bearer`
    pub token_type: String,
    /// Scopes the provider actually granted
    pub scopes: Vec<String>,
}

/// Provider-side identity captured after a code exchange
#[derive(Debug, Clone, Default)]
pub struct ProviderUserInfo {
    /// Provider-side user id
    pub user_id: Option<String>,
    /// Provider-side email
    pub email: Option<String>,
}

/// Everything a verb invocation needs, bundled opaquely by the dispatcher
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection id, for logging
    pub connection_id: String,
    /// Decrypted access token
    pub access_token: String,
    /// Token type
    pub token_type: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Provider-side user id when known
    pub provider_user_id: Option<String>,
}

/// Inputs for building an authorization URL
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    /// Provider authorization endpoint
    pub auth_url: &'a str,
    /// OAuth client id
    pub client_id: &'a str,
    /// Broker-side callback the provider redirects to
    pub redirect_uri: &'a str,
    /// Provider-native scopes
    pub scopes: &'a [String],
    /// Anti-CSRF state token
    pub state: &'a str,
    /// base64url(SHA-256(verifier))
    pub pkce_challenge: &'a str,
}

/// The capability set every provider implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Canonical lowercase name, e.g. `gmail`
    fn name(&self) -> &'static str;

    /// Human-readable name for dashboards
    fn display_name(&self) -> &'static str;

    /// Service category
    fn category(&self) -> ProviderCategory;

    /// Build the provider's authorization URL with state and PKCE attached
    fn build_authorization_url(&self, request: &AuthorizationRequest<'_>) -> String;

    /// Map broker-vocabulary scopes (e.g. `email.read`) to provider-native
    /// scope strings. Unrecognized broker scopes pass through unchanged.
    fn translate_scopes(&self, broker_scopes: &[String]) -> Vec<String> {
        broker_scopes.to_vec()
    }

    /// Exchange an authorization code for tokens
    async fn exchange_code(
        &self,
        credentials: &ClientCredentials,
        code: &str,
        pkce_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Refresh an access token
    async fn refresh(
        &self,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Fetch the provider-side identity; adapters without a user-info
    /// endpoint return `Ok(None)`
    async fn fetch_user_info(
        &self,
        access_token: &str,
    ) -> Result<Option<ProviderUserInfo>, ProviderError> {
        let _ = access_token;
        Ok(None)
    }

    /// Best-effort provider-side token revocation
    async fn revoke(&self, access_token: &str) -> Result<(), ProviderError> {
        let _ = access_token;
        Ok(())
    }

    /// Read data
    async fn fetch(&self, handle: &ConnectionHandle, params: Value)
        -> Result<Value, ProviderError>;

    /// Create a resource
    async fn create(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError>;

    /// Mutate a resource
    async fn update(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError>;

    /// Remove a resource
    async fn delete(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError>;

    /// Map a classified provider failure into the broker taxonomy
    fn normalize_error(&self, error: &ProviderError) -> ErrorCode {
        error.error_code()
    }
}

/// By-name adapter map; immutable after process start, so lookups are
/// lock-free
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry for incremental registration during boot
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under its canonical name
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        tracing::info!(provider = adapter.name(), "registering provider adapter");
        self.adapters.insert(adapter.name(), adapter);
    }

    /// Adapter by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered provider names
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent-encode and join an authorization query; shared by adapters so
/// every provider builds URLs the same way.
#[must_use]
pub fn build_authorization_url_with(
    request: &AuthorizationRequest<'_>,
    extra_params: &[(&str, &str)],
) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("client_id", request.client_id.to_owned()),
        ("redirect_uri", request.redirect_uri.to_owned()),
        ("response_type", "code".to_owned()),
        ("scope", request.scopes.join(" ")),
        ("state", request.state.to_owned()),
        ("code_challenge", request.pkce_challenge.to_owned()),
        ("code_challenge_method", "S256".to_owned()),
    ];
    for (k, v) in extra_params {
        params.push((k, (*v).to_owned()));
    }

    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect();
    format!("{}?{}", request.auth_url, query.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_round_trip() {
        for verb in [Verb::Fetch, Verb::Create, Verb::Update, Verb::Delete] {
            assert_eq!(Verb::parse(verb.as_str()), Some(verb));
        }
        assert_eq!(Verb::parse("patch"), None);
    }

    #[test]
    fn error_classification_maps_to_taxonomy() {
        assert_eq!(
            ProviderError::InvalidGrant("invalid_grant".into()).error_code(),
            ErrorCode::ConnectionRevoked
        );
        assert_eq!(
            ProviderError::ExpiredGrant("expired".into()).error_code(),
            ErrorCode::ConnectionExpired
        );
        assert_eq!(
            ProviderError::Transient("timeout".into()).error_code(),
            ErrorCode::ProviderError
        );
        assert_eq!(
            ProviderError::ScopeInsufficient("gmail.send".into()).error_code(),
            ErrorCode::ScopeInsufficient
        );
    }

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let scopes = vec!["a".to_owned(), "b c".to_owned()];
        let request = AuthorizationRequest {
            auth_url: "https://provider.example.com/auth",
            client_id: "cid",
            redirect_uri: "https://broker.example.com/v1/oauth/callback",
            scopes: &scopes,
            state: "st4te",
            pkce_challenge: "ch4llenge",
        };
        let url = build_authorization_url_with(&request, &[("access_type", "offline")]);
        assert!(url.starts_with("https://provider.example.com/auth?client_id=cid&"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("code_challenge=ch4llenge"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("scope=a%20b%20c"));
        assert!(url.contains("access_type=offline"));
    }
}
