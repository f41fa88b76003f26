// ABOUTME: Scriptable in-process adapter for exercising the pipeline without HTTP
// ABOUTME: Counts provider round-trips and returns configured outcomes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Mock adapter.
//!
//! Tests that assert "the provider was hit exactly once" need a provider
//! whose round-trips are observable and whose outcomes are scriptable. The
//! mock counts every operation and serves refresh results from a
//! configurable slot; no network is involved.

use super::{
    build_authorization_url_with, AuthorizationRequest, ClientCredentials, ConnectionHandle,
    ProviderAdapter, ProviderCategory, ProviderError, ProviderUserInfo, TokenGrant,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Outcome the next refresh call will produce
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// Succeed with a fresh token valid for an hour
    Success,
    /// Fail with the given classification
    Fail(ProviderError),
}

/// Counting, scriptable adapter
pub struct MockAdapter {
    name: &'static str,
    refresh_calls: AtomicU32,
    exchange_calls: AtomicU32,
    verb_calls: AtomicU32,
    refresh_outcome: Mutex<RefreshOutcome>,
    refresh_delay: Mutex<Option<std::time::Duration>>,
    token_counter: AtomicU32,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::named("mock")
    }
}

impl MockAdapter {
    /// Mock registered under `mock`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock registered under an arbitrary provider name
    #[must_use]
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            refresh_calls: AtomicU32::new(0),
            exchange_calls: AtomicU32::new(0),
            verb_calls: AtomicU32::new(0),
            refresh_outcome: Mutex::new(RefreshOutcome::Success),
            refresh_delay: Mutex::new(None),
            token_counter: AtomicU32::new(0),
        }
    }

    /// Script the next refresh outcomes
    pub fn set_refresh_outcome(&self, outcome: RefreshOutcome) {
        if let Ok(mut slot) = self.refresh_outcome.lock() {
            *slot = outcome;
        }
    }

    /// Add latency to refresh calls so concurrent callers overlap
    pub fn set_refresh_delay(&self, delay: std::time::Duration) {
        if let Ok(mut slot) = self.refresh_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Refresh round-trips observed
    #[must_use]
    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Code exchanges observed
    #[must_use]
    pub fn exchange_calls(&self) -> u32 {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    /// Verb invocations observed
    #[must_use]
    pub fn verb_calls(&self) -> u32 {
        self.verb_calls.load(Ordering::SeqCst)
    }

    fn grant(&self, prefix: &str) -> TokenGrant {
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
        TokenGrant {
            access_token: format!("{prefix}-access-{n}"),
            refresh_token: Some(format!("{prefix}-refresh-{n}")),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            token_type: "Bearer".to_owned(),
            scopes: vec!["email.read".to_owned()],
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn display_name(&self) -> &'static str {
        "Mock Provider"
    }

    fn category(&self) -> ProviderCategory {
        ProviderCategory::Mail
    }

    fn build_authorization_url(&self, request: &AuthorizationRequest<'_>) -> String {
        build_authorization_url_with(request, &[])
    }

    async fn exchange_code(
        &self,
        _credentials: &ClientCredentials,
        code: &str,
        _pkce_verifier: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if code == "bad-code" {
            return Err(ProviderError::InvalidGrant("unknown code".to_owned()));
        }
        Ok(self.grant("exchanged"))
    }

    async fn refresh(
        &self,
        _credentials: &ClientCredentials,
        _refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.refresh_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self
            .refresh_outcome
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(RefreshOutcome::Success);
        match outcome {
            RefreshOutcome::Success => Ok(self.grant("refreshed")),
            RefreshOutcome::Fail(error) => Err(error),
        }
    }

    async fn fetch_user_info(
        &self,
        _access_token: &str,
    ) -> Result<Option<ProviderUserInfo>, ProviderError> {
        Ok(Some(ProviderUserInfo {
            user_id: Some("mock-user-1".to_owned()),
            email: Some("mock@example.com".to_owned()),
        }))
    }

    async fn fetch(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        self.verb_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "verb": "fetch",
            "token": handle.access_token,
            "params": params,
        }))
    }

    async fn create(
        &self,
        _handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        self.verb_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "verb": "create", "params": params }))
    }

    async fn update(
        &self,
        _handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        self.verb_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "verb": "update", "params": params }))
    }

    async fn delete(
        &self,
        _handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        self.verb_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "verb": "delete", "params": params }))
    }
}
