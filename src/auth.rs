// ABOUTME: Signed-request authentication for project-originated API calls
// ABOUTME: HMAC-SHA256 verification with replay window and cached decrypted secrets
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Request authenticator
//!
//! Every project call (except the OAuth callback and health checks) carries
//! three headers: the public key, a Unix-seconds timestamp, and a lowercase
//! hex HMAC-SHA256 signature over `<timestamp> "." <raw body bytes>`.
//!
//! The body participates verbatim. Re-serializing it on the verifier side
//! would silently change whitespace or key order and break honest clients,
//! so the signature check happens before any JSON parsing.

use crate::constants::{key_prefixes, limits};
use crate::crypto::SecretCipher;
use crate::errors::{AppError, AppResult};
use crate::models::{ApiKeyStatus, EnvironmentTag};
use crate::store::Store;
use chrono::{DateTime, Utc};
use lru::LruCache;
use ring::hmac;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Identity attached to a verified request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Project the key belongs to
    pub project_id: Uuid,
    /// Verified api-key id
    pub api_key_id: Uuid,
    /// Environment the key signs for
    pub environment: EnvironmentTag,
}

struct CachedSecret {
    secret: String,
    inserted: Instant,
}

/// Verifies signed requests against stored api keys
pub struct RequestAuthenticator {
    store: Arc<dyn Store>,
    cipher: Arc<SecretCipher>,
    // decrypted secrets, keyed by api-key id; entries die after a short TTL
    secret_cache: Mutex<LruCache<Uuid, CachedSecret>>,
    cache_ttl: Duration,
}

impl RequestAuthenticator {
    /// Build the authenticator
    #[must_use]
    pub fn new(store: Arc<dyn Store>, cipher: Arc<SecretCipher>) -> Self {
        Self {
            store,
            cipher,
            secret_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(limits::SECRET_CACHE_CAPACITY)
                    .unwrap_or(NonZeroUsize::MIN),
            )),
            cache_ttl: Duration::from_secs(limits::SECRET_CACHE_TTL_SECS),
        }
    }

    /// Verify a signed request and resolve the calling project.
    ///
    /// Checks run in a fixed order: timestamp window, key resolution,
    /// signature. The first failure wins so a revoked key never reaches the
    /// HMAC computation.
    ///
    /// # Errors
    ///
    /// `TIMESTAMP_EXPIRED`, `INVALID_API_KEY`, or `INVALID_SIGNATURE`, all 401.
    pub async fn verify(
        &self,
        public_key: &str,
        timestamp: &str,
        signature_hex: &str,
        body: &[u8],
    ) -> AppResult<AuthContext> {
        let now = Utc::now();
        let ts = timestamp
            .parse::<i64>()
            .map_err(|_| AppError::timestamp_expired())?;
        if (now.timestamp() - ts).abs() > limits::SIGNATURE_SKEW_SECS {
            return Err(AppError::timestamp_expired());
        }

        let key = self
            .store
            .get_api_key_by_public_key(public_key)
            .await
            .map_err(|e| AppError::internal(format!("api key lookup failed: {e}")))?
            .ok_or_else(AppError::invalid_api_key)?;
        if key.status != ApiKeyStatus::Active {
            return Err(AppError::invalid_api_key());
        }

        let secret = self.secret_for(key.id, &key.secret_encrypted)?;

        // canonical payload: <timestamp> "." <raw body>
        let mut payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
        payload.extend_from_slice(timestamp.as_bytes());
        payload.push(b'.');
        payload.extend_from_slice(body);

        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let expected = hmac::sign(&mac_key, &payload);

        let provided =
            hex::decode(signature_hex).map_err(|_| AppError::invalid_signature())?;
        if expected.as_ref().ct_eq(&provided).unwrap_u8() != 1 {
            return Err(AppError::invalid_signature());
        }

        self.touch_deferred(key.id, now);

        Ok(AuthContext {
            project_id: key.project_id,
            api_key_id: key.id,
            environment: key.environment,
        })
    }

    /// Decrypt the key's secret, consulting the short-TTL cache first.
    fn secret_for(&self, key_id: Uuid, secret_encrypted: &str) -> AppResult<String> {
        if let Ok(mut cache) = self.secret_cache.lock() {
            if let Some(entry) = cache.get(&key_id) {
                if entry.inserted.elapsed() < self.cache_ttl {
                    return Ok(entry.secret.clone());
                }
                cache.pop(&key_id);
            }
        }

        let secret = self
            .cipher
            .decrypt_str(secret_encrypted)
            .map_err(|e| AppError::internal(format!("secret decryption failed: {e}")))?;

        if let Ok(mut cache) = self.secret_cache.lock() {
            cache.put(
                key_id,
                CachedSecret {
                    secret: secret.clone(),
                    inserted: Instant::now(),
                },
            );
        }
        Ok(secret)
    }

    /// `last_used_at` is bookkeeping; the write happens off the hot path.
    fn touch_deferred(&self, key_id: Uuid, when: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.touch_api_key(key_id, when).await {
                tracing::debug!(api_key_id = %key_id, error = %e, "last_used_at update failed");
            }
        });
    }

    /// Drop cache entries past their TTL; called by a background sweeper.
    pub fn evict_expired_secrets(&self) {
        if let Ok(mut cache) = self.secret_cache.lock() {
            let ttl = self.cache_ttl;
            // LruCache has no retain; collect-then-pop keeps this O(n)
            let expired: Vec<Uuid> = cache
                .iter()
                .filter(|(_, entry)| entry.inserted.elapsed() >= ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                cache.pop(&id);
            }
        }
    }
}

/// Compute the signature a client would attach to a request.
///
/// Shared by the signing side of tests and SDK examples; the verifier never
/// calls this on untrusted input.
#[must_use]
pub fn sign_request(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
    payload.extend_from_slice(timestamp.as_bytes());
    payload.push(b'.');
    payload.extend_from_slice(body);

    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&mac_key, &payload).as_ref())
}

/// Freshly minted key material, returned to the dashboard exactly once
#[derive(Debug)]
pub struct MintedKeyPair {
    /// Public half, `pk_{env}_<24 base64url chars>`
    pub public_key: String,
    /// Secret half, `sk_{env}_<32 base64url chars>`; only the encrypted form
    /// is persisted
    pub secret_key: String,
}

/// Mint a public/secret key-string pair for the given environment.
#[must_use]
pub fn mint_key_pair(environment: EnvironmentTag) -> MintedKeyPair {
    let (public_prefix, secret_prefix) = match environment {
        EnvironmentTag::Live => (key_prefixes::PUBLIC_LIVE, key_prefixes::SECRET_LIVE),
        EnvironmentTag::Test => (key_prefixes::PUBLIC_TEST, key_prefixes::SECRET_TEST),
    };
    MintedKeyPair {
        public_key: format!("{public_prefix}{}", crate::crypto::random_token(18)),
        secret_key: format!("{secret_prefix}{}", crate::crypto::random_token(24)),
    }
}
