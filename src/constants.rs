// ABOUTME: Application constants shared across the broker core
// ABOUTME: Environment variable names, defaults, limits, and wire-level prefixes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Central constants for the Link broker.
//!
//! Grouped by concern so call sites read as `limits::SIGNATURE_SKEW_SECS`
//! rather than bare numbers scattered through the codebase.

/// Environment variable names consumed by [`crate::config::ServerConfig`]
pub mod env_config {
    /// HTTP listen port
    pub const PORT: &str = "PORT";
    /// Deployment environment: development | production | test
    pub const ENVIRONMENT: &str = "ENVIRONMENT";
    /// Database connection URL
    pub const DATABASE_URL: &str = "DATABASE_URL";
    /// Database service key (passed through to the store backend)
    pub const DATABASE_SERVICE_KEY: &str = "DATABASE_SERVICE_KEY";
    /// Hex-encoded 32-byte master encryption key
    pub const MASTER_ENCRYPTION_KEY: &str = "LINK_MASTER_ENCRYPTION_KEY";
    /// Previous-version master keys for rotation, comma-separated `version:hex`
    pub const RETIRED_ENCRYPTION_KEYS: &str = "LINK_RETIRED_ENCRYPTION_KEYS";
    /// Public base URL of this broker (used to build callback URIs)
    pub const BASE_URL: &str = "LINK_BASE_URL";
    /// Explicit OAuth callback URL override
    pub const OAUTH_CALLBACK_URL: &str = "LINK_OAUTH_CALLBACK_URL";
    /// Per-request deadline in seconds
    pub const REQUEST_DEADLINE_SECS: &str = "LINK_REQUEST_DEADLINE_SECS";

    /// Build the client-id variable name for a provider, e.g. `GMAIL_CLIENT_ID`
    #[must_use]
    pub fn provider_client_id(provider: &str) -> String {
        format!("{}_CLIENT_ID", provider.to_uppercase())
    }

    /// Build the client-secret variable name for a provider
    #[must_use]
    pub fn provider_client_secret(provider: &str) -> String {
        format!("{}_CLIENT_SECRET", provider.to_uppercase())
    }
}

/// Identifier and key-string prefixes
pub mod key_prefixes {
    /// Public api-key prefix, live environment
    pub const PUBLIC_LIVE: &str = "pk_live_";
    /// Public api-key prefix, test environment
    pub const PUBLIC_TEST: &str = "pk_test_";
    /// Secret api-key prefix, live environment
    pub const SECRET_LIVE: &str = "sk_live_";
    /// Secret api-key prefix, test environment
    pub const SECRET_TEST: &str = "sk_test_";
    /// Connection record id prefix
    pub const CONNECTION: &str = "conn_";
    /// Webhook event id prefix
    pub const WEBHOOK_EVENT: &str = "evt_";
}

/// Signed-request and webhook header names
pub mod headers {
    /// Project public key header
    pub const PUBLIC_KEY: &str = "x-link-public-key";
    /// Unix-seconds timestamp header
    pub const TIMESTAMP: &str = "x-link-timestamp";
    /// Hex HMAC signature header
    pub const SIGNATURE: &str = "x-link-signature";
    /// Webhook event type header
    pub const WEBHOOK_EVENT: &str = "X-Link-Event";
    /// Webhook emission timestamp header
    pub const WEBHOOK_TIMESTAMP: &str = "X-Link-Timestamp";
    /// Webhook body signature header, `sha256=<hex>`
    pub const WEBHOOK_SIGNATURE: &str = "X-Link-Signature";
    /// Rate limit ceiling for the current window
    pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
    /// Requests remaining in the current window
    pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
    /// Unix-seconds instant the window resets
    pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
}

/// Numeric limits and windows
pub mod limits {
    /// Accepted clock skew for signed requests, seconds either side
    pub const SIGNATURE_SKEW_SECS: i64 = 300;
    /// OAuth state lifetime
    pub const OAUTH_STATE_TTL_SECS: i64 = 600;
    /// Expired unused state rows are swept after this long
    pub const OAUTH_STATE_SWEEP_AFTER_SECS: i64 = 86_400;
    /// Access tokens within this many seconds of expiry are refreshed early
    pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;
    /// Default per-minute request allowance per project
    pub const RATE_LIMIT_PER_MINUTE: u32 = 60;
    /// Default per-day request allowance per project
    pub const RATE_LIMIT_PER_DAY: u32 = 1_000;
    /// Decrypted api-key secrets are cached at most this long
    pub const SECRET_CACHE_TTL_SECS: u64 = 60;
    /// Decrypted api-key secret cache capacity
    pub const SECRET_CACHE_CAPACITY: usize = 1_024;
    /// Webhook delivery connect timeout
    pub const WEBHOOK_CONNECT_TIMEOUT_SECS: u64 = 5;
    /// Webhook delivery total timeout
    pub const WEBHOOK_TOTAL_TIMEOUT_SECS: u64 = 15;
    /// Consecutive failures before a subscription is auto-disabled
    pub const WEBHOOK_DISABLE_THRESHOLD: u32 = 5;
    /// In-process webhook queue depth
    pub const WEBHOOK_QUEUE_DEPTH: usize = 1_024;
    /// Default inbound request deadline
    pub const REQUEST_DEADLINE_SECS: u64 = 30;
    /// Slice shaved off the inbound deadline for outbound provider calls
    pub const OUTBOUND_DEADLINE_BUFFER_SECS: u64 = 2;
    /// Rows re-encrypted per batch during key rotation
    pub const KEY_ROTATION_BATCH: usize = 200;
}

/// Webhook retry schedule, seconds between attempts (five attempts total)
pub const WEBHOOK_RETRY_SCHEDULE_SECS: [u64; 4] = [30, 120, 600, 3_600];

/// Final backoff step after the schedule is exhausted
pub const WEBHOOK_RETRY_FINAL_SECS: u64 = 21_600;

/// Service name used in logs and user agents
pub mod service {
    /// Canonical service name
    pub const NAME: &str = "link-broker";
    /// User agent sent on provider and webhook requests
    pub const USER_AGENT: &str = concat!("link-broker/", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_env_names_are_uppercased() {
        assert_eq!(env_config::provider_client_id("gmail"), "GMAIL_CLIENT_ID");
        assert_eq!(
            env_config::provider_client_secret("google_calendar"),
            "GOOGLE_CALENDAR_CLIENT_SECRET"
        );
    }

    #[test]
    fn retry_schedule_is_monotonic() {
        let mut prev = 0;
        for step in WEBHOOK_RETRY_SCHEDULE_SECS {
            assert!(step > prev);
            prev = step;
        }
        assert!(WEBHOOK_RETRY_FINAL_SECS > prev);
    }
}
