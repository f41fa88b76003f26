// ABOUTME: Environment configuration management for deployment-specific settings
// ABOUTME: Parses env vars into a typed ServerConfig with validation at boot
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Environment-based configuration for the broker process.
//!
//! Everything the core needs arrives through environment variables;
//! [`ServerConfig::from_env`] validates once at boot so the rest of the
//! process never re-parses.

use crate::constants::{env_config, limits};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Deployment environment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; a missing master key is generated and logged
    #[default]
    Development,
    /// Production; configuration errors refuse to boot
    Production,
    /// Test runs
    Test,
}

impl Environment {
    /// Parse with fallback to development
    #[must_use]
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "test" | "testing" => Self::Test,
            _ => Self::Development,
        }
    }

    /// Whether this is a production deployment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// OAuth client credentials for one provider
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret (plaintext from the environment; encrypted before
    /// any persistence)
    pub client_secret: String,
}

/// Fully validated broker configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub port: u16,
    /// Deployment environment
    pub environment: Environment,
    /// Database connection URL
    pub database_url: String,
    /// Database service key
    pub database_service_key: Option<String>,
    /// Raw 32-byte master encryption key
    pub master_key: [u8; 32],
    /// Retired master keys by version, for decrypt-during-rotation
    pub retired_keys: HashMap<u8, [u8; 32]>,
    /// Public base URL of this broker
    pub base_url: String,
    /// Callback URL the provider redirects to
    pub oauth_callback_url: String,
    /// Per-provider OAuth credentials keyed by canonical name
    pub provider_credentials: HashMap<String, ProviderCredentials>,
    /// Inbound request deadline
    pub request_deadline: Duration,
}

impl ServerConfig {
    /// Load and validate configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or malformed. In
    /// production a missing master key is fatal; in development one is
    /// generated and logged so local flows work out of the box.
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_str_or_default(
            &env::var(env_config::ENVIRONMENT).unwrap_or_default(),
        );

        let port = env::var(env_config::PORT)
            .unwrap_or_else(|_| "8080".into())
            .parse::<u16>()
            .context("PORT must be a valid port number")?;

        let database_url = env::var(env_config::DATABASE_URL)
            .map_err(|_| anyhow!("{} is required", env_config::DATABASE_URL))?;
        let database_service_key = env::var(env_config::DATABASE_SERVICE_KEY).ok();

        let master_key = Self::load_master_key(environment)?;
        let retired_keys = Self::load_retired_keys()?;

        let base_url = env::var(env_config::BASE_URL)
            .unwrap_or_else(|_| format!("http://localhost:{port}"));
        let oauth_callback_url = env::var(env_config::OAUTH_CALLBACK_URL)
            .unwrap_or_else(|_| format!("{}/v1/oauth/callback", base_url.trim_end_matches('/')));

        let request_deadline = env::var(env_config::REQUEST_DEADLINE_SECS)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(
                Duration::from_secs(limits::REQUEST_DEADLINE_SECS),
                Duration::from_secs,
            );

        Ok(Self {
            port,
            environment,
            database_url,
            database_service_key,
            master_key,
            retired_keys,
            base_url,
            oauth_callback_url,
            provider_credentials: Self::load_provider_credentials(),
            request_deadline,
        })
    }

    /// Deadline applied to outbound provider calls: the inbound deadline
    /// minus a small buffer so the broker can still render a response.
    #[must_use]
    pub fn outbound_deadline(&self) -> Duration {
        self.request_deadline
            .saturating_sub(Duration::from_secs(limits::OUTBOUND_DEADLINE_BUFFER_SECS))
    }

    fn load_master_key(environment: Environment) -> Result<[u8; 32]> {
        match env::var(env_config::MASTER_ENCRYPTION_KEY) {
            Ok(encoded) => parse_hex_key(&encoded)
                .with_context(|| format!("invalid {}", env_config::MASTER_ENCRYPTION_KEY)),
            Err(_) if environment.is_production() => Err(anyhow!(
                "{} is required in production",
                env_config::MASTER_ENCRYPTION_KEY
            )),
            Err(_) => {
                let key = crate::crypto::generate_key();
                tracing::warn!(
                    "{} not set; generated a development key: {}",
                    env_config::MASTER_ENCRYPTION_KEY,
                    hex::encode(key)
                );
                Ok(key)
            }
        }
    }

    /// Retired keys arrive as `version:hex,version:hex`; decrypt selects by
    /// the version byte prefixed to each stored ciphertext.
    fn load_retired_keys() -> Result<HashMap<u8, [u8; 32]>> {
        let mut keys = HashMap::new();
        let Ok(raw) = env::var(env_config::RETIRED_ENCRYPTION_KEYS) else {
            return Ok(keys);
        };
        for entry in raw.split(',').filter(|s| !s.is_empty()) {
            let (version, hex_key) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("retired key entry must be version:hex, got {entry}"))?;
            let version = version
                .parse::<u8>()
                .with_context(|| format!("invalid retired key version {version}"))?;
            keys.insert(version, parse_hex_key(hex_key)?);
        }
        Ok(keys)
    }

    /// Discover provider credentials by scanning `<NAME>_CLIENT_ID` /
    /// `<NAME>_CLIENT_SECRET` pairs for the providers the registry knows.
    fn load_provider_credentials() -> HashMap<String, ProviderCredentials> {
        let mut creds = HashMap::new();
        for provider in crate::providers::KNOWN_PROVIDERS {
            let id_var = env_config::provider_client_id(provider);
            let secret_var = env_config::provider_client_secret(provider);
            if let (Ok(client_id), Ok(client_secret)) = (env::var(&id_var), env::var(&secret_var)) {
                creds.insert(
                    (*provider).to_owned(),
                    ProviderCredentials {
                        client_id,
                        client_secret,
                    },
                );
            }
        }
        creds
    }
}

fn parse_hex_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(encoded.trim()).context("key must be hex")?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow!("key must be exactly 32 bytes, got {len}"))
}
