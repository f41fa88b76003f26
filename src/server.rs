// ABOUTME: Server assembly: resource wiring, router construction, background tasks
// ABOUTME: Owns startup seeding and graceful shutdown of the worker set
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Process assembly.
//!
//! [`ServerResources`] is the dependency bundle handed to every route via
//! axum state. Background tasks (webhook delivery, state sweeping, secret
//! cache eviction) run on the same runtime and stop on shutdown.

use crate::auth::RequestAuthenticator;
use crate::config::ServerConfig;
use crate::crypto::{MasterKeyRing, SecretCipher};
use crate::gateway::Gateway;
use crate::models::ProviderConfigRecord;
use crate::oauth::OAuthStateManager;
use crate::providers::{AdapterRegistry, GmailAdapter};
use crate::rate_limiting::RateLimiter;
use crate::routes;
use crate::store::Store;
use crate::tokens::TokenManager;
use crate::webhooks::WebhookDispatcher;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Everything the route handlers need, built once at boot
pub struct ServerResources {
    /// Validated configuration
    pub config: ServerConfig,
    /// Data-access contract
    pub store: Arc<dyn Store>,
    /// At-rest secret cipher
    pub cipher: Arc<SecretCipher>,
    /// Signed-request verifier
    pub authenticator: RequestAuthenticator,
    /// Per-project limiter
    pub rate_limiter: RateLimiter,
    /// Provider adapter map
    pub registry: Arc<AdapterRegistry>,
    /// Token lifecycle manager
    pub tokens: Arc<TokenManager>,
    /// Uniform-verb dispatcher
    pub gateway: Gateway,
    /// OAuth state machine
    pub oauth: OAuthStateManager,
    /// Webhook emission and delivery
    pub webhooks: Arc<WebhookDispatcher>,
}

impl ServerResources {
    /// Wire the full dependency graph over a store with the stock adapters.
    #[must_use]
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(GmailAdapter::new()));
        Self::with_registry(config, store, Arc::new(registry))
    }

    /// Wire the dependency graph with a caller-supplied adapter registry.
    #[must_use]
    pub fn with_registry(
        config: ServerConfig,
        store: Arc<dyn Store>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        let key_ring = MasterKeyRing::with_retired(config.master_key, config.retired_keys.clone());
        let cipher = Arc::new(SecretCipher::new(key_ring));

        let webhooks = Arc::new(WebhookDispatcher::new(Arc::clone(&store), Arc::clone(&cipher)));
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&store),
            Arc::clone(&cipher),
            Arc::clone(&registry),
            Arc::clone(&webhooks),
        ));
        let gateway = Gateway::new(
            Arc::clone(&store),
            Arc::clone(&cipher),
            Arc::clone(&registry),
            Arc::clone(&tokens),
            Arc::clone(&webhooks),
        );
        let oauth = OAuthStateManager::new(
            Arc::clone(&store),
            Arc::clone(&cipher),
            Arc::clone(&registry),
            Arc::clone(&webhooks),
            config.oauth_callback_url.clone(),
        );
        let authenticator = RequestAuthenticator::new(Arc::clone(&store), Arc::clone(&cipher));

        Self {
            config,
            store,
            cipher,
            authenticator,
            rate_limiter: RateLimiter::new(),
            registry,
            tokens,
            gateway,
            oauth,
            webhooks,
        }
    }

    /// Seed provider descriptors for every provider that has credentials in
    /// the environment and no row yet.
    ///
    /// # Errors
    ///
    /// Propagates encryption and store failures.
    pub async fn seed_provider_configs(&self) -> Result<()> {
        for (name, credentials) in &self.config.provider_credentials {
            if self.store.get_provider_config(name).await?.is_some() {
                continue;
            }
            let Some(defaults) = provider_defaults(name) else {
                warn!(provider = %name, "credentials present but no seed defaults; skipping");
                continue;
            };
            let record = ProviderConfigRecord {
                name: name.clone(),
                auth_url: defaults.auth_url.to_owned(),
                token_url: defaults.token_url.to_owned(),
                permitted_scopes: defaults.permitted_scopes.iter().map(|s| (*s).to_owned()).collect(),
                default_scopes: defaults.default_scopes.iter().map(|s| (*s).to_owned()).collect(),
                client_id: credentials.client_id.clone(),
                client_secret_encrypted: self.cipher.encrypt_str(&credentials.client_secret)?,
                enabled: true,
            };
            self.store
                .upsert_provider_config(&record)
                .await
                .with_context(|| format!("seeding provider {name}"))?;
            info!(provider = %name, "seeded provider configuration");
        }
        Ok(())
    }

}

/// Build the full application router
#[must_use]
pub fn build_router(resources: &Arc<ServerResources>) -> Router {
    let v1 = Router::new()
        .merge(routes::oauth::OAuthRoutes::routes(Arc::clone(resources)))
        .merge(routes::connections::ConnectionRoutes::routes(Arc::clone(resources)))
        .merge(routes::execute::ExecuteRoutes::routes(Arc::clone(resources)))
        .merge(routes::webhooks::WebhookRoutes::routes(Arc::clone(resources)));

    Router::new()
        .merge(routes::health::HealthRoutes::routes())
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TimeoutLayer::new(resources.config.request_deadline))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}

/// Spawn the background worker set; they stop when `shutdown` flips.
pub fn spawn_background_tasks(resources: &Arc<ServerResources>, shutdown: &watch::Sender<bool>) {
    // webhook delivery worker
    tokio::spawn(Arc::clone(&resources.webhooks).run_worker(shutdown.subscribe()));

    // expired-state sweeper, hourly
    {
        let resources = Arc::clone(resources);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3_600));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match resources.oauth.sweep_expired().await {
                            Ok(swept) if swept > 0 => {
                                info!(swept, "swept expired oauth states");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "state sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // secret cache eviction, every minute
    {
        let resources = Arc::clone(resources);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => resources.authenticator.evict_expired_secrets(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

struct ProviderDefaults {
    auth_url: &'static str,
    token_url: &'static str,
    permitted_scopes: &'static [&'static str],
    default_scopes: &'static [&'static str],
}

fn provider_defaults(name: &str) -> Option<ProviderDefaults> {
    match name {
        "gmail" => Some(ProviderDefaults {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            permitted_scopes: &["email.read", "email.send", "email.modify", "profile"],
            default_scopes: &["email.read", "profile"],
        }),
        _ => None,
    }
}

/// Bind and serve until SIGTERM / ctrl-c.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(resources: Arc<ServerResources>) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_background_tasks(&resources, &shutdown_tx);

    let addr = format!("0.0.0.0:{}", resources.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, environment = %resources.config.environment, "listening");

    let app = build_router(&resources);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // resolves when the signal task flips the flag
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        })
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
