// ABOUTME: Shared fixtures for integration tests
// ABOUTME: Builds memory-store-backed server resources with the mock adapter

#![allow(dead_code, clippy::unwrap_used)]

use chrono::{DateTime, Utc};
use link_broker::auth::mint_key_pair;
use link_broker::config::{Environment, ServerConfig};
use link_broker::models::{
    ApiKeyPair, ApiKeyStatus, Connection, ConnectionStatus, EnvironmentTag, Project,
    ProviderConfigRecord, WebhookSubscription,
};
use link_broker::providers::mock::MockAdapter;
use link_broker::providers::AdapterRegistry;
use link_broker::server::ServerResources;
use link_broker::store::{MemoryStore, Store};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything a test scenario needs
pub struct TestHarness {
    pub resources: Arc<ServerResources>,
    pub store: Arc<MemoryStore>,
    pub mock: Arc<MockAdapter>,
    pub project_id: Uuid,
    pub public_key: String,
    pub secret_key: String,
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        environment: Environment::Test,
        database_url: "memory://".to_owned(),
        database_service_key: None,
        master_key: link_broker::crypto::generate_key(),
        retired_keys: HashMap::new(),
        base_url: "http://localhost:0".to_owned(),
        oauth_callback_url: "http://localhost:0/v1/oauth/callback".to_owned(),
        provider_credentials: HashMap::new(),
        request_deadline: Duration::from_secs(30),
    }
}

/// Resources over a memory store with the mock adapter registered.
pub async fn harness() -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let mock = Arc::new(MockAdapter::new());

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::clone(&mock) as Arc<dyn link_broker::providers::ProviderAdapter>);

    let resources = Arc::new(ServerResources::with_registry(
        test_config(),
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(registry),
    ));

    let project_id = Uuid::new_v4();
    store
        .seed_project(Project {
            id: project_id,
            owner_id: Uuid::new_v4(),
            environment: EnvironmentTag::Test,
            name: "test project".into(),
            settings: serde_json::json!({}),
            created_at: Utc::now(),
        })
        .await;

    let minted = mint_key_pair(EnvironmentTag::Test);
    store
        .seed_api_key(ApiKeyPair {
            id: Uuid::new_v4(),
            project_id,
            public_key: minted.public_key.clone(),
            secret_encrypted: resources.cipher.encrypt_str(&minted.secret_key).unwrap(),
            environment: EnvironmentTag::Test,
            status: ApiKeyStatus::Active,
            last_used_at: None,
            created_at: Utc::now(),
        })
        .await;

    // mock provider configuration, client secret encrypted like production
    resources
        .store
        .upsert_provider_config(&ProviderConfigRecord {
            name: "mock".into(),
            auth_url: "https://mock.example.com/auth".into(),
            token_url: "https://mock.example.com/token".into(),
            permitted_scopes: vec![
                "email.read".into(),
                "email.send".into(),
                "profile".into(),
            ],
            default_scopes: vec!["email.read".into()],
            client_id: "mock-client".into(),
            client_secret_encrypted: resources.cipher.encrypt_str("mock-secret").unwrap(),
            enabled: true,
        })
        .await
        .unwrap();

    TestHarness {
        resources,
        store,
        mock,
        project_id,
        public_key: minted.public_key,
        secret_key: minted.secret_key,
    }
}

impl TestHarness {
    /// Seed an active mock-provider connection and return its id.
    pub async fn seed_connection(
        &self,
        external_user_id: &str,
        expires_at: Option<DateTime<Utc>>,
        status: ConnectionStatus,
    ) -> String {
        let end_user = self
            .resources
            .store
            .upsert_end_user(self.project_id, external_user_id)
            .await
            .unwrap();
        let now = Utc::now();
        let connection = Connection {
            id: Connection::new_id(),
            project_id: self.project_id,
            provider: "mock".into(),
            end_user_id: end_user.id,
            provider_user_id: Some("mock-user-1".into()),
            provider_email: Some("mock@example.com".into()),
            access_token_encrypted: self
                .resources
                .cipher
                .encrypt_str("seeded-access-token")
                .unwrap(),
            refresh_token_encrypted: Some(
                self.resources.cipher.encrypt_str("seeded-refresh-token").unwrap(),
            ),
            token_type: "Bearer".into(),
            expires_at,
            scopes: vec!["email.read".into()],
            status,
            error_message: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        let stored = self.resources.store.upsert_connection(&connection).await.unwrap();
        stored.id
    }

    /// Seed an enabled webhook subscription for the given events; returns
    /// `(subscription_id, plaintext_secret)`.
    pub async fn seed_subscription(&self, url: &str, events: &[&str]) -> (Uuid, String) {
        let secret = "whsec_test_secret".to_owned();
        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            url: url.to_owned(),
            secret_encrypted: self.resources.cipher.encrypt_str(&secret).unwrap(),
            events: events.iter().map(|e| (*e).to_owned()).collect(),
            enabled: true,
            last_triggered_at: None,
            last_status_code: None,
            consecutive_failures: 0,
            created_at: Utc::now(),
        };
        self.resources
            .store
            .insert_webhook_subscription(&subscription)
            .await
            .unwrap();
        (subscription.id, secret)
    }
}
