// ABOUTME: Integration tests for token freshness, single-flight, classification
// ABOUTME: Proves one refresh per window and terminal fast-fail behavior

#![allow(clippy::unwrap_used)]

mod common;

use chrono::{Duration, Utc};
use link_broker::errors::ErrorCode;
use link_broker::models::ConnectionStatus;
use link_broker::providers::mock::RefreshOutcome;
use link_broker::providers::ProviderError;
use link_broker::webhooks::events;

#[tokio::test]
async fn fresh_token_returned_without_provider_call() {
    let harness = common::harness().await;
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() + Duration::hours(1)),
            ConnectionStatus::Active,
        )
        .await;

    let lease = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap();
    assert_eq!(lease.access_token, "seeded-access-token");
    assert_eq!(harness.mock.refresh_calls(), 0);
}

#[tokio::test]
async fn non_expiring_token_never_refreshes() {
    let harness = common::harness().await;
    let connection_id = harness
        .seed_connection("user-1", None, ConnectionStatus::Active)
        .await;

    let lease = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap();
    assert_eq!(lease.access_token, "seeded-access-token");
    assert_eq!(harness.mock.refresh_calls(), 0);
}

#[tokio::test]
async fn expired_token_refreshes_and_persists() {
    let harness = common::harness().await;
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;

    let lease = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap();
    assert!(lease.access_token.starts_with("refreshed-access-"));
    assert_eq!(harness.mock.refresh_calls(), 1);

    // the new token is on the row, encrypted, with a future expiry
    let connection = harness
        .resources
        .store
        .get_connection(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.expires_at.unwrap() > Utc::now());
    let stored_token = harness
        .resources
        .cipher
        .decrypt_str(&connection.access_token_encrypted)
        .unwrap();
    assert_eq!(stored_token, lease.access_token);

    // the second call hits the fresh token, no extra round-trip
    let again = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap();
    assert_eq!(again.access_token, lease.access_token);
    assert_eq!(harness.mock.refresh_calls(), 1);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let harness = common::harness().await;
    harness
        .mock
        .set_refresh_delay(std::time::Duration::from_millis(100));
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let tokens = harness.resources.tokens.clone();
        let id = connection_id.clone();
        tasks.push(tokio::spawn(async move {
            tokens.get_valid_access_token(&id).await
        }));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().unwrap());
    }

    // the provider token endpoint was hit exactly once
    assert_eq!(harness.mock.refresh_calls(), 1);
    // and every caller observes the same new token
    let first = &leases[0].access_token;
    assert!(leases.iter().all(|lease| &lease.access_token == first));
}

#[tokio::test]
async fn invalid_grant_revokes_and_emits() {
    let harness = common::harness().await;
    let (_, _) = harness
        .seed_subscription("http://127.0.0.1:9/sink", &[events::CONNECTION_REVOKED])
        .await;
    harness
        .mock
        .set_refresh_outcome(RefreshOutcome::Fail(ProviderError::InvalidGrant(
            "invalid_grant".to_owned(),
        )));
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;

    let error = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ConnectionRevoked);

    let connection = harness
        .resources
        .store
        .get_connection(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Revoked);

    // connection.revoked was queued durably
    let due = harness
        .resources
        .store
        .due_webhook_events(Utc::now() + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].event_type, events::CONNECTION_REVOKED);

    // subsequent calls fail fast without another provider round-trip
    let calls_before = harness.mock.refresh_calls();
    let error = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ConnectionRevoked);
    assert_eq!(harness.mock.refresh_calls(), calls_before);
}

#[tokio::test]
async fn expired_grant_is_terminal() {
    let harness = common::harness().await;
    harness
        .mock
        .set_refresh_outcome(RefreshOutcome::Fail(ProviderError::ExpiredGrant(
            "refresh token expired".to_owned(),
        )));
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;

    let error = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ConnectionExpired);

    let connection = harness
        .resources
        .store
        .get_connection(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Expired);
}

#[tokio::test]
async fn transient_failure_leaves_status_unchanged() {
    let harness = common::harness().await;
    harness
        .mock
        .set_refresh_outcome(RefreshOutcome::Fail(ProviderError::Transient(
            "gateway timeout".to_owned(),
        )));
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;

    let error = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ProviderError);

    // status stays active; a later retry can succeed
    let connection = harness
        .resources
        .store
        .get_connection(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);

    harness.mock.set_refresh_outcome(RefreshOutcome::Success);
    let lease = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap();
    assert!(lease.access_token.starts_with("refreshed-access-"));
}

#[tokio::test]
async fn other_4xx_marks_error_status() {
    let harness = common::harness().await;
    harness
        .mock
        .set_refresh_outcome(RefreshOutcome::Fail(ProviderError::Api {
            status: 400,
            message: "invalid_client".to_owned(),
        }));
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;

    let error = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ProviderError);

    let connection = harness
        .resources
        .store
        .get_connection(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Error);
    assert_eq!(connection.error_message.as_deref(), Some("invalid_client"));
}

#[tokio::test]
async fn missing_refresh_token_expires_the_connection() {
    let harness = common::harness().await;
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() - Duration::seconds(10)),
            ConnectionStatus::Active,
        )
        .await;
    // strip the refresh token
    {
        let connection = harness
            .resources
            .store
            .get_connection(&connection_id)
            .await
            .unwrap()
            .unwrap();
        let mut stripped = connection;
        stripped.refresh_token_encrypted = None;
        harness.resources.store.upsert_connection(&stripped).await.unwrap();
    }

    let error = harness
        .resources
        .tokens
        .get_valid_access_token(&connection_id)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ConnectionExpired);
    assert_eq!(harness.mock.refresh_calls(), 0);
}
