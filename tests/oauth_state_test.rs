// ABOUTME: Integration tests for the OAuth state machine
// ABOUTME: Initiation, single-use consumption under concurrency, sweeping

#![allow(clippy::unwrap_used)]

mod common;

use chrono::{Duration, Utc};
use link_broker::errors::ErrorCode;
use link_broker::models::ConnectionStatus;
use link_broker::webhooks::events;

#[tokio::test]
async fn initiate_builds_authorization_url_and_persists_state() {
    let harness = common::harness().await;

    let initiation = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-ext-1",
            "https://app.example.com/done",
            Some(vec!["email.send".to_owned()]),
        )
        .await
        .unwrap();

    assert!(initiation.authorization_url.contains("state="));
    assert!(initiation.authorization_url.contains("code_challenge="));
    assert!(initiation.authorization_url.contains("code_challenge_method=S256"));
    assert!(initiation.expires_at > Utc::now());
    assert!(initiation.expires_at <= Utc::now() + Duration::minutes(10));

    let state = harness
        .resources
        .store
        .get_oauth_state(&initiation.state)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.project_id, harness.project_id);
    // scope union: provider defaults plus the requested extra
    assert!(state.scopes.contains(&"email.read".to_owned()));
    assert!(state.scopes.contains(&"email.send".to_owned()));
    assert!(state.used_at.is_none());
    // ≥32 bytes of entropy, base64url encoded
    assert!(state.state_token.len() >= 43);
}

#[tokio::test]
async fn scopes_outside_the_permitted_set_are_rejected() {
    let harness = common::harness().await;

    let error = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-ext-1",
            "https://app.example.com/done",
            Some(vec!["admin.everything".to_owned()]),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn callback_establishes_connection_and_emits_event() {
    let harness = common::harness().await;
    let (subscription_id, _) = harness
        .seed_subscription("http://127.0.0.1:9/sink", &[events::CONNECTION_CREATED])
        .await;

    let initiation = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-ext-1",
            "https://app.example.com/done",
            None,
        )
        .await
        .unwrap();

    let redirect = harness
        .resources
        .oauth
        .handle_callback("good-code", &initiation.state)
        .await
        .unwrap();
    assert!(redirect.location.contains("status=success"));
    assert!(redirect.location.contains("connection_id=conn_"));

    // the state row is consumed but retained for audit
    let state = harness
        .resources
        .store
        .get_oauth_state(&initiation.state)
        .await
        .unwrap()
        .unwrap();
    assert!(state.used_at.is_some());

    // the connection landed active with captured provider identity
    let connections = harness
        .resources
        .store
        .list_connections(harness.project_id, &Default::default())
        .await
        .unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].status, ConnectionStatus::Active);
    assert_eq!(connections[0].provider_email.as_deref(), Some("mock@example.com"));
    assert_eq!(harness.mock.exchange_calls(), 1);

    // the lifecycle event row was written before any delivery attempt
    let due = harness
        .resources
        .store
        .due_webhook_events(Utc::now() + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].subscription_id, subscription_id);
    assert_eq!(due[0].event_type, events::CONNECTION_CREATED);
}

#[tokio::test]
async fn reconnection_reuses_the_connection_id() {
    let harness = common::harness().await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let initiation = harness
            .resources
            .oauth
            .initiate(
                harness.project_id,
                "mock",
                "user-ext-1",
                "https://app.example.com/done",
                None,
            )
            .await
            .unwrap();
        let redirect = harness
            .resources
            .oauth
            .handle_callback("good-code", &initiation.state)
            .await
            .unwrap();
        assert!(redirect.location.contains("status=success"));

        let connections = harness
            .resources
            .store
            .list_connections(harness.project_id, &Default::default())
            .await
            .unwrap();
        assert_eq!(connections.len(), 1);
        ids.push(connections[0].id.clone());
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn concurrent_callbacks_consume_exactly_once() {
    let harness = common::harness().await;

    let initiation = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-ext-1",
            "https://app.example.com/done",
            None,
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let resources = harness.resources.clone();
        let state = initiation.state.clone();
        tasks.push(tokio::spawn(async move {
            resources.oauth.handle_callback("good-code", &state).await
        }));
    }

    let mut successes = 0;
    let mut invalid_states = 0;
    for task in tasks {
        let redirect = task.await.unwrap().unwrap();
        if redirect.location.contains("status=success") {
            successes += 1;
        } else if redirect.location.contains("error_code=INVALID_STATE") {
            invalid_states += 1;
        }
    }
    assert_eq!(successes, 1, "exactly one callback wins the consume race");
    assert_eq!(invalid_states, 7);
    // the winner is the only one that reached the provider
    assert_eq!(harness.mock.exchange_calls(), 1);
}

#[tokio::test]
async fn failed_exchange_redirects_with_error_and_keeps_state_consumed() {
    let harness = common::harness().await;

    let initiation = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-ext-1",
            "https://app.example.com/done",
            None,
        )
        .await
        .unwrap();

    let redirect = harness
        .resources
        .oauth
        .handle_callback("bad-code", &initiation.state)
        .await
        .unwrap();
    assert!(redirect.location.contains("status=error"));
    assert!(redirect.location.contains("error_code="));

    // retry with the same state is INVALID_STATE: the row stays consumed
    let retry = harness
        .resources
        .oauth
        .handle_callback("good-code", &initiation.state)
        .await
        .unwrap();
    assert!(retry.location.contains("error_code=INVALID_STATE"));
}

#[tokio::test]
async fn denied_callback_redirects_and_consumes_the_state() {
    let harness = common::harness().await;

    let initiation = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-ext-1",
            "https://app.example.com/done",
            None,
        )
        .await
        .unwrap();

    // the user declined consent: no code ever reaches us
    let redirect = harness
        .resources
        .oauth
        .handle_denied_callback(&initiation.state)
        .await
        .unwrap();
    assert!(redirect.location.starts_with("https://app.example.com/done"));
    assert!(redirect.location.contains("status=error"));
    assert!(redirect.location.contains("error_code=FORBIDDEN"));
    assert_eq!(harness.mock.exchange_calls(), 0);

    // the state is consumed; neither path can resume the flow
    let retry = harness
        .resources
        .oauth
        .handle_callback("good-code", &initiation.state)
        .await
        .unwrap();
    assert!(retry.location.contains("error_code=INVALID_STATE"));

    let denied_again = harness
        .resources
        .oauth
        .handle_denied_callback(&initiation.state)
        .await
        .unwrap();
    assert!(denied_again.location.contains("error_code=INVALID_STATE"));

    // an unknown state still has nowhere to redirect
    let error = harness
        .resources
        .oauth
        .handle_denied_callback("no-such-state")
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidState);
}

#[tokio::test]
async fn unknown_state_is_a_hard_error() {
    let harness = common::harness().await;
    let error = harness
        .resources
        .oauth
        .handle_callback("code", "no-such-state")
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidState);
}

#[tokio::test]
async fn sweep_deletes_expired_unused_but_keeps_consumed() {
    let harness = common::harness().await;

    // one consumed state, one stale unused state
    let consumed = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-a",
            "https://app.example.com/done",
            None,
        )
        .await
        .unwrap();
    harness
        .resources
        .oauth
        .handle_callback("good-code", &consumed.state)
        .await
        .unwrap();

    let stale = harness
        .resources
        .oauth
        .initiate(
            harness.project_id,
            "mock",
            "user-b",
            "https://app.example.com/done",
            None,
        )
        .await
        .unwrap();
    // backdate the unused row past the 24h audit horizon
    {
        let mut row = harness
            .resources
            .store
            .get_oauth_state(&stale.state)
            .await
            .unwrap()
            .unwrap();
        row.created_at = Utc::now() - Duration::days(2);
        row.expires_at = Utc::now() - Duration::days(2) + Duration::minutes(10);
        // re-insert over the old token is not allowed; remove and insert fresh
        harness
            .resources
            .store
            .sweep_oauth_states(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        harness.resources.store.insert_oauth_state(&row).await.unwrap();
    }

    let swept = harness.resources.oauth.sweep_expired().await.unwrap();
    assert_eq!(swept, 1);

    assert!(harness
        .resources
        .store
        .get_oauth_state(&consumed.state)
        .await
        .unwrap()
        .is_some());
    assert!(harness
        .resources
        .store
        .get_oauth_state(&stale.state)
        .await
        .unwrap()
        .is_none());
}
