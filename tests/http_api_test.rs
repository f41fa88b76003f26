// ABOUTME: End-to-end tests over the assembled axum router
// ABOUTME: Envelope shape, auth enforcement, rate-limit headers, 302 callback

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use link_broker::auth::sign_request;
use link_broker::constants::headers;
use link_broker::models::ConnectionStatus;
use serde_json::{json, Value};
use tower::ServiceExt;

const BODY_LIMIT: usize = 2 * 1024 * 1024;

fn signed_request(
    method: &str,
    uri: &str,
    harness: &common::TestHarness,
    body: &str,
) -> Request<Body> {
    let timestamp = Utc::now().timestamp().to_string();
    let signature = sign_request(&harness.secret_key, &timestamp, body.as_bytes());
    Request::builder()
        .method(method)
        .uri(uri)
        .header(headers::PUBLIC_KEY, &harness.public_key)
        .header(headers::TIMESTAMP, &timestamp)
        .header(headers::SIGNATURE, &signature)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), BODY_LIMIT)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_authentication() {
    let harness = common::harness().await;
    let app = link_broker::server::build_router(&harness.resources);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn unsigned_requests_get_the_error_envelope() {
    let harness = common::harness().await;
    let app = link_broker::server::build_router(&harness.resources);

    let response = app
        .oneshot(Request::get("/v1/connections").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_API_KEY");
    assert!(body["meta"]["requestId"].is_string());
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let harness = common::harness().await;
    let app = link_broker::server::build_router(&harness.resources);

    let timestamp = Utc::now().timestamp().to_string();
    let signature = sign_request(&harness.secret_key, &timestamp, b"{}");
    let request = Request::get("/v1/connections")
        .header(headers::PUBLIC_KEY, &harness.public_key)
        .header(headers::TIMESTAMP, &timestamp)
        // signature computed over a different body than what the server sees
        .header(headers::SIGNATURE, &signature)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");
}

#[tokio::test]
async fn list_connections_returns_envelope_with_rate_limit_headers() {
    let harness = common::harness().await;
    harness
        .seed_connection(
            "user-1",
            Some(Utc::now() + Duration::hours(1)),
            ConnectionStatus::Active,
        )
        .await;
    let app = link_broker::server::build_router(&harness.resources);

    let response = app
        .oneshot(signed_request("GET", "/v1/connections?userId=user-1", &harness, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let limit = response.headers().get(headers::RATE_LIMIT_LIMIT).cloned();
    let remaining = response.headers().get(headers::RATE_LIMIT_REMAINING).cloned();
    assert!(limit.is_some());
    assert!(remaining.is_some());

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    let connections = body["data"].as_array().unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0]["provider"], "mock");
    assert_eq!(connections[0]["userId"], "user-1");
    // ciphertexts never appear in views
    assert!(connections[0].get("accessTokenEncrypted").is_none());
}

#[tokio::test]
async fn connect_then_callback_round_trip_returns_302() {
    let harness = common::harness().await;

    let connect_body = json!({
        "provider": "mock",
        "userId": "user-42",
        "redirectUri": "https://app.example.com/oauth/done",
        "scopes": ["email.send"],
    })
    .to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/oauth/connect", &harness, &connect_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let state = body["data"]["state"].as_str().unwrap().to_owned();
    let auth_url = body["data"]["authorizationUrl"].as_str().unwrap();
    assert!(auth_url.contains("code_challenge_method=S256"));

    // the provider bounces back to the broker callback
    let callback_uri = format!("/v1/oauth/callback?code=good-code&state={state}");
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(Request::get(&callback_uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(location.starts_with("https://app.example.com/oauth/done"));
    assert!(location.contains("status=success"));
    assert!(location.contains("connection_id=conn_"));
}

#[tokio::test]
async fn declined_consent_callback_still_redirects() {
    let harness = common::harness().await;

    let connect_body = json!({
        "provider": "mock",
        "userId": "user-43",
        "redirectUri": "https://app.example.com/oauth/done",
    })
    .to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/oauth/connect", &harness, &connect_body))
        .await
        .unwrap();
    let body = body_json(response).await;
    let state = body["data"]["state"].as_str().unwrap().to_owned();

    // the user clicked "deny": the provider sends error, no code
    let callback_uri = format!("/v1/oauth/callback?error=access_denied&state={state}");
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(Request::get(&callback_uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(location.starts_with("https://app.example.com/oauth/done"));
    assert!(location.contains("status=error"));
    assert!(location.contains("error_code=FORBIDDEN"));

    // a callback with an unknown state has no redirect target: bare 400
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(
            Request::get("/v1/oauth/callback?error=access_denied&state=bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn execute_routes_through_the_gateway() {
    let harness = common::harness().await;
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() + Duration::hours(1)),
            ConnectionStatus::Active,
        )
        .await;

    let body = json!({
        "connectionId": connection_id,
        "provider": "mock",
        "action": "fetch",
        "params": {"q": "is:unread"},
    })
    .to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/execute", &harness, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["verb"], "fetch");

    // provider-verb path form too
    let body = json!({ "connectionId": connection_id }).to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/mock/fetch", &harness, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // provider mismatch is a validation error
    let body = json!({
        "connectionId": connection_id,
        "provider": "gmail",
        "action": "fetch",
        "params": {},
    })
    .to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/execute", &harness, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn webhook_subscription_lifecycle_over_http() {
    let harness = common::harness().await;

    let create_body = json!({
        "url": "https://hooks.example.com/sink",
        "events": ["connection.created", "connection.revoked"],
    })
    .to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/webhooks", &harness, &create_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let secret = body["data"]["secret"].as_str().unwrap();
    assert!(secret.starts_with("whsec_"));
    let id = body["data"]["id"].as_str().unwrap().to_owned();

    // listing never shows the secret
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("GET", "/v1/webhooks", &harness, ""))
        .await
        .unwrap();
    let body = body_json(response).await;
    let listed = body["data"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].get("secret").is_none());

    // unknown event types are rejected
    let bad_body = json!({
        "url": "https://hooks.example.com/sink",
        "events": ["connection.sneezed"],
    })
    .to_string();
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("POST", "/v1/webhooks", &harness, &bad_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // delete, then the list is empty
    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request(
            "DELETE",
            &format!("/v1/webhooks/{id}"),
            &harness,
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request("GET", "/v1/webhooks", &harness, ""))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn rate_limit_exhaustion_returns_429_with_retry_after() {
    let harness = common::harness().await;
    harness.resources.rate_limiter.set_project_limits(
        harness.project_id,
        link_broker::rate_limiting::ProjectLimits {
            per_minute: 2,
            per_day: 100,
        },
    );

    // with a 2/minute ceiling a 429 must appear within a handful of calls,
    // even if a minute boundary rolls over mid-test
    let mut rejected = None;
    for _ in 0..6 {
        let response = link_broker::server::build_router(&harness.resources)
            .oneshot(signed_request("GET", "/v1/connections", &harness, ""))
            .await
            .unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            rejected = Some(response);
            break;
        }
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = rejected.expect("rate limit never tripped");
    assert!(response.headers().get("retry-after").is_some());
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn revoke_over_http_marks_the_connection() {
    let harness = common::harness().await;
    let connection_id = harness
        .seed_connection(
            "user-1",
            Some(Utc::now() + Duration::hours(1)),
            ConnectionStatus::Active,
        )
        .await;

    let response = link_broker::server::build_router(&harness.resources)
        .oneshot(signed_request(
            "DELETE",
            &format!("/v1/connections/{connection_id}"),
            &harness,
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "revoked");

    let connection = harness
        .resources
        .store
        .get_connection(&connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Revoked);
}
