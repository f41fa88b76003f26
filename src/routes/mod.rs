// ABOUTME: HTTP route modules for the project-facing /v1 surface
// ABOUTME: Shared authentication guard and envelope helpers for all handlers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Route modules, one per domain, each exposing `routes(resources) -> Router`.
//!
//! Handlers receive the raw body as bytes because the signature covers the
//! body verbatim; JSON parsing only happens after verification succeeds.

pub mod connections;
pub mod execute;
pub mod health;
pub mod oauth;
pub mod webhooks;

use crate::auth::AuthContext;
use crate::constants::headers;
use crate::errors::{AppError, AppResult, ApiResponse};
use crate::rate_limiting::RateLimitDecision;
use crate::server::ServerResources;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Request id from the tower-http layer, or a fresh one
#[must_use]
pub fn request_id(header_map: &HeaderMap) -> String {
    header_map
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToOwned::to_owned)
}

/// Authenticate the signed request, then count it against the rate limit.
///
/// The order matters: an unauthenticated caller must not consume a project's
/// quota, and a rate-limited caller still gets its identity checked first so
/// the 401/429 distinction is stable.
///
/// # Errors
///
/// Authentication failures (401) or `RATE_LIMITED` (429).
pub async fn guard(
    resources: &Arc<ServerResources>,
    header_map: &HeaderMap,
    body: &[u8],
) -> AppResult<(AuthContext, RateLimitDecision)> {
    let rid = request_id(header_map);
    let get = |name: &str| -> AppResult<String> {
        header_map
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                AppError::invalid_api_key().with_request_id(rid.clone())
            })
    };

    let public_key = get(headers::PUBLIC_KEY)?;
    let timestamp = get(headers::TIMESTAMP)?;
    let signature = get(headers::SIGNATURE)?;

    let auth = resources
        .authenticator
        .verify(&public_key, &timestamp, &signature, body)
        .await
        .map_err(|e| e.with_request_id(rid.clone()))?;

    let decision = resources.rate_limiter.check(auth.project_id);
    if !decision.allowed {
        return Err(decision.into_error().with_request_id(rid));
    }
    Ok((auth, decision))
}

/// Parse the JSON body after the signature has been verified.
///
/// # Errors
///
/// `VALIDATION_ERROR` on malformed JSON.
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    if body.is_empty() {
        return Err(AppError::validation("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::validation(format!("invalid request body: {e}")))
}

/// Wrap a payload in the response envelope with rate-limit headers attached
#[must_use]
pub fn respond<T: Serialize>(
    status: StatusCode,
    data: T,
    rid: String,
    decision: &RateLimitDecision,
) -> Response {
    let mut response = (status, Json(ApiResponse::ok(data, rid))).into_response();
    let response_headers = response.headers_mut();
    let mut set = |name: &'static str, value: String| {
        if let Ok(value) = value.parse() {
            response_headers.insert(name, value);
        }
    };
    set(headers::RATE_LIMIT_LIMIT, decision.limit.to_string());
    set(headers::RATE_LIMIT_REMAINING, decision.remaining.to_string());
    set(headers::RATE_LIMIT_RESET, decision.reset_at.to_string());
    response
}
