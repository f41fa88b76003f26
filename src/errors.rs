// ABOUTME: Centralized error handling and response envelope for the broker API
// ABOUTME: Defines the error taxonomy, HTTP status mapping, and axum response conversion
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Unified Error Handling
//!
//! Every failure surfaced to a project maps to one [`ErrorCode`] with a fixed
//! HTTP status. Handlers return [`AppError`]; the axum conversion wraps it in
//! the standard response envelope with the request id echoed back.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error kinds surfaced through the project-facing API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown or revoked public key
    InvalidApiKey,
    /// HMAC mismatch on a signed request
    InvalidSignature,
    /// Signed-request timestamp outside the accepted window
    TimestampExpired,
    /// OAuth state missing, consumed, or expired
    InvalidState,
    /// Unknown connection id, or a connection owned by another project
    ConnectionNotFound,
    /// Refresh failed terminally; the user must re-connect
    ConnectionExpired,
    /// Provider revoked the stored credentials
    ConnectionRevoked,
    /// Provider rejected the call for a missing scope
    ScopeInsufficient,
    /// Transient or unclassified provider fault
    ProviderError,
    /// Project quota exceeded
    RateLimited,
    /// Request schema violation
    ValidationError,
    /// Generic not-found
    NotFound,
    /// Generic authorization failure
    Forbidden,
    /// Broker-side fault
    InternalError,
}

impl ErrorCode {
    /// HTTP status for this error kind
    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::InvalidApiKey
            | Self::InvalidSignature
            | Self::TimestampExpired
            | Self::ConnectionExpired
            | Self::ConnectionRevoked => StatusCode::UNAUTHORIZED,
            Self::InvalidState | Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::ConnectionNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::ScopeInsufficient | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ProviderError => StatusCode::BAD_GATEWAY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire name, e.g. `INVALID_STATE`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::TimestampExpired => "TIMESTAMP_EXPIRED",
            Self::InvalidState => "INVALID_STATE",
            Self::ConnectionNotFound => "CONNECTION_NOT_FOUND",
            Self::ConnectionExpired => "CONNECTION_EXPIRED",
            Self::ConnectionRevoked => "CONNECTION_REVOKED",
            Self::ScopeInsufficient => "SCOPE_INSUFFICIENT",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Generic description safe to show a caller
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::InvalidApiKey => "The provided API key is unknown or revoked",
            Self::InvalidSignature => "Request signature verification failed",
            Self::TimestampExpired => "Request timestamp is outside the accepted window",
            Self::InvalidState => "OAuth state is missing, already used, or expired",
            Self::ConnectionNotFound => "The requested connection was not found",
            Self::ConnectionExpired => "The connection has expired; the user must reconnect",
            Self::ConnectionRevoked => "The provider revoked this connection",
            Self::ScopeInsufficient => "The connection lacks a scope required for this call",
            Self::ProviderError => "The upstream provider returned an error",
            Self::RateLimited => "Rate limit exceeded",
            Self::ValidationError => "The request body failed validation",
            Self::NotFound => "The requested resource was not found",
            Self::Forbidden => "You do not have permission to perform this action",
            Self::InternalError => "An internal error occurred",
        }
    }
}

/// Application error carried through handlers and services
#[derive(Debug, Clone, Error)]
pub struct AppError {
    /// Error kind
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Request id echoed into the envelope when known
    pub request_id: Option<String>,
    /// Seconds the caller should wait before retrying (rate limiting)
    pub retry_after_secs: Option<u64>,
    /// Additional response headers (rate-limit bookkeeping on 429s)
    pub extra_headers: Vec<(&'static str, String)>,
}

impl AppError {
    /// Create an error with the given code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
            retry_after_secs: None,
            extra_headers: Vec::new(),
        }
    }

    /// Attach a response header
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.extra_headers.push((name, value));
        self
    }

    /// Attach a request id for envelope echo
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a Retry-After hint
    #[must_use]
    pub const fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// HTTP status for this error
    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Message safe for the client: internal faults collapse to the generic
    /// description, everything else passes through.
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        match self.code {
            ErrorCode::InternalError => self.code.description().to_owned(),
            _ => self.message.clone(),
        }
    }

    /// Unknown or revoked public key
    #[must_use]
    pub fn invalid_api_key() -> Self {
        Self::new(ErrorCode::InvalidApiKey, ErrorCode::InvalidApiKey.description())
    }

    /// HMAC mismatch
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::new(ErrorCode::InvalidSignature, ErrorCode::InvalidSignature.description())
    }

    /// Timestamp outside the replay window
    #[must_use]
    pub fn timestamp_expired() -> Self {
        Self::new(ErrorCode::TimestampExpired, ErrorCode::TimestampExpired.description())
    }

    /// OAuth state rejected
    #[must_use]
    pub fn invalid_state() -> Self {
        Self::new(ErrorCode::InvalidState, ErrorCode::InvalidState.description())
    }

    /// Connection missing or not owned by the caller
    #[must_use]
    pub fn connection_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::ConnectionNotFound,
            format!("connection {id} not found"),
        )
    }

    /// Request schema violation
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Provider fault the caller may retry
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderError, message)
    }

    /// Broker-side fault
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Generic not-found
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::new(ErrorCode::NotFound, format!("{resource} not found"))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::validation(format!("JSON error: {error}"))
    }
}

/// Result alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;

/// Metadata attached to every response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    /// Request id for tracing
    pub request_id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
}

impl ResponseMeta {
    /// Build metadata for the given request id
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Error body inside the envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error kind
    pub code: ErrorCode,
    /// Sanitized message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The uniform response envelope: `{success, data?, error?, meta}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the call succeeded
    pub success: bool,
    /// Payload on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error body on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Request metadata
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    /// Successful envelope
    #[must_use]
    pub fn ok(data: T, request_id: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: ResponseMeta::new(request_id),
        }
    }
}

impl ApiResponse<serde_json::Value> {
    /// Failed envelope
    #[must_use]
    pub fn err(error: &AppError) -> Self {
        let request_id = error.request_id.clone().unwrap_or_else(|| "-".to_owned());
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code,
                message: error.sanitized_message(),
                details: None,
            }),
            meta: ResponseMeta::new(request_id),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(code = ?self.code, detail = %self.message, "request failed");

        let status = self.http_status();
        let body = ApiResponse::err(&self);
        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        for (name, value) in &self.extra_headers {
            if let Ok(value) = value.parse() {
                response.headers_mut().insert(*name, value);
            }
        }
        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(ErrorCode::InvalidApiKey.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::InvalidSignature.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::TimestampExpired.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::InvalidState.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::ConnectionNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ConnectionExpired.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::ConnectionRevoked.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::ScopeInsufficient.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::ProviderError.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorCode::RateLimited.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn wire_format_is_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ConnectionExpired).unwrap();
        assert_eq!(json, "\"CONNECTION_EXPIRED\"");
        let json = serde_json::to_string(&ErrorCode::InvalidApiKey).unwrap();
        assert_eq!(json, "\"INVALID_API_KEY\"");

        // as_str mirrors the serde name
        let codes = [
            ErrorCode::InvalidApiKey,
            ErrorCode::InvalidState,
            ErrorCode::ConnectionExpired,
            ErrorCode::ScopeInsufficient,
            ErrorCode::RateLimited,
        ];
        for code in codes {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let err = AppError::internal("pool exhausted on shard 7");
        assert_eq!(err.sanitized_message(), "An internal error occurred");

        let err = AppError::validation("userId is required");
        assert_eq!(err.sanitized_message(), "userId is required");
    }
}
