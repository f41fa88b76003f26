// ABOUTME: Gmail reference adapter translating uniform verbs to the Gmail REST API
// ABOUTME: Handles code exchange, refresh, message verbs, and error classification
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Gmail adapter.
//!
//! The reference implementation of the adapter capability set. Verbs map to
//! the Gmail REST surface:
//!
//! - `fetch` lists or reads messages, normalized into
//!   [`NormalizedMessage`](super::NormalizedMessage)
//! - `create` sends a message
//! - `update` modifies labels / read state
//! - `delete` moves a message to trash
//!
//! Endpoint URLs are constructor arguments so tests can point the adapter at
//! a local server.

use super::normalized::{Attachment, EmailAddress, MessageBody, NormalizedMessage, Page};
use super::{
    build_authorization_url_with, AuthorizationRequest, ClientCredentials, ConnectionHandle,
    ProviderAdapter, ProviderCategory, ProviderError, ProviderUserInfo, TokenGrant,
};
use crate::constants::service;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_PAGE_SIZE: u64 = 25;

/// Gmail provider adapter
pub struct GmailAdapter {
    client: reqwest::Client,
    auth_url: String,
    token_url: String,
    revoke_url: String,
    api_base: String,
}

impl Default for GmailAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailAdapter {
    /// Adapter against the production Google endpoints
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(
            DEFAULT_AUTH_URL.to_owned(),
            DEFAULT_TOKEN_URL.to_owned(),
            DEFAULT_REVOKE_URL.to_owned(),
            DEFAULT_API_BASE.to_owned(),
        )
    }

    /// Adapter with overridden endpoints (tests)
    #[must_use]
    pub fn with_endpoints(
        auth_url: String,
        token_url: String,
        revoke_url: String,
        api_base: String,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(service::USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            auth_url,
            token_url,
            revoke_url,
            api_base,
        }
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
    ) -> Result<TokenGrant, ProviderError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_oauth_failure(status.as_u16(), &body));
        }

        let token: TokenResponse = response.json().await.map_err(classify_transport)?;
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_type: token.token_type.unwrap_or_else(|| "Bearer".to_owned()),
            scopes: token
                .scope
                .map(|s| s.split(' ').map(ToOwned::to_owned).collect())
                .unwrap_or_default(),
        })
    }

    async fn api_get(&self, handle: &ConnectionHandle, path: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(format!("{}{path}", self.api_base))
            .bearer_auth(&handle.access_token)
            .send()
            .await
            .map_err(classify_transport)?;
        read_api_response(response).await
    }

    async fn api_post(
        &self,
        handle: &ConnectionHandle,
        path: &str,
        body: &Value,
    ) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}{path}", self.api_base))
            .bearer_auth(&handle.access_token)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;
        read_api_response(response).await
    }

    /// List message ids matching the query, then hydrate headers for each.
    async fn fetch_message_page(
        &self,
        handle: &ConnectionHandle,
        params: &Value,
    ) -> Result<Value, ProviderError> {
        let max_results = params
            .get("maxResults")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(100);

        let mut path = format!("/users/me/messages?maxResults={max_results}");
        if let Some(q) = params.get("q").and_then(Value::as_str) {
            path.push_str(&format!("&q={}", urlencoding::encode(q)));
        }
        if let Some(token) = params.get("pageToken").and_then(Value::as_str) {
            path.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let listing = self.api_get(handle, &path).await?;
        let ids: Vec<String> = listing
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let raw = self
                .api_get(handle, &format!("/users/me/messages/{id}?format=metadata"))
                .await?;
            items.push(normalize_message(&raw, false));
        }

        let page = Page {
            items,
            next_page_token: listing
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            result_size_estimate: listing.get("resultSizeEstimate").and_then(Value::as_u64),
        };
        serde_json::to_value(page).map_err(|e| ProviderError::Transient(e.to_string()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn name(&self) -> &'static str {
        "gmail"
    }

    fn display_name(&self) -> &'static str {
        "Gmail"
    }

    fn category(&self) -> ProviderCategory {
        ProviderCategory::Mail
    }

    fn build_authorization_url(&self, request: &AuthorizationRequest<'_>) -> String {
        // offline access is what makes Google return a refresh token
        build_authorization_url_with(
            request,
            &[("access_type", "offline"), ("prompt", "consent")],
        )
    }

    fn translate_scopes(&self, broker_scopes: &[String]) -> Vec<String> {
        broker_scopes
            .iter()
            .map(|scope| match scope.as_str() {
                "email.read" => "https://www.googleapis.com/auth/gmail.readonly".to_owned(),
                "email.send" => "https://www.googleapis.com/auth/gmail.send".to_owned(),
                "email.modify" => "https://www.googleapis.com/auth/gmail.modify".to_owned(),
                "profile" => "https://www.googleapis.com/auth/userinfo.email".to_owned(),
                other => other.to_owned(),
            })
            .collect()
    }

    async fn exchange_code(
        &self,
        credentials: &ClientCredentials,
        code: &str,
        pkce_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("code", code),
            ("code_verifier", pkce_verifier),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh(
        &self,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn fetch_user_info(
        &self,
        access_token: &str,
    ) -> Result<Option<ProviderUserInfo>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/users/me/profile", self.api_base))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(classify_transport)?;
        let profile = read_api_response(response).await?;
        let email = profile
            .get("emailAddress")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        Ok(Some(ProviderUserInfo {
            user_id: email.clone(),
            email,
        }))
    }

    async fn revoke(&self, access_token: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(&self.revoke_url)
            .form(&[("token", access_token)])
            .send()
            .await
            .map_err(classify_transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: "revocation rejected".to_owned(),
            })
        }
    }

    async fn fetch(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        if let Some(id) = params.get("id").and_then(Value::as_str) {
            let raw = self
                .api_get(handle, &format!("/users/me/messages/{id}?format=full"))
                .await?;
            let message = normalize_message(&raw, true);
            return serde_json::to_value(message)
                .map_err(|e| ProviderError::Transient(e.to_string()));
        }
        self.fetch_message_page(handle, &params).await
    }

    async fn create(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        let to = params
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Api {
                status: 400,
                message: "create requires `to`".to_owned(),
            })?;
        let subject = params.get("subject").and_then(Value::as_str).unwrap_or("");
        let text = params.get("text").and_then(Value::as_str).unwrap_or("");

        let rfc822 = format!(
            "To: {to}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{text}"
        );
        let body = json!({ "raw": URL_SAFE_NO_PAD.encode(rfc822) });
        self.api_post(handle, "/users/me/messages/send", &body).await
    }

    async fn update(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        let id = require_id(&params)?;
        let mut add: Vec<String> = string_list(&params, "addLabelIds");
        let mut remove: Vec<String> = string_list(&params, "removeLabelIds");
        // markRead sugar: read state is the UNREAD label on Gmail
        match params.get("markRead").and_then(Value::as_bool) {
            Some(true) => remove.push("UNREAD".to_owned()),
            Some(false) => add.push("UNREAD".to_owned()),
            None => {}
        }
        let body = json!({ "addLabelIds": add, "removeLabelIds": remove });
        self.api_post(handle, &format!("/users/me/messages/{id}/modify"), &body)
            .await
    }

    async fn delete(
        &self,
        handle: &ConnectionHandle,
        params: Value,
    ) -> Result<Value, ProviderError> {
        let id = require_id(&params)?;
        self.api_post(handle, &format!("/users/me/messages/{id}/trash"), &json!({}))
            .await
    }
}

fn require_id(params: &Value) -> Result<&str, ProviderError> {
    params
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Api {
            status: 400,
            message: "missing `id`".to_owned(),
        })
}

fn string_list(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn classify_transport(error: reqwest::Error) -> ProviderError {
    ProviderError::Transient(error.to_string())
}

/// Map an OAuth token-endpoint failure onto the classification the token
/// manager keys its state machine off.
fn classify_oauth_failure(status: u16, body: &str) -> ProviderError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = parsed.get("error").and_then(Value::as_str).unwrap_or("");
    let description = parsed
        .get("error_description")
        .and_then(Value::as_str)
        .unwrap_or(body);

    if status >= 500 {
        return ProviderError::Transient(format!("token endpoint returned {status}"));
    }
    match error {
        "invalid_grant" => {
            if description.to_lowercase().contains("expired") {
                ProviderError::ExpiredGrant(description.to_owned())
            } else {
                ProviderError::InvalidGrant(description.to_owned())
            }
        }
        _ => ProviderError::Api {
            status,
            message: description.to_owned(),
        },
    }
}

async fn read_api_response(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if status.is_success() {
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        return response.json().await.map_err(classify_transport);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
        .unwrap_or(body);

    Err(match status.as_u16() {
        401 => ProviderError::ExpiredGrant(message),
        403 if message.to_lowercase().contains("scope")
            || message.to_lowercase().contains("insufficient") =>
        {
            ProviderError::ScopeInsufficient(message)
        }
        429 => ProviderError::Transient(format!("provider rate limited: {message}")),
        code if code >= 500 => ProviderError::Transient(message),
        code => ProviderError::Api {
            status: code,
            message,
        },
    })
}

/// Translate a Gmail message resource into the common schema.
fn normalize_message(raw: &Value, include_body_and_raw: bool) -> NormalizedMessage {
    let headers = raw
        .pointer("/payload/headers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let header = |name: &str| -> Option<String> {
        headers.iter().find_map(|h| {
            let matches = h
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(name));
            if matches {
                h.get("value").and_then(Value::as_str).map(ToOwned::to_owned)
            } else {
                None
            }
        })
    };

    let labels: Vec<String> = raw
        .get("labelIds")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let timestamp = raw
        .get("internalDate")
        .and_then(Value::as_str)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let body = include_body_and_raw.then(|| extract_body(raw)).flatten();
    let attachments = extract_attachments(raw);

    NormalizedMessage {
        id: raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        thread_id: raw
            .get("threadId")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        provider: "gmail".to_owned(),
        subject: header("Subject").unwrap_or_default(),
        snippet: raw
            .get("snippet")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        body,
        from: header("From").map_or(
            EmailAddress {
                email: String::new(),
                name: None,
            },
            |value| parse_address(&value),
        ),
        to: header("To").map(|value| parse_address_list(&value)).unwrap_or_default(),
        cc: header("Cc").map(|value| parse_address_list(&value)),
        timestamp,
        is_read: !labels.iter().any(|l| l == "UNREAD"),
        labels,
        attachments,
        raw: include_body_and_raw.then(|| raw.clone()),
    }
}

/// `"Ada Lovelace <ada@example.com>"` → address + display name
fn parse_address(value: &str) -> EmailAddress {
    let value = value.trim();
    if let Some((name, rest)) = value.rsplit_once('<') {
        let email = rest.trim_end_matches('>').trim().to_owned();
        let name = name.trim().trim_matches('"');
        EmailAddress {
            email,
            name: (!name.is_empty()).then(|| name.to_owned()),
        }
    } else {
        EmailAddress {
            email: value.to_owned(),
            name: None,
        }
    }
}

fn parse_address_list(value: &str) -> Vec<EmailAddress> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_address)
        .collect()
}

fn extract_body(raw: &Value) -> Option<MessageBody> {
    fn decode_part(part: &Value) -> Option<String> {
        part.pointer("/body/data")
            .and_then(Value::as_str)
            .and_then(|data| URL_SAFE_NO_PAD.decode(data).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    fn walk(part: &Value, body: &mut MessageBody) {
        let mime = part.get("mimeType").and_then(Value::as_str).unwrap_or("");
        match mime {
            "text/plain" if body.text.is_none() => body.text = decode_part(part),
            "text/html" if body.html.is_none() => body.html = decode_part(part),
            _ => {}
        }
        if let Some(parts) = part.get("parts").and_then(Value::as_array) {
            for nested in parts {
                walk(nested, body);
            }
        }
    }

    let payload = raw.get("payload")?;
    let mut body = MessageBody::default();
    walk(payload, &mut body);
    (body.text.is_some() || body.html.is_some()).then_some(body)
}

fn extract_attachments(raw: &Value) -> Option<Vec<Attachment>> {
    fn walk(part: &Value, out: &mut Vec<Attachment>) {
        let filename = part.get("filename").and_then(Value::as_str).unwrap_or("");
        let attachment_id = part.pointer("/body/attachmentId").and_then(Value::as_str);
        if let (false, Some(id)) = (filename.is_empty(), attachment_id) {
            out.push(Attachment {
                id: id.to_owned(),
                filename: Some(filename.to_owned()),
                mime_type: part
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned),
                size: part.pointer("/body/size").and_then(Value::as_u64),
            });
        }
        if let Some(parts) = part.get("parts").and_then(Value::as_array) {
            for nested in parts {
                walk(nested, out);
            }
        }
    }

    let payload = raw.get("payload")?;
    let mut attachments = Vec::new();
    walk(payload, &mut attachments);
    (!attachments.is_empty()).then_some(attachments)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_translation_maps_broker_vocabulary() {
        let adapter = GmailAdapter::new();
        let scopes = adapter.translate_scopes(&[
            "email.read".to_owned(),
            "custom.passthrough".to_owned(),
        ]);
        assert_eq!(
            scopes,
            vec![
                "https://www.googleapis.com/auth/gmail.readonly".to_owned(),
                "custom.passthrough".to_owned(),
            ]
        );
    }

    #[test]
    fn oauth_failures_classify_by_grant_error() {
        let invalid = classify_oauth_failure(
            400,
            r#"{"error":"invalid_grant","error_description":"Token has been revoked."}"#,
        );
        assert!(matches!(invalid, ProviderError::InvalidGrant(_)));

        let expired = classify_oauth_failure(
            400,
            r#"{"error":"invalid_grant","error_description":"Token has expired."}"#,
        );
        assert!(matches!(expired, ProviderError::ExpiredGrant(_)));

        let transient = classify_oauth_failure(503, "upstream unavailable");
        assert!(matches!(transient, ProviderError::Transient(_)));

        let other = classify_oauth_failure(
            400,
            r#"{"error":"invalid_client","error_description":"bad client"}"#,
        );
        assert!(matches!(other, ProviderError::Api { status: 400, .. }));
    }

    #[test]
    fn address_parsing() {
        let parsed = parse_address("Ada Lovelace <ada@example.com>");
        assert_eq!(parsed.email, "ada@example.com");
        assert_eq!(parsed.name.as_deref(), Some("Ada Lovelace"));

        let bare = parse_address("bob@example.com");
        assert_eq!(bare.email, "bob@example.com");
        assert!(bare.name.is_none());

        let list = parse_address_list("a@x.com, \"B\" <b@x.com>");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].email, "b@x.com");
    }

    #[test]
    fn message_normalization_from_gmail_payload() {
        let raw = json!({
            "id": "m-1",
            "threadId": "t-1",
            "snippet": "hello there",
            "internalDate": "1700000000000",
            "labelIds": ["INBOX", "UNREAD"],
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": "Greetings"},
                    {"name": "From", "value": "Ada <ada@example.com>"},
                    {"name": "To", "value": "bob@example.com"}
                ],
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "body": {"data": URL_SAFE_NO_PAD.encode("plain body")}
                    },
                    {
                        "mimeType": "text/html",
                        "body": {"data": URL_SAFE_NO_PAD.encode("<b>html body</b>")}
                    }
                ]
            }
        });

        let message = normalize_message(&raw, true);
        assert_eq!(message.id, "m-1");
        assert_eq!(message.thread_id.as_deref(), Some("t-1"));
        assert_eq!(message.subject, "Greetings");
        assert_eq!(message.from.email, "ada@example.com");
        assert_eq!(message.to[0].email, "bob@example.com");
        assert!(!message.is_read);
        assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
        let body = message.body.unwrap();
        assert_eq!(body.text.as_deref(), Some("plain body"));
        assert_eq!(body.html.as_deref(), Some("<b>html body</b>"));
        assert!(message.raw.is_some());

        // metadata-only normalization omits body and raw
        let listed = normalize_message(&raw, false);
        assert!(listed.body.is_none());
        assert!(listed.raw.is_none());
    }
}
