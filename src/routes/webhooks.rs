// ABOUTME: Webhook subscription management routes
// ABOUTME: Create returns the signing secret exactly once; lists never do
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Webhook subscription routes.

use super::{guard, parse_body, request_id, respond};
use crate::errors::AppError;
use crate::models::WebhookSubscription;
use crate::server::ServerResources;
use crate::webhooks::dispatcher::is_known_event;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Webhook subscription routes
pub struct WebhookRoutes;

#[derive(Debug, Deserialize)]
struct CreateRequest {
    url: String,
    events: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionView {
    id: Uuid,
    url: String,
    events: Vec<String>,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_triggered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status_code: Option<u16>,
    consecutive_failures: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedView {
    #[serde(flatten)]
    subscription: SubscriptionView,
    /// Shown exactly once; only the encrypted form is stored
    secret: String,
}

impl From<WebhookSubscription> for SubscriptionView {
    fn from(subscription: WebhookSubscription) -> Self {
        Self {
            id: subscription.id,
            url: subscription.url,
            events: subscription.events,
            enabled: subscription.enabled,
            last_triggered_at: subscription.last_triggered_at,
            last_status_code: subscription.last_status_code,
            consecutive_failures: subscription.consecutive_failures,
            created_at: subscription.created_at,
        }
    }
}

impl WebhookRoutes {
    /// `/webhooks` family
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/webhooks", post(Self::handle_create))
            .route("/webhooks", get(Self::handle_list))
            .route("/webhooks/:id", delete(Self::handle_delete))
            .with_state(resources)
    }

    async fn handle_create(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, &body).await?;
        let request: CreateRequest = parse_body(&body)?;

        url::Url::parse(&request.url)
            .map_err(|_| AppError::validation("url must be absolute").with_request_id(rid.clone()))?;
        if request.events.is_empty() {
            return Err(AppError::validation("events must not be empty").with_request_id(rid));
        }
        for event in &request.events {
            if !is_known_event(event) {
                return Err(AppError::validation(format!("unknown event type {event}"))
                    .with_request_id(rid.clone()));
            }
        }

        let secret = format!("whsec_{}", crate::crypto::random_token(24));
        let secret_encrypted = resources
            .cipher
            .encrypt_str(&secret)
            .map_err(|e| AppError::internal(format!("secret encryption failed: {e}")))?;

        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            project_id: auth.project_id,
            url: request.url,
            secret_encrypted,
            events: request.events,
            enabled: true,
            last_triggered_at: None,
            last_status_code: None,
            consecutive_failures: 0,
            created_at: Utc::now(),
        };
        resources
            .store
            .insert_webhook_subscription(&subscription)
            .await
            .map_err(|e| {
                AppError::internal(format!("subscription insert failed: {e}"))
                    .with_request_id(rid.clone())
            })?;

        let view = CreatedView {
            subscription: subscription.into(),
            secret,
        };
        Ok(respond(StatusCode::CREATED, view, rid, &decision))
    }

    async fn handle_list(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, b"").await?;

        let subscriptions = resources
            .store
            .list_webhook_subscriptions(auth.project_id)
            .await
            .map_err(|e| {
                AppError::internal(format!("subscription list failed: {e}"))
                    .with_request_id(rid.clone())
            })?;
        let views: Vec<SubscriptionView> =
            subscriptions.into_iter().map(SubscriptionView::from).collect();
        Ok(respond(StatusCode::OK, views, rid, &decision))
    }

    async fn handle_delete(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        Path(id): Path<Uuid>,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, &body).await?;

        let deleted = resources
            .store
            .delete_webhook_subscription(auth.project_id, id)
            .await
            .map_err(|e| {
                AppError::internal(format!("subscription delete failed: {e}"))
                    .with_request_id(rid.clone())
            })?;
        if !deleted {
            return Err(AppError::not_found("webhook subscription").with_request_id(rid));
        }
        Ok(respond(
            StatusCode::OK,
            serde_json::json!({ "deleted": true }),
            rid,
            &decision,
        ))
    }
}
