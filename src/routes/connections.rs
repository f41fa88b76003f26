// ABOUTME: Connection listing, inspection, and revocation routes
// ABOUTME: Secret-valued columns never leave the server; views are projections
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Connection routes.

use super::{guard, request_id, respond};
use crate::errors::{AppError, AppResult};
use crate::models::Connection;
use crate::server::ServerResources;
use crate::store::ConnectionFilter;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Connection routes
pub struct ConnectionRoutes;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    user_id: Option<String>,
    provider: Option<String>,
    status: Option<String>,
}

/// What a project sees of a connection; token ciphertexts stay server-side
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionView {
    id: String,
    provider: String,
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_email: Option<String>,
    scopes: Vec<String>,
    status: crate::models::ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ConnectionRoutes {
    /// `/connections` family
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/connections", get(Self::handle_list))
            .route("/connections/:id", get(Self::handle_get))
            .route("/connections/:id", delete(Self::handle_revoke))
            .with_state(resources)
    }

    async fn view(resources: &Arc<ServerResources>, connection: Connection) -> ConnectionView {
        let user_id = resources
            .store
            .get_end_user(connection.end_user_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.external_id)
            .unwrap_or_default();
        ConnectionView {
            id: connection.id,
            provider: connection.provider,
            user_id,
            provider_email: connection.provider_email,
            scopes: connection.scopes,
            status: connection.status,
            error_message: connection.error_message,
            expires_at: connection.expires_at,
            last_used_at: connection.last_used_at,
            created_at: connection.created_at,
        }
    }

    async fn handle_list(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        Query(query): Query<ListQuery>,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, b"").await?;

        let status = match query.status.as_deref() {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|e: String| AppError::validation(e).with_request_id(rid.clone()))?,
            ),
            None => None,
        };
        let filter = ConnectionFilter {
            external_user_id: query.user_id,
            provider: query.provider,
            status,
        };

        let connections = resources
            .store
            .list_connections(auth.project_id, &filter)
            .await
            .map_err(|e| {
                AppError::internal(format!("connection list failed: {e}")).with_request_id(rid.clone())
            })?;

        let mut views = Vec::with_capacity(connections.len());
        for connection in connections {
            views.push(Self::view(&resources, connection).await);
        }
        Ok(respond(StatusCode::OK, views, rid, &decision))
    }

    async fn handle_get(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        Path(id): Path<String>,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, b"").await?;

        let connection = Self::owned(&resources, auth.project_id, &id)
            .await
            .map_err(|e| e.with_request_id(rid.clone()))?;
        let view = Self::view(&resources, connection).await;
        Ok(respond(StatusCode::OK, view, rid, &decision))
    }

    async fn handle_revoke(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        Path(id): Path<String>,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, &body).await?;

        let revoked = resources
            .gateway
            .revoke_connection(auth.project_id, &id)
            .await
            .map_err(|e| e.with_request_id(rid.clone()))?;
        let view = Self::view(&resources, revoked).await;
        Ok(respond(StatusCode::OK, view, rid, &decision))
    }

    async fn owned(
        resources: &Arc<ServerResources>,
        project_id: uuid::Uuid,
        id: &str,
    ) -> AppResult<Connection> {
        let connection = resources
            .store
            .get_connection(id)
            .await
            .map_err(|e| AppError::internal(format!("connection load failed: {e}")))?
            .ok_or_else(|| AppError::connection_not_found(id))?;
        if connection.project_id != project_id {
            return Err(AppError::connection_not_found(id));
        }
        Ok(connection)
    }
}
