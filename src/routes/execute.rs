// ABOUTME: Verb dispatch routes: per-provider paths and the generic execute endpoint
// ABOUTME: Thin handlers delegating to the gateway
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Dispatch routes: `POST /{provider}/{verb}` and `POST /execute`.

use super::{guard, parse_body, request_id, respond};
use crate::errors::AppError;
use crate::providers::Verb;
use crate::server::ServerResources;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Dispatch routes
pub struct ExecuteRoutes;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerbRequest {
    connection_id: String,
    #[serde(flatten)]
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    connection_id: String,
    provider: String,
    action: String,
    #[serde(default)]
    params: Value,
}

impl ExecuteRoutes {
    /// Provider-verb and generic dispatch routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/execute", post(Self::handle_execute))
            .route("/:provider/:verb", post(Self::handle_provider_verb))
            .with_state(resources)
    }

    async fn handle_provider_verb(
        State(resources): State<Arc<ServerResources>>,
        Path((provider, verb)): Path<(String, String)>,
        header_map: HeaderMap,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, &body).await?;

        let verb = Verb::parse(&verb)
            .ok_or_else(|| AppError::validation(format!("unknown verb {verb}")).with_request_id(rid.clone()))?;
        let request: VerbRequest = parse_body(&body)?;

        Self::check_provider_match(&resources, auth.project_id, &request.connection_id, &provider)
            .await
            .map_err(|e| e.with_request_id(rid.clone()))?;

        let endpoint = format!("/v1/{provider}/{verb}");
        let data = resources
            .gateway
            .dispatch(auth.project_id, &request.connection_id, verb, request.params, &endpoint)
            .await
            .map_err(|e| e.with_request_id(rid.clone()))?;

        Ok(respond(StatusCode::OK, data, rid, &decision))
    }

    async fn handle_execute(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, &body).await?;
        let request: ExecuteRequest = parse_body(&body)?;

        let verb = Verb::parse(&request.action).ok_or_else(|| {
            AppError::validation(format!("unknown action {}", request.action))
                .with_request_id(rid.clone())
        })?;

        Self::check_provider_match(
            &resources,
            auth.project_id,
            &request.connection_id,
            &request.provider,
        )
        .await
        .map_err(|e| e.with_request_id(rid.clone()))?;

        let data = resources
            .gateway
            .dispatch(
                auth.project_id,
                &request.connection_id,
                verb,
                request.params,
                "/v1/execute",
            )
            .await
            .map_err(|e| e.with_request_id(rid.clone()))?;

        Ok(respond(StatusCode::OK, data, rid, &decision))
    }

    /// The connection row is authoritative for routing; a mismatched
    /// `provider` in the body is a client bug worth rejecting loudly.
    async fn check_provider_match(
        resources: &Arc<ServerResources>,
        project_id: uuid::Uuid,
        connection_id: &str,
        provider: &str,
    ) -> Result<(), AppError> {
        let connection = resources
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| AppError::internal(format!("connection load failed: {e}")))?
            .ok_or_else(|| AppError::connection_not_found(connection_id))?;
        if connection.project_id != project_id {
            return Err(AppError::connection_not_found(connection_id));
        }
        if connection.provider != provider {
            return Err(AppError::validation(format!(
                "connection {connection_id} belongs to provider {}, not {provider}",
                connection.provider
            )));
        }
        Ok(())
    }
}
