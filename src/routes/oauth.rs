// ABOUTME: OAuth route handlers: authorization initiation and provider callback
// ABOUTME: The callback is authenticated by its state token, not by signature
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! OAuth routes.

use super::{guard, parse_body, request_id, respond};
use crate::errors::AppError;
use crate::server::ServerResources;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

/// OAuth routes
pub struct OAuthRoutes;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    provider: String,
    user_id: String,
    redirect_uri: String,
    scopes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl OAuthRoutes {
    /// `/oauth/connect` and `/oauth/callback`
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/oauth/connect", post(Self::handle_connect))
            .route("/oauth/callback", get(Self::handle_callback))
            .with_state(resources)
    }

    async fn handle_connect(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);
        let (auth, decision) = guard(&resources, &header_map, &body).await?;
        let request: ConnectRequest = parse_body(&body)?;

        let initiation = resources
            .oauth
            .initiate(
                auth.project_id,
                &request.provider,
                &request.user_id,
                &request.redirect_uri,
                request.scopes,
            )
            .await
            .map_err(|e| e.with_request_id(rid.clone()))?;

        Ok(respond(StatusCode::OK, initiation, rid, &decision))
    }

    /// Provider redirect target. Authenticated by the single-use state
    /// token; ends in a 302 back to the project in every outcome that has a
    /// known redirect URI.
    async fn handle_callback(
        State(resources): State<Arc<ServerResources>>,
        header_map: HeaderMap,
        Query(query): Query<CallbackQuery>,
    ) -> Result<Response, AppError> {
        let rid = request_id(&header_map);

        let state = query
            .state
            .ok_or_else(|| AppError::invalid_state().with_request_id(rid.clone()))?;

        // the provider may come back with an error instead of a code (the
        // user declined consent); the state row still knows where to send
        // the user, so that path redirects too
        let redirect = match query.code {
            Some(code) => resources.oauth.handle_callback(&code, &state).await,
            None => {
                if let Some(provider_error) = &query.error {
                    tracing::warn!(error = %provider_error, "provider returned an error instead of a code");
                }
                resources.oauth.handle_denied_callback(&state).await
            }
        }
        .map_err(|e| e.with_request_id(rid))?;

        // a plain 302 keeps user agents re-issuing a GET to the project
        let mut response = StatusCode::FOUND.into_response();
        if let Ok(location) = redirect.location.parse() {
            response.headers_mut().insert(http::header::LOCATION, location);
        }
        Ok(response)
    }
}
