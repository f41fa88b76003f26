// ABOUTME: PostgreSQL store backend over sqlx
// ABOUTME: Implements the data-access contract with row-level guarantees
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! PostgreSQL implementation of the [`Store`] contract.
//!
//! The single-use state guard is a conditional `UPDATE … WHERE used_at IS
//! NULL` checked through `rows_affected`; the connection upsert rides the
//! `(project_id, provider, end_user_id)` unique constraint; cross-process
//! refresh coordination uses session advisory locks.
//!
//! Session advisory locks belong to the backend session that took them, so
//! a lock acquired on one pooled connection cannot be released from another.
//! `try_advisory_lock` therefore checks a connection out of the pool, runs
//! `pg_try_advisory_lock` on it, and parks that connection until
//! `advisory_unlock` releases the lock on the same session and returns it to
//! the pool. A crashed holder drops the connection, which ends the session
//! and frees the lock.

use super::{ConnectionFilter, Store, TokenUpdate};
use crate::models::{
    ApiKeyPair, ApiKeyStatus, ApiLogEntry, Connection, ConnectionStatus, EndUser, EnvironmentTag,
    OAuthState, Project, ProviderConfigRecord, WebhookEventRow, WebhookEventStatus,
    WebhookSubscription,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Production store backend
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    // connections parked while they own a session advisory lock, by key
    held_locks: Arc<Mutex<HashMap<String, PoolConnection<Postgres>>>>,
}

impl PostgresStore {
    /// Connect to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self {
            pool,
            held_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create the schema if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS projects (
                id UUID PRIMARY KEY,
                owner_id UUID NOT NULL,
                environment TEXT NOT NULL CHECK (environment IN ('test', 'live')),
                name TEXT NOT NULL,
                settings JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                public_key TEXT UNIQUE NOT NULL,
                secret_encrypted TEXT NOT NULL,
                environment TEXT NOT NULL CHECK (environment IN ('test', 'live')),
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'revoked')),
                last_used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS provider_configs (
                name TEXT PRIMARY KEY,
                auth_url TEXT NOT NULL,
                token_url TEXT NOT NULL,
                permitted_scopes TEXT[] NOT NULL DEFAULT '{}',
                default_scopes TEXT[] NOT NULL DEFAULT '{}',
                client_id TEXT NOT NULL,
                client_secret_encrypted TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT true
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS end_users (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,
                email TEXT,
                display_name TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (project_id, external_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS oauth_states (
                id UUID PRIMARY KEY,
                state_token TEXT UNIQUE NOT NULL,
                project_id UUID NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                provider TEXT NOT NULL,
                end_user_id UUID NOT NULL REFERENCES end_users(id) ON DELETE CASCADE,
                redirect_uri TEXT NOT NULL,
                scopes TEXT[] NOT NULL DEFAULT '{}',
                pkce_verifier TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                project_id UUID NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                provider TEXT NOT NULL,
                end_user_id UUID NOT NULL REFERENCES end_users(id) ON DELETE CASCADE,
                provider_user_id TEXT,
                provider_email TEXT,
                access_token_encrypted TEXT NOT NULL,
                refresh_token_encrypted TEXT,
                token_type TEXT NOT NULL DEFAULT 'Bearer',
                expires_at TIMESTAMPTZ,
                scopes TEXT[] NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'active', 'expired', 'revoked', 'error')),
                error_message TEXT,
                last_used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (project_id, provider, end_user_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                secret_encrypted TEXT NOT NULL,
                events TEXT[] NOT NULL DEFAULT '{}',
                enabled BOOLEAN NOT NULL DEFAULT true,
                last_triggered_at TIMESTAMPTZ,
                last_status_code INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id TEXT PRIMARY KEY,
                subscription_id UUID NOT NULL REFERENCES webhook_subscriptions(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'delivered', 'failed')),
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS api_logs (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                provider TEXT,
                connection_id TEXT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                latency_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn environment_from_str(s: &str) -> Result<EnvironmentTag> {
    match s {
        "test" => Ok(EnvironmentTag::Test),
        "live" => Ok(EnvironmentTag::Live),
        other => Err(anyhow!("unknown environment tag {other}")),
    }
}

fn key_status_from_str(s: &str) -> Result<ApiKeyStatus> {
    match s {
        "active" => Ok(ApiKeyStatus::Active),
        "revoked" => Ok(ApiKeyStatus::Revoked),
        other => Err(anyhow!("unknown api key status {other}")),
    }
}

fn connection_status_to_str(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Pending => "pending",
        ConnectionStatus::Active => "active",
        ConnectionStatus::Expired => "expired",
        ConnectionStatus::Revoked => "revoked",
        ConnectionStatus::Error => "error",
    }
}

fn connection_status_from_str(s: &str) -> Result<ConnectionStatus> {
    match s {
        "pending" => Ok(ConnectionStatus::Pending),
        "active" => Ok(ConnectionStatus::Active),
        "expired" => Ok(ConnectionStatus::Expired),
        "revoked" => Ok(ConnectionStatus::Revoked),
        "error" => Ok(ConnectionStatus::Error),
        other => Err(anyhow!("unknown connection status {other}")),
    }
}

fn event_status_to_str(status: WebhookEventStatus) -> &'static str {
    match status {
        WebhookEventStatus::Pending => "pending",
        WebhookEventStatus::Delivered => "delivered",
        WebhookEventStatus::Failed => "failed",
    }
}

fn event_status_from_str(s: &str) -> Result<WebhookEventStatus> {
    match s {
        "pending" => Ok(WebhookEventStatus::Pending),
        "delivered" => Ok(WebhookEventStatus::Delivered),
        "failed" => Ok(WebhookEventStatus::Failed),
        other => Err(anyhow!("unknown webhook event status {other}")),
    }
}

fn decode_connection(row: &PgRow) -> Result<Connection> {
    Ok(Connection {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        provider: row.try_get("provider")?,
        end_user_id: row.try_get("end_user_id")?,
        provider_user_id: row.try_get("provider_user_id")?,
        provider_email: row.try_get("provider_email")?,
        access_token_encrypted: row.try_get("access_token_encrypted")?,
        refresh_token_encrypted: row.try_get("refresh_token_encrypted")?,
        token_type: row.try_get("token_type")?,
        expires_at: row.try_get("expires_at")?,
        scopes: row.try_get("scopes")?,
        status: connection_status_from_str(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_subscription(row: &PgRow) -> Result<WebhookSubscription> {
    Ok(WebhookSubscription {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        url: row.try_get("url")?,
        secret_encrypted: row.try_get("secret_encrypted")?,
        events: row.try_get("events")?,
        enabled: row.try_get("enabled")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        last_status_code: row
            .try_get::<Option<i32>, _>("last_status_code")?
            .map(|c| c as u16),
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as u32,
        created_at: row.try_get("created_at")?,
    })
}

fn decode_event(row: &PgRow) -> Result<WebhookEventRow> {
    Ok(WebhookEventRow {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status: event_status_from_str(&row.try_get::<String, _>("status")?)?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn decode_state(row: &PgRow) -> Result<OAuthState> {
    Ok(OAuthState {
        id: row.try_get("id")?,
        state_token: row.try_get("state_token")?,
        project_id: row.try_get("project_id")?,
        provider: row.try_get("provider")?,
        end_user_id: row.try_get("end_user_id")?,
        redirect_uri: row.try_get("redirect_uri")?,
        scopes: row.try_get("scopes")?,
        pkce_verifier: row.try_get("pkce_verifier")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(
            r"SELECT id, owner_id, environment, name, settings, created_at
              FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Project {
                id: row.try_get("id")?,
                owner_id: row.try_get("owner_id")?,
                environment: environment_from_str(&row.try_get::<String, _>("environment")?)?,
                name: row.try_get("name")?,
                settings: row.try_get("settings")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn get_api_key_by_public_key(&self, public_key: &str) -> Result<Option<ApiKeyPair>> {
        let row = sqlx::query(
            r"SELECT id, project_id, public_key, secret_encrypted, environment, status,
                     last_used_at, created_at
              FROM api_keys WHERE public_key = $1",
        )
        .bind(public_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ApiKeyPair {
                id: row.try_get("id")?,
                project_id: row.try_get("project_id")?,
                public_key: row.try_get("public_key")?,
                secret_encrypted: row.try_get("secret_encrypted")?,
                environment: environment_from_str(&row.try_get::<String, _>("environment")?)?,
                status: key_status_from_str(&row.try_get::<String, _>("status")?)?,
                last_used_at: row.try_get("last_used_at")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn touch_api_key(&self, key_id: Uuid, when: DateTime<Utc>) -> Result<()> {
        sqlx::query(r"UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn api_keys_page(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<ApiKeyPair>> {
        let rows = sqlx::query(
            r"SELECT id, project_id, public_key, secret_encrypted, environment, status,
                     last_used_at, created_at
              FROM api_keys
              WHERE ($1::uuid IS NULL OR id > $1)
              ORDER BY id
              LIMIT $2",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ApiKeyPair {
                    id: row.try_get("id")?,
                    project_id: row.try_get("project_id")?,
                    public_key: row.try_get("public_key")?,
                    secret_encrypted: row.try_get("secret_encrypted")?,
                    environment: environment_from_str(&row.try_get::<String, _>("environment")?)?,
                    status: key_status_from_str(&row.try_get::<String, _>("status")?)?,
                    last_used_at: row.try_get("last_used_at")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn update_api_key_secret(&self, key_id: Uuid, secret_encrypted: &str) -> Result<()> {
        sqlx::query(r"UPDATE api_keys SET secret_encrypted = $2 WHERE id = $1")
            .bind(key_id)
            .bind(secret_encrypted)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfigRecord>> {
        let row = sqlx::query(
            r"SELECT name, auth_url, token_url, permitted_scopes, default_scopes,
                     client_id, client_secret_encrypted, enabled
              FROM provider_configs WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProviderConfigRecord {
                name: row.try_get("name")?,
                auth_url: row.try_get("auth_url")?,
                token_url: row.try_get("token_url")?,
                permitted_scopes: row.try_get("permitted_scopes")?,
                default_scopes: row.try_get("default_scopes")?,
                client_id: row.try_get("client_id")?,
                client_secret_encrypted: row.try_get("client_secret_encrypted")?,
                enabled: row.try_get("enabled")?,
            })
        })
        .transpose()
    }

    async fn upsert_provider_config(&self, config: &ProviderConfigRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO provider_configs
                (name, auth_url, token_url, permitted_scopes, default_scopes,
                 client_id, client_secret_encrypted, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE SET
                auth_url = EXCLUDED.auth_url,
                token_url = EXCLUDED.token_url,
                permitted_scopes = EXCLUDED.permitted_scopes,
                default_scopes = EXCLUDED.default_scopes,
                client_id = EXCLUDED.client_id,
                client_secret_encrypted = EXCLUDED.client_secret_encrypted,
                enabled = EXCLUDED.enabled
            ",
        )
        .bind(&config.name)
        .bind(&config.auth_url)
        .bind(&config.token_url)
        .bind(&config.permitted_scopes)
        .bind(&config.default_scopes)
        .bind(&config.client_id)
        .bind(&config.client_secret_encrypted)
        .bind(config.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_end_user(&self, project_id: Uuid, external_id: &str) -> Result<EndUser> {
        let row = sqlx::query(
            r"
            INSERT INTO end_users (id, project_id, external_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id, external_id) DO UPDATE SET external_id = EXCLUDED.external_id
            RETURNING id, project_id, external_id, email, display_name, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(EndUser {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            external_id: row.try_get("external_id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn get_end_user(&self, id: Uuid) -> Result<Option<EndUser>> {
        let row = sqlx::query(
            r"SELECT id, project_id, external_id, email, display_name, created_at
              FROM end_users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(EndUser {
                id: row.try_get("id")?,
                project_id: row.try_get("project_id")?,
                external_id: row.try_get("external_id")?,
                email: row.try_get("email")?,
                display_name: row.try_get("display_name")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO oauth_states
                (id, state_token, project_id, provider, end_user_id, redirect_uri,
                 scopes, pkce_verifier, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(state.id)
        .bind(&state.state_token)
        .bind(state.project_id)
        .bind(&state.provider)
        .bind(state.end_user_id)
        .bind(&state.redirect_uri)
        .bind(&state.scopes)
        .bind(&state.pkce_verifier)
        .bind(state.expires_at)
        .bind(state.used_at)
        .bind(state.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_oauth_state(&self, state_token: &str) -> Result<Option<OAuthState>> {
        let row = sqlx::query(
            r"SELECT id, state_token, project_id, provider, end_user_id, redirect_uri,
                     scopes, pkce_verifier, expires_at, used_at, created_at
              FROM oauth_states WHERE state_token = $1",
        )
        .bind(state_token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_state).transpose()
    }

    async fn consume_oauth_state(&self, state_token: &str, now: DateTime<Utc>) -> Result<bool> {
        // The authoritative single-use guard: conditional update, exactly one
        // row affected wins the race.
        let result = sqlx::query(
            r"UPDATE oauth_states SET used_at = $2
              WHERE state_token = $1 AND used_at IS NULL AND expires_at > $2",
        )
        .bind(state_token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sweep_oauth_states(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"DELETE FROM oauth_states WHERE used_at IS NULL AND created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_connection(&self, connection: &Connection) -> Result<Connection> {
        let row = sqlx::query(
            r"
            INSERT INTO connections
                (id, project_id, provider, end_user_id, provider_user_id, provider_email,
                 access_token_encrypted, refresh_token_encrypted, token_type, expires_at,
                 scopes, status, error_message, last_used_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (project_id, provider, end_user_id) DO UPDATE SET
                provider_user_id = EXCLUDED.provider_user_id,
                provider_email = EXCLUDED.provider_email,
                access_token_encrypted = EXCLUDED.access_token_encrypted,
                refresh_token_encrypted = EXCLUDED.refresh_token_encrypted,
                token_type = EXCLUDED.token_type,
                expires_at = EXCLUDED.expires_at,
                scopes = EXCLUDED.scopes,
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                updated_at = CURRENT_TIMESTAMP
            RETURNING id, project_id, provider, end_user_id, provider_user_id, provider_email,
                      access_token_encrypted, refresh_token_encrypted, token_type, expires_at,
                      scopes, status, error_message, last_used_at, created_at, updated_at
            ",
        )
        .bind(&connection.id)
        .bind(connection.project_id)
        .bind(&connection.provider)
        .bind(connection.end_user_id)
        .bind(&connection.provider_user_id)
        .bind(&connection.provider_email)
        .bind(&connection.access_token_encrypted)
        .bind(&connection.refresh_token_encrypted)
        .bind(&connection.token_type)
        .bind(connection.expires_at)
        .bind(&connection.scopes)
        .bind(connection_status_to_str(connection.status))
        .bind(&connection.error_message)
        .bind(connection.last_used_at)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .fetch_one(&self.pool)
        .await?;

        decode_connection(&row)
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query(
            r"SELECT id, project_id, provider, end_user_id, provider_user_id, provider_email,
                     access_token_encrypted, refresh_token_encrypted, token_type, expires_at,
                     scopes, status, error_message, last_used_at, created_at, updated_at
              FROM connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_connection).transpose()
    }

    async fn list_connections(
        &self,
        project_id: Uuid,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Connection>> {
        let status = filter.status.map(connection_status_to_str);
        let rows = sqlx::query(
            r"
            SELECT c.id, c.project_id, c.provider, c.end_user_id, c.provider_user_id,
                   c.provider_email, c.access_token_encrypted, c.refresh_token_encrypted,
                   c.token_type, c.expires_at, c.scopes, c.status, c.error_message,
                   c.last_used_at, c.created_at, c.updated_at
            FROM connections c
            JOIN end_users u ON u.id = c.end_user_id
            WHERE c.project_id = $1
              AND ($2::text IS NULL OR u.external_id = $2)
              AND ($3::text IS NULL OR c.provider = $3)
              AND ($4::text IS NULL OR c.status = $4)
            ORDER BY c.created_at DESC
            ",
        )
        .bind(project_id)
        .bind(&filter.external_user_id)
        .bind(&filter.provider)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_connection).collect()
    }

    async fn update_connection_tokens(&self, id: &str, update: &TokenUpdate) -> Result<()> {
        sqlx::query(
            r"
            UPDATE connections SET
                access_token_encrypted = $2,
                refresh_token_encrypted = COALESCE($3, refresh_token_encrypted),
                expires_at = $4,
                status = 'active',
                error_message = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(&update.access_token_encrypted)
        .bind(&update.refresh_token_encrypted)
        .bind(update.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE connections SET status = $2, error_message = $3,
                     updated_at = CURRENT_TIMESTAMP
              WHERE id = $1",
        )
        .bind(id)
        .bind(connection_status_to_str(status))
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_connection(&self, id: &str, when: DateTime<Utc>) -> Result<()> {
        sqlx::query(r"UPDATE connections SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn connections_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            r"SELECT id, project_id, provider, end_user_id, provider_user_id, provider_email,
                     access_token_encrypted, refresh_token_encrypted, token_type, expires_at,
                     scopes, status, error_message, last_used_at, created_at, updated_at
              FROM connections
              WHERE ($1::text IS NULL OR id > $1)
              ORDER BY id
              LIMIT $2",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_connection).collect()
    }

    async fn update_connection_ciphertexts(
        &self,
        id: &str,
        access_token_encrypted: &str,
        refresh_token_encrypted: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE connections SET
                  access_token_encrypted = $2,
                  refresh_token_encrypted = COALESCE($3, refresh_token_encrypted)
              WHERE id = $1",
        )
        .bind(id)
        .bind(access_token_encrypted)
        .bind(refresh_token_encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_advisory_lock(&self, key: &str) -> Result<bool> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring connection for advisory lock")?;
        let row = sqlx::query(r"SELECT pg_try_advisory_lock(hashtextextended($1, 0)) AS locked")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        let locked: bool = row.try_get("locked")?;

        if locked {
            // the lock lives on this session; park the connection so the
            // unlock runs on the same one
            self.held_locks.lock().await.insert(key.to_owned(), conn);
        }
        Ok(locked)
    }

    async fn advisory_unlock(&self, key: &str) -> Result<()> {
        let held = self.held_locks.lock().await.remove(key);
        let Some(mut conn) = held else {
            return Err(anyhow!("advisory lock {key} is not held by this process"));
        };
        sqlx::query(r"SELECT pg_advisory_unlock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        // dropping the connection returns it to the pool
        Ok(())
    }

    async fn insert_webhook_subscription(&self, subscription: &WebhookSubscription) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhook_subscriptions
                (id, project_id, url, secret_encrypted, events, enabled,
                 last_triggered_at, last_status_code, consecutive_failures, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(subscription.id)
        .bind(subscription.project_id)
        .bind(&subscription.url)
        .bind(&subscription.secret_encrypted)
        .bind(&subscription.events)
        .bind(subscription.enabled)
        .bind(subscription.last_triggered_at)
        .bind(subscription.last_status_code.map(i32::from))
        .bind(subscription.consecutive_failures as i32)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        let row = sqlx::query(
            r"SELECT id, project_id, url, secret_encrypted, events, enabled,
                     last_triggered_at, last_status_code, consecutive_failures, created_at
              FROM webhook_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_subscription).transpose()
    }

    async fn list_webhook_subscriptions(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query(
            r"SELECT id, project_id, url, secret_encrypted, events, enabled,
                     last_triggered_at, last_status_code, consecutive_failures, created_at
              FROM webhook_subscriptions WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_subscription).collect()
    }

    async fn delete_webhook_subscription(&self, project_id: Uuid, id: Uuid) -> Result<bool> {
        let result =
            sqlx::query(r"DELETE FROM webhook_subscriptions WHERE id = $1 AND project_id = $2")
                .bind(id)
                .bind(project_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn subscriptions_for_event(
        &self,
        project_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query(
            r"SELECT id, project_id, url, secret_encrypted, events, enabled,
                     last_triggered_at, last_status_code, consecutive_failures, created_at
              FROM webhook_subscriptions
              WHERE project_id = $1 AND enabled AND $2 = ANY(events)",
        )
        .bind(project_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_subscription).collect()
    }

    async fn insert_webhook_event(&self, event: &WebhookEventRow) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhook_events
                (id, subscription_id, event_type, payload, status, attempts,
                 next_attempt_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&event.id)
        .bind(event.subscription_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event_status_to_str(event.status))
        .bind(event.attempts as i32)
        .bind(event.next_attempt_at)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_event(&self, id: &str) -> Result<Option<WebhookEventRow>> {
        let row = sqlx::query(
            r"SELECT id, subscription_id, event_type, payload, status, attempts,
                     next_attempt_at, created_at
              FROM webhook_events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_event).transpose()
    }

    async fn update_webhook_event(
        &self,
        id: &str,
        status: WebhookEventStatus,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE webhook_events SET status = $2, attempts = $3, next_attempt_at = $4
              WHERE id = $1",
        )
        .bind(id)
        .bind(event_status_to_str(status))
        .bind(attempts as i32)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_webhook_events(
        &self,
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEventRow>> {
        let rows = sqlx::query(
            r"SELECT id, subscription_id, event_type, payload, status, attempts,
                     next_attempt_at, created_at
              FROM webhook_events
              WHERE status = 'pending' AND next_attempt_at <= $1
              ORDER BY next_attempt_at
              LIMIT $2",
        )
        .bind(due_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_event).collect()
    }

    async fn record_webhook_outcome(
        &self,
        subscription_id: Uuid,
        status_code: Option<u16>,
        success: bool,
        disable: bool,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE webhook_subscriptions SET
                last_triggered_at = CURRENT_TIMESTAMP,
                last_status_code = $2,
                consecutive_failures = CASE WHEN $3 THEN 0 ELSE consecutive_failures + 1 END,
                enabled = CASE WHEN $4 THEN false ELSE enabled END
            WHERE id = $1
            ",
        )
        .bind(subscription_id)
        .bind(status_code.map(i32::from))
        .bind(success)
        .bind(disable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_api_log(&self, entry: &ApiLogEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO api_logs
                (id, project_id, provider, connection_id, endpoint, method,
                 status_code, latency_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(entry.id)
        .bind(entry.project_id)
        .bind(&entry.provider)
        .bind(&entry.connection_id)
        .bind(&entry.endpoint)
        .bind(&entry.method)
        .bind(i32::from(entry.status_code))
        .bind(entry.latency_ms as i64)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
