// ABOUTME: Online master-key rotation for stored secrets
// ABOUTME: Re-encrypts rows in batches from retired key versions to the current one
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Key-rotation migration.
//!
//! Encrypt always stamps the current version; this migration walks the
//! secret-bearing tables and re-seals any value carrying an older version
//! byte. Readers tolerate both versions throughout, so the migration can run
//! while the service serves traffic.

use super::SecretCipher;
use crate::constants::limits;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Counters reported after a rotation pass
#[derive(Debug, Default, Clone, Copy)]
pub struct RotationReport {
    /// Connection rows re-encrypted
    pub connections: u64,
    /// Api-key rows re-encrypted
    pub api_keys: u64,
    /// Rows skipped because they already carry the current version
    pub already_current: u64,
}

/// Re-encrypt all stored secrets under the current key version.
///
/// # Errors
///
/// Returns an error on store failures; individual rows that fail to decrypt
/// are logged and skipped so one corrupt row cannot wedge the migration.
pub async fn rotate_stored_secrets(
    store: &Arc<dyn Store>,
    cipher: &SecretCipher,
) -> Result<RotationReport> {
    let mut report = RotationReport::default();
    let current = cipher.current_version();

    // connections: access + refresh ciphertexts
    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .connections_page(cursor.as_deref(), limits::KEY_ROTATION_BATCH)
            .await?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.id.clone());

        for conn in &page {
            match SecretCipher::stored_version(&conn.access_token_encrypted) {
                Ok(version) if version == current => {
                    report.already_current += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(connection_id = %conn.id, error = %e, "unreadable ciphertext, skipping");
                    continue;
                }
            }

            let resealed_access = match cipher
                .decrypt_str(&conn.access_token_encrypted)
                .and_then(|plain| cipher.encrypt_str(&plain))
            {
                Ok(value) => value,
                Err(e) => {
                    warn!(connection_id = %conn.id, error = %e, "access token reseal failed, skipping");
                    continue;
                }
            };

            let resealed_refresh = match &conn.refresh_token_encrypted {
                Some(stored) => match cipher
                    .decrypt_str(stored)
                    .and_then(|plain| cipher.encrypt_str(&plain))
                {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(connection_id = %conn.id, error = %e, "refresh token reseal failed, skipping");
                        continue;
                    }
                },
                None => None,
            };

            store
                .update_connection_ciphertexts(
                    &conn.id,
                    &resealed_access,
                    resealed_refresh.as_deref(),
                )
                .await?;
            report.connections += 1;
        }
    }

    // api keys: encrypted signing secrets
    let mut cursor = None;
    loop {
        let page = store
            .api_keys_page(cursor, limits::KEY_ROTATION_BATCH)
            .await?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.id);

        for key in &page {
            match SecretCipher::stored_version(&key.secret_encrypted) {
                Ok(version) if version == current => {
                    report.already_current += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(api_key_id = %key.id, error = %e, "unreadable ciphertext, skipping");
                    continue;
                }
            }

            match cipher
                .decrypt_str(&key.secret_encrypted)
                .and_then(|plain| cipher.encrypt_str(&plain))
            {
                Ok(resealed) => {
                    store.update_api_key_secret(key.id, &resealed).await?;
                    report.api_keys += 1;
                }
                Err(e) => {
                    warn!(api_key_id = %key.id, error = %e, "secret reseal failed, skipping");
                }
            }
        }
    }

    info!(
        connections = report.connections,
        api_keys = report.api_keys,
        already_current = report.already_current,
        "key rotation pass complete"
    );
    Ok(report)
}
