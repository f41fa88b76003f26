// ABOUTME: Versioned AES-256-GCM cipher over the master key ring
// ABOUTME: Seals and opens secret strings with per-encryption random IVs
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! The [`SecretCipher`] seals every secret-valued column.
//!
//! Wire layout of a stored value, before base64:
//!
//! ```text
//! [ version: 1 byte ][ iv: 12 bytes ][ auth tag: 16 bytes ][ ciphertext ]
//! ```
//!
//! Decrypt selects the key by version, so rows encrypted under a retired key
//! keep opening while the rotation migration re-encrypts them.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use zeroize::Zeroize;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Master keys indexed by the one-byte version prefix
pub struct MasterKeyRing {
    current_version: u8,
    keys: HashMap<u8, [u8; 32]>,
}

impl MasterKeyRing {
    /// Ring with a single current key at version 1
    #[must_use]
    pub fn new(current: [u8; 32]) -> Self {
        Self::with_retired(current, HashMap::new())
    }

    /// Ring with a current key and retired predecessors.
    ///
    /// The current key is assigned the next version after the highest retired
    /// one, so freshly encrypted values never collide with a retired version.
    #[must_use]
    pub fn with_retired(current: [u8; 32], retired: HashMap<u8, [u8; 32]>) -> Self {
        let current_version = retired.keys().max().map_or(1, |v| v.wrapping_add(1));
        let mut keys = retired;
        keys.insert(current_version, current);
        Self {
            current_version,
            keys,
        }
    }

    /// Version new encryptions are stamped with
    #[must_use]
    pub const fn current_version(&self) -> u8 {
        self.current_version
    }

    fn key_for(&self, version: u8) -> Result<&[u8; 32]> {
        self.keys
            .get(&version)
            .ok_or_else(|| anyhow!("no master key for version {version}"))
    }
}

impl Drop for MasterKeyRing {
    fn drop(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
    }
}

/// Seals and opens secret values against the key ring
pub struct SecretCipher {
    ring: MasterKeyRing,
    rng: SystemRandom,
}

impl SecretCipher {
    /// Cipher over the given key ring
    #[must_use]
    pub fn new(ring: MasterKeyRing) -> Self {
        Self {
            ring,
            rng: SystemRandom::new(),
        }
    }

    /// Version stamped onto fresh ciphertexts
    #[must_use]
    pub const fn current_version(&self) -> u8 {
        self.ring.current_version()
    }

    /// Encrypt raw bytes under the current key.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS RNG or the AEAD seal fails.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<String> {
        let version = self.ring.current_version();
        let key_bytes = self.ring.key_for(version)?;

        let mut iv = [0u8; IV_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| anyhow!("OS RNG unavailable"))?;
        let nonce = Nonce::assume_unique_for_key(iv);

        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| anyhow!("invalid master key length"))?;
        let key = LessSafeKey::new(unbound);

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("encryption failed"))?;

        // ring appends the tag; stored layout wants it between iv and ciphertext
        let split = in_out.len() - TAG_LEN;
        let (ciphertext, tag) = in_out.split_at(split);

        let mut combined = Vec::with_capacity(1 + IV_LEN + TAG_LEN + ciphertext.len());
        combined.push(version);
        combined.extend_from_slice(&iv);
        combined.extend_from_slice(tag);
        combined.extend_from_slice(ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt a stored value back to raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is malformed, the version is unknown,
    /// or authentication fails.
    pub fn decrypt_bytes(&self, stored: &str) -> Result<Vec<u8>> {
        let combined = BASE64
            .decode(stored)
            .map_err(|e| anyhow!("stored secret is not base64: {e}"))?;
        if combined.len() < 1 + IV_LEN + TAG_LEN {
            return Err(anyhow!("stored secret too short"));
        }

        let version = combined[0];
        let key_bytes = self.ring.key_for(version)?;

        let iv: [u8; IV_LEN] = combined[1..=IV_LEN]
            .try_into()
            .map_err(|_| anyhow!("malformed iv"))?;
        let tag = &combined[1 + IV_LEN..1 + IV_LEN + TAG_LEN];
        let ciphertext = &combined[1 + IV_LEN + TAG_LEN..];

        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| anyhow!("invalid master key length"))?;
        let key = LessSafeKey::new(unbound);

        // ring expects ciphertext ‖ tag
        let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);

        let nonce = Nonce::assume_unique_for_key(iv);
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("decryption failed"))?;

        Ok(plaintext.to_vec())
    }

    /// Encrypt a UTF-8 secret string.
    ///
    /// # Errors
    ///
    /// See [`Self::encrypt_bytes`].
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        self.encrypt_bytes(plaintext.as_bytes())
    }

    /// Decrypt a stored value into a UTF-8 secret string.
    ///
    /// # Errors
    ///
    /// See [`Self::decrypt_bytes`]; additionally fails on invalid UTF-8.
    pub fn decrypt_str(&self, stored: &str) -> Result<String> {
        let bytes = self.decrypt_bytes(stored)?;
        String::from_utf8(bytes).map_err(|e| anyhow!("decrypted secret is not UTF-8: {e}"))
    }

    /// Version byte a stored value was encrypted under.
    ///
    /// # Errors
    ///
    /// Returns an error when the value is not valid base64 or is empty.
    pub fn stored_version(stored: &str) -> Result<u8> {
        let combined = BASE64
            .decode(stored)
            .map_err(|e| anyhow!("stored secret is not base64: {e}"))?;
        combined
            .first()
            .copied()
            .ok_or_else(|| anyhow!("stored secret is empty"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;

    fn cipher() -> SecretCipher {
        SecretCipher::new(MasterKeyRing::new(generate_key()))
    }

    #[test]
    fn round_trip_strings() {
        let c = cipher();
        for plaintext in ["", "a", "ya29.a0AfH6S...", "秘密", &"x".repeat(8192)] {
            let sealed = c.encrypt_str(plaintext).unwrap();
            assert_eq!(c.decrypt_str(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn round_trip_arbitrary_bytes() {
        let c = cipher();
        let payload: Vec<u8> = (0..=255).cycle().take(8192).collect();
        let sealed = c.encrypt_bytes(&payload).unwrap();
        assert_eq!(c.decrypt_bytes(&sealed).unwrap(), payload);
    }

    #[test]
    fn distinct_ciphertexts_for_same_plaintext() {
        let c = cipher();
        let a = c.encrypt_str("token").unwrap();
        let b = c.encrypt_str("token").unwrap();
        // random IV per encryption
        assert_ne!(a, b);
        assert_eq!(c.decrypt_str(&a).unwrap(), c.decrypt_str(&b).unwrap());
    }

    #[test]
    fn tampering_is_detected() {
        let c = cipher();
        let sealed = c.encrypt_str("token").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(c.decrypt_str(&tampered).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = cipher();
        let b = cipher();
        let sealed = a.encrypt_str("token").unwrap();
        assert!(b.decrypt_str(&sealed).is_err());
    }

    #[test]
    fn retired_key_still_decrypts() {
        let old_key = generate_key();
        let old = SecretCipher::new(MasterKeyRing::new(old_key));
        let sealed_old = old.encrypt_str("legacy secret").unwrap();
        assert_eq!(SecretCipher::stored_version(&sealed_old).unwrap(), 1);

        let mut retired = HashMap::new();
        retired.insert(1u8, old_key);
        let rotated = SecretCipher::new(MasterKeyRing::with_retired(generate_key(), retired));

        // old value opens, new values carry the bumped version
        assert_eq!(rotated.decrypt_str(&sealed_old).unwrap(), "legacy secret");
        let sealed_new = rotated.encrypt_str("fresh secret").unwrap();
        assert_eq!(SecretCipher::stored_version(&sealed_new).unwrap(), 2);
        assert_eq!(rotated.decrypt_str(&sealed_new).unwrap(), "fresh secret");
    }
}
