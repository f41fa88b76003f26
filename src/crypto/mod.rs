// ABOUTME: Cryptography module for at-rest secret encryption and key rotation
// ABOUTME: Versioned AES-256-GCM sealing with a master key ring
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! At-rest encryption for every secret-valued column.
//!
//! Stored values are `base64(version ‖ iv ‖ tag ‖ ciphertext)` where the
//! one-byte version selects the master key on decrypt. Encrypt always uses
//! the current version, which is what makes online rotation possible.

pub mod cipher;
pub mod rotation;

pub use cipher::{MasterKeyRing, SecretCipher};
pub use rotation::rotate_stored_secrets;

use ring::rand::{SecureRandom, SystemRandom};

/// Generate a fresh random 32-byte key.
///
/// Used for development-mode master keys and by tests.
#[must_use]
pub fn generate_key() -> [u8; 32] {
    let rng = SystemRandom::new();
    let mut key = [0u8; 32];
    // SystemRandom only fails if the OS RNG is unavailable, which is not a
    // recoverable condition for a process that encrypts credentials.
    #[allow(clippy::expect_used)]
    rng.fill(&mut key).expect("OS RNG unavailable");
    key
}

/// Generate a random url-safe token with the given entropy in bytes
#[must_use]
pub fn random_token(entropy_bytes: usize) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; entropy_bytes];
    #[allow(clippy::expect_used)]
    rng.fill(&mut bytes).expect("OS RNG unavailable");
    URL_SAFE_NO_PAD.encode(bytes)
}
