// ABOUTME: PKCE verifier and challenge generation for the authorization flow
// ABOUTME: S256 challenge binds an authorization code to its initiator
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Proof Key for Code Exchange (RFC 7636, S256 only).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Verifier/challenge pair for one authorization
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Secret held on the state row until the code exchange
    pub verifier: String,
    /// base64url(SHA-256(verifier)), sent in the authorization URL
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh pair
    #[must_use]
    pub fn generate() -> Self {
        let verifier = crate::crypto::random_token(32);
        let challenge = Self::challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Compute the S256 challenge for a verifier
    #[must_use]
    pub fn challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_s256_of_verifier() {
        // RFC 7636 appendix B reference vector
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            PkcePair::challenge_for(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn generated_pairs_are_distinct() {
        let a = PkcePair::generate();
        let b = PkcePair::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_eq!(a.challenge, PkcePair::challenge_for(&a.verifier));
        // 32 bytes of entropy, base64url → 43 chars
        assert!(a.verifier.len() >= 43);
    }
}
