//! PKCE verifier/challenge generation (RFC 7636, S256 only).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Entropy of the verifier before encoding, in bytes.
const VERIFIER_BYTES: usize = 32;

/// A verifier and its derived challenge.
pub struct PkcePair {
    /// Random secret, sent only during the token exchange.
    pub verifier: String,
    /// base64url(SHA-256(verifier)), sent up front in the authorization URL.
    pub challenge: String,
}

/// Generates a fresh verifier from the OS CSPRNG and derives its challenge.
pub fn generate() -> PkcePair {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = challenge_for(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

/// Derives the S256 challenge for a verifier.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
