//! Encryption and password hashing for stored secrets.
//!
//! Every `encrypt` call derives a fresh AES-256 key from the process-wide
//! master secret via PBKDF2-HMAC-SHA256 with a random per-call salt, then
//! encrypts with AES-256-GCM under a random nonce. The output is
//! `base64(salt || nonce || ciphertext)`, so the same plaintext never
//! encrypts to the same ciphertext twice.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::anyhow;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AuthError, Result};

/// Size of the derived encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the per-call KDF salt in bytes
const SALT_SIZE: usize = 16;

/// Size of the GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// PBKDF2 iteration count for both key derivation and password hashing
const KDF_ITERATIONS: u32 = 100_000;

/// Minimum acceptable master secret length in bytes
const MIN_MASTER_LEN: usize = 16;

/// Symmetric encryption of secrets keyed by a process-wide master secret.
///
/// # Security
/// - Fresh random salt and nonce per call (never reused)
/// - Slow key derivation (100k PBKDF2 iterations) per record
/// - Authenticated encryption (tampering detected on decrypt)
/// - Master secret lives in memory only, provided at process start
pub struct SecretBox {
    master: Vec<u8>,
}

impl SecretBox {
    /// Creates a secret box from the master secret.
    ///
    /// # Returns
    /// * `Err` - If the master secret is shorter than 16 bytes
    pub fn new(master: &str) -> Result<Self> {
        if master.len() < MIN_MASTER_LEN {
            return Err(AuthError::Internal(anyhow!(
                "master secret must be at least {} bytes, got {}",
                MIN_MASTER_LEN,
                master.len()
            )));
        }
        Ok(Self {
            master: master.as_bytes().to_vec(),
        })
    }

    /// Encrypts plaintext and returns `base64(salt || nonce || ciphertext)`.
    ///
    /// Two calls with identical plaintext yield different outputs because
    /// both the salt and the nonce are drawn fresh each time.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AuthError::Internal(anyhow!("failed to create cipher: {}", e)))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AuthError::Internal(anyhow!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(out))
    }

    /// Decrypts a value produced by [`SecretBox::encrypt`].
    ///
    /// # Returns
    /// * `Err(CorruptedCiphertext)` - On malformed base64, truncated input,
    ///   wrong key, or tampered ciphertext. Never returns garbage.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| AuthError::CorruptedCiphertext)?;

        if bytes.len() <= SALT_SIZE + NONCE_SIZE {
            return Err(AuthError::CorruptedCiphertext);
        }

        let (salt, rest) = bytes.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| AuthError::CorruptedCiphertext)?;

        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AuthError::CorruptedCiphertext)?;

        String::from_utf8(plaintext).map_err(|_| AuthError::CorruptedCiphertext)
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(&self.master, salt, KDF_ITERATIONS, &mut key);
        key
    }
}

/// Hashes a password with a per-password random salt.
///
/// Output format: `iterations$base64(salt)$base64(hash)`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut hash = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, KDF_ITERATIONS, &mut hash);

    format!(
        "{}${}${}",
        KDF_ITERATIONS,
        BASE64.encode(salt),
        BASE64.encode(hash)
    )
}

/// Verifies a password against an encoded hash in constant time.
///
/// Returns false on any parse failure rather than erroring: a malformed
/// stored hash is treated the same as a wrong password.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let mut parts = encoded.splitn(3, '$');
    let (Some(iters), Some(salt), Some(hash)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let Ok(iterations) = iters.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt), BASE64.decode(hash)) else {
        return false;
    };
    if expected.len() != KEY_SIZE {
        return false;
    }

    let mut actual = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut actual);

    actual.ct_eq(expected.as_slice()).into()
}
