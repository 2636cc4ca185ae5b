//! Delegated-access credential records and their encrypted store.
//!
//! One credential per user, holding the provider account identity and the
//! encrypted OAuth token pair. The refresh token is written only on full
//! (re-)authorization; the access token and its expiry are always replaced
//! together. Revocation clears the active flag but never deletes the row,
//! so the record remains available for audit.

use chrono::{DateTime, Utc};

mod store;

pub use store::CredentialStore;

/// A user's delegated-access credential.
///
/// The token fields hold ciphertext produced by [`crate::crypto::SecretBox`]
/// and are crate-private: the lifecycle manager in [`crate::tokens`] is the
/// only sanctioned path to a usable access token.
#[derive(Clone, Debug)]
pub struct Credential {
    /// Opaque stable user identifier (chat-platform user id).
    pub user_id: String,

    /// Provider account identity (e.g. email address).
    pub account_id: String,

    /// Encrypted refresh token. Immutable except on re-authorization.
    pub(crate) refresh_token_enc: String,

    /// Encrypted access token. Replaced together with `expires_at`.
    pub(crate) access_token_enc: String,

    /// When the access token expires (UTC).
    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Cleared on revocation; the row is retained.
    pub active: bool,
}

impl Credential {
    /// Whether the stored access token is still within its validity window.
    pub fn access_token_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
