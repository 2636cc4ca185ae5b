//! Error taxonomy for the credential subsystem.
//!
//! Callers branch on these variants: state-binding and cryptographic
//! failures are hard stops, `TransientProvider` is retryable, and
//! `ReauthorizationRequired` means the user must restart the login flow.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The `state` parameter does not belong to the requesting user.
    /// Never retried; always paired with a security event.
    #[error("authorization state does not match the requesting user")]
    InvalidState,

    /// No pending authorization for this user: it expired, was never
    /// started, or was already consumed (replay).
    #[error("authorization session expired, log in again")]
    SessionExpired,

    /// The provider rejected the authorization code.
    #[error("the authorization code was rejected, log in again")]
    InvalidGrant,

    /// The redirect URI does not match the one registered with the provider.
    #[error("redirect URI mismatch, check the application configuration")]
    RedirectMismatch,

    /// The provider rejected the client id/secret.
    #[error("OAuth client configuration was rejected by the provider")]
    InvalidClientConfig,

    /// The user declined consent on the provider's authorization page.
    #[error("authorization was declined")]
    AccessDenied,

    /// The stored refresh token is no longer valid; the user must
    /// restart the authorization flow.
    #[error("stored authorization is no longer valid, log in again")]
    ReauthorizationRequired,

    /// Network failure, timeout, or provider 5xx. Safe to retry with backoff.
    #[error("provider temporarily unavailable: {0}")]
    TransientProvider(String),

    /// Stored ciphertext is malformed, truncated, or tampered with.
    /// Never retried; always paired with a security event.
    #[error("stored secret is corrupted")]
    CorruptedCiphertext,

    /// Too many requests for this action within the current window.
    #[error("rate limit exceeded, try again later")]
    RateLimitExceeded { reset_at: DateTime<Utc> },

    /// CSRF token missing, expired, or bound to a different user.
    #[error("request could not be verified, please retry from the start")]
    CsrfValidationFailed,

    /// Account locked after repeated failed login attempts.
    #[error("account temporarily locked, try again later")]
    AccountLocked { until: DateTime<Utc> },

    /// No active credential on file for this user.
    #[error("no linked account, log in first")]
    CredentialNotFound,

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::TransientProvider(_))
    }
}
