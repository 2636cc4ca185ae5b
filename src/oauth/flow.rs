//! The authorization flow state machine.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::pkce;
use super::provider::{Provider, ProviderConfig};
use crate::audit::{EventKind, SecurityLog, Severity};
use crate::credentials::{Credential, CredentialStore};
use crate::crypto::SecretBox;
use crate::error::{AuthError, Result};
use crate::kv::KvStore;

const PENDING_PREFIX: &str = "pkce:";

/// Fallback access-token lifetime when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Orchestrates initiate / callback / revoke for one OAuth provider.
///
/// At most one pending authorization is live per user: a repeated
/// initiate overwrites the previous verifier, so only the latest
/// authorization URL is redeemable.
pub struct AuthFlow {
    config: ProviderConfig,
    provider: Arc<dyn Provider>,
    store: Arc<CredentialStore>,
    secrets: Arc<SecretBox>,
    pending: Arc<dyn KvStore>,
    audit: Arc<SecurityLog>,
    pending_ttl: Duration,
}

impl AuthFlow {
    pub fn new(
        config: ProviderConfig,
        provider: Arc<dyn Provider>,
        store: Arc<CredentialStore>,
        secrets: Arc<SecretBox>,
        pending: Arc<dyn KvStore>,
        audit: Arc<SecurityLog>,
        pending_ttl_minutes: i64,
    ) -> Self {
        Self {
            config,
            provider,
            store,
            secrets,
            pending,
            audit,
            pending_ttl: Duration::minutes(pending_ttl_minutes),
        }
    }

    /// Starts an authorization: binds a fresh PKCE verifier to the user
    /// and returns the provider authorization URL to redirect them to.
    ///
    /// Does not contact the provider.
    pub fn initiate(&self, user_id: &str) -> String {
        let pair = pkce::generate();
        let anti_forgery = Uuid::new_v4().to_string();
        let state = format!("{}:{}", user_id, anti_forgery);

        self.pending
            .put(&pending_key(user_id), &pair.verifier, self.pending_ttl);

        info!(user = %user_id, "authorization initiated");
        self.config.build_auth_url(&pair.challenge, &state)
    }

    /// Completes an authorization from the provider callback.
    ///
    /// `user_id` is the subject from the caller's context; the first
    /// segment of `state` must match it. The pending verifier is consumed
    /// exactly once: a replayed callback fails with `SessionExpired`.
    pub async fn handle_callback(
        &self,
        user_id: &str,
        code: &str,
        state: &str,
    ) -> Result<Credential> {
        let state_user = state.split(':').next().unwrap_or_default();
        if state_user.is_empty() || state_user != user_id {
            self.audit.record(
                EventKind::StateMismatch,
                user_id,
                "callback state bound to a different user",
                Severity::High,
                None,
            );
            return Err(AuthError::InvalidState);
        }

        let Some(verifier) = self.pending.take(&pending_key(user_id)) else {
            // Covers expiry and replay: the entry is consumed exactly once
            self.audit.record(
                EventKind::SessionReplay,
                user_id,
                "no pending authorization for callback",
                Severity::Medium,
                None,
            );
            return Err(AuthError::SessionExpired);
        };

        let tokens = self.provider.exchange_code(code, &verifier).await?;
        let account_id = self.provider.fetch_identity(&tokens.access_token).await?;

        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            AuthError::TransientProvider("provider response missing refresh token".to_string())
        })?;

        let refresh_enc = self.secrets.encrypt(&refresh_token)?;
        let access_enc = self.secrets.encrypt(&tokens.access_token)?;
        let expires_at = tokens
            .expires_at
            .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

        let credential =
            self.store
                .upsert(user_id, &account_id, &refresh_enc, &access_enc, expires_at)?;

        info!(user = %user_id, account = %account_id, "authorization completed");
        Ok(credential)
    }

    /// Revokes a user's credential.
    ///
    /// Provider-side revocation is best effort per token: a failure is
    /// logged and the remaining work continues, so the local credential
    /// always ends up deactivated.
    pub async fn revoke(&self, user_id: &str) -> Result<()> {
        let credential = self
            .store
            .get(user_id)?
            .ok_or(AuthError::CredentialNotFound)?;

        for (label, ciphertext) in [
            ("access", &credential.access_token_enc),
            ("refresh", &credential.refresh_token_enc),
        ] {
            match self.secrets.decrypt(ciphertext) {
                Ok(token) => {
                    if let Err(e) = self.provider.revoke(&token).await {
                        warn!(user = %user_id, token = label, error = %e, "provider-side revocation failed, continuing");
                    }
                }
                Err(e) => {
                    self.audit.record(
                        EventKind::CorruptedSecret,
                        user_id,
                        &format!("stored {} token failed to decrypt during revocation", label),
                        Severity::Critical,
                        None,
                    );
                    warn!(user = %user_id, token = label, error = %e, "could not decrypt token for revocation, continuing");
                }
            }
        }

        self.store.deactivate(user_id)?;
        self.audit.record(
            EventKind::CredentialRevoked,
            user_id,
            "credential deactivated",
            Severity::Medium,
            None,
        );

        info!(user = %user_id, "credential revoked");
        Ok(())
    }
}

fn pending_key(user_id: &str) -> String {
    format!("{}{}", PENDING_PREFIX, user_id)
}
