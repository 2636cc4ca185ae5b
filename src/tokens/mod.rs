//! Credential lifecycle: the sole path to a usable access token.
//!
//! Everything else in the bot asks [`TokenManager::live_access_token`] and
//! never touches the encrypted columns. Expired tokens are refreshed
//! transparently; concurrent refreshes for one user are collapsed into a
//! single provider call by a per-user mutex.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::{EventKind, SecurityLog, Severity};
use crate::credentials::CredentialStore;
use crate::crypto::SecretBox;
use crate::error::{AuthError, Result};
use crate::oauth::Provider;

/// Refresh this long before the stored expiry to absorb clock skew and
/// in-flight request latency.
const EXPIRY_LEEWAY_SECS: i64 = 60;

/// Fallback lifetime when the provider omits `expires_in` on refresh.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

pub struct TokenManager {
    store: Arc<CredentialStore>,
    secrets: Arc<SecretBox>,
    provider: Arc<dyn Provider>,
    audit: Arc<SecurityLog>,
    /// Single-flight guard per user: two concurrent refreshes would both
    /// hit the provider's refresh endpoint otherwise.
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<CredentialStore>,
        secrets: Arc<SecretBox>,
        provider: Arc<dyn Provider>,
        audit: Arc<SecurityLog>,
    ) -> Self {
        Self {
            store,
            secrets,
            provider,
            audit,
            refresh_locks: DashMap::new(),
        }
    }

    /// Returns a currently-valid access token for the user, refreshing it
    /// at the provider first if the stored one has expired.
    ///
    /// # Errors
    /// * `CredentialNotFound` - user never authorized, or was revoked
    /// * `ReauthorizationRequired` - the refresh token is dead
    /// * `TransientProvider` - network/5xx during refresh, retryable
    pub async fn live_access_token(&self, user_id: &str) -> Result<String> {
        let credential = self
            .store
            .get(user_id)?
            .filter(|c| c.active)
            .ok_or(AuthError::CredentialNotFound)?;

        let leeway = Duration::seconds(EXPIRY_LEEWAY_SECS);
        if credential.access_token_fresh(Utc::now() + leeway) {
            return self.decrypt_stored(user_id, &credential.access_token_enc, "access");
        }

        let lock = self
            .refresh_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-read: another task may have completed the refresh while we
        // waited on the lock
        let credential = self
            .store
            .get(user_id)?
            .filter(|c| c.active)
            .ok_or(AuthError::CredentialNotFound)?;
        if credential.access_token_fresh(Utc::now() + leeway) {
            return self.decrypt_stored(user_id, &credential.access_token_enc, "access");
        }

        debug!(user = %user_id, "access token expired, refreshing");

        let refresh_token = self.decrypt_stored(user_id, &credential.refresh_token_enc, "refresh")?;
        let tokens = self.provider.refresh(&refresh_token).await?;

        let access_enc = self.secrets.encrypt(&tokens.access_token)?;
        let expires_at = tokens
            .expires_at
            .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
        self.store
            .update_access_token(user_id, &access_enc, expires_at)?;

        self.audit.record(
            EventKind::TokenRefreshed,
            user_id,
            "access token refreshed",
            Severity::Low,
            None,
        );
        info!(user = %user_id, "access token refreshed");

        Ok(tokens.access_token)
    }

    /// Decrypts stored credential material, recording a critical security
    /// event when the ciphertext turns out corrupted: stored tokens only go
    /// bad through tampering, data loss, or a master-key change, all of
    /// which need operator attention.
    fn decrypt_stored(&self, user_id: &str, ciphertext: &str, which: &str) -> Result<String> {
        match self.secrets.decrypt(ciphertext) {
            Err(AuthError::CorruptedCiphertext) => {
                self.audit.record(
                    EventKind::CorruptedSecret,
                    user_id,
                    &format!("stored {} token failed to decrypt", which),
                    Severity::Critical,
                    None,
                );
                Err(AuthError::CorruptedCiphertext)
            }
            other => other,
        }
    }

    /// Liveness probe: a cheap authenticated provider call with the live
    /// token. Returns false on any failure, never errors — callers that
    /// need the failure cause should use [`Self::live_access_token`].
    pub async fn verify(&self, user_id: &str) -> bool {
        let Ok(token) = self.live_access_token(user_id).await else {
            return false;
        };
        self.provider.fetch_identity(&token).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::TokenSet;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubProvider {
        refresh_calls: AtomicUsize,
        refresh_error: Mutex<Option<AuthError>>,
        identity_ok: bool,
    }

    impl StubProvider {
        fn ok() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_error: Mutex::new(None),
                identity_ok: true,
            }
        }

        fn dead_grant() -> Self {
            let stub = Self::ok();
            *stub.refresh_error.lock().unwrap() = Some(AuthError::ReauthorizationRequired);
            stub
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn exchange_code(&self, _code: &str, _verifier: &str) -> Result<TokenSet> {
            unimplemented!("not exercised by lifecycle tests")
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet> {
            if let Some(err) = self.refresh_error.lock().unwrap().take() {
                return Err(err);
            }
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenSet {
                access_token: "refreshed-access".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
        }

        async fn revoke(&self, _token: &str) -> Result<()> {
            Ok(())
        }

        async fn fetch_identity(&self, _access_token: &str) -> Result<String> {
            if self.identity_ok {
                Ok("alice@example.com".to_string())
            } else {
                Err(AuthError::TransientProvider("down".to_string()))
            }
        }
    }

    struct Fixture {
        manager: TokenManager,
        store: Arc<CredentialStore>,
        secrets: Arc<SecretBox>,
        provider: Arc<StubProvider>,
        audit: Arc<SecurityLog>,
    }

    fn fixture(provider: StubProvider) -> Fixture {
        let store = Arc::new(CredentialStore::open(":memory:").unwrap());
        let secrets = Arc::new(SecretBox::new("lifecycle-test-master").unwrap());
        let provider = Arc::new(provider);
        let audit = Arc::new(SecurityLog::new(50, 24));
        let manager = TokenManager::new(
            store.clone(),
            secrets.clone(),
            provider.clone(),
            audit.clone(),
        );
        Fixture {
            manager,
            store,
            secrets,
            provider,
            audit,
        }
    }

    fn seed_credential(f: &Fixture, user: &str, expires_in_secs: i64) {
        let refresh = f.secrets.encrypt("the-refresh-token").unwrap();
        let access = f.secrets.encrypt("the-access-token").unwrap();
        f.store
            .upsert(
                user,
                "alice@example.com",
                &refresh,
                &access,
                Utc::now() + Duration::seconds(expires_in_secs),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let f = fixture(StubProvider::ok());
        seed_credential(&f, "U1", 3600);

        let token = f.manager.live_access_token("U1").await.unwrap();
        assert_eq!(token, "the-access-token");
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_triggers_exactly_one_refresh() {
        let f = fixture(StubProvider::ok());
        seed_credential(&f, "U1", -10);

        let token = f.manager.live_access_token("U1").await.unwrap();
        assert_eq!(token, "refreshed-access");
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 1);

        // The refreshed token was persisted encrypted with a new expiry
        let cred = f.store.get("U1").unwrap().unwrap();
        assert_eq!(
            f.secrets.decrypt(&cred.access_token_enc).unwrap(),
            "refreshed-access"
        );
        assert!(cred.expires_at > Utc::now());

        // A second call now finds a fresh token — still one refresh total
        let token = f.manager.live_access_token("U1").await.unwrap();
        assert_eq!(token, "refreshed-access");
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_refresh_token_is_reauthorization_required() {
        let f = fixture(StubProvider::dead_grant());
        seed_credential(&f, "U1", -10);

        let err = f.manager.live_access_token("U1").await.unwrap_err();
        assert!(matches!(err, AuthError::ReauthorizationRequired));
    }

    #[tokio::test]
    async fn test_missing_or_revoked_credential() {
        let f = fixture(StubProvider::ok());

        let err = f.manager.live_access_token("U1").await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialNotFound));

        seed_credential(&f, "U2", 3600);
        f.store.deactivate("U2").unwrap();
        let err = f.manager.live_access_token("U2").await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialNotFound));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_collapse_to_one_call() {
        let f = fixture(StubProvider::ok());
        seed_credential(&f, "U1", -10);

        let manager = Arc::new(f.manager);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.live_access_token("U1").await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "refreshed-access");
        }

        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupted_refresh_token_records_critical_event() {
        let f = fixture(StubProvider::ok());
        let access = f.secrets.encrypt("the-access-token").unwrap();
        f.store
            .upsert(
                "U1",
                "alice@example.com",
                "garbage-not-ciphertext",
                &access,
                Utc::now() - Duration::seconds(10),
            )
            .unwrap();

        let err = f.manager.live_access_token("U1").await.unwrap_err();
        assert!(matches!(err, AuthError::CorruptedCiphertext));

        let stats = f.audit.stats(5);
        assert_eq!(stats.by_kind.get("corruptedsecret"), Some(&1));
        assert_eq!(stats.by_severity.get("critical"), Some(&1));
        // No provider call was made with a token we could not trust
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_corrupted_access_token_records_critical_event() {
        let f = fixture(StubProvider::ok());
        let refresh = f.secrets.encrypt("the-refresh-token").unwrap();
        f.store
            .upsert(
                "U1",
                "alice@example.com",
                &refresh,
                "garbage-not-ciphertext",
                Utc::now() + Duration::hours(1),
            )
            .unwrap();

        let err = f.manager.live_access_token("U1").await.unwrap_err();
        assert!(matches!(err, AuthError::CorruptedCiphertext));
        assert_eq!(f.audit.stats(5).by_kind.get("corruptedsecret"), Some(&1));
    }

    #[tokio::test]
    async fn test_verify_true_and_false_paths() {
        let f = fixture(StubProvider::ok());
        seed_credential(&f, "U1", 3600);
        assert!(f.manager.verify("U1").await);

        // No credential: false, not an error
        assert!(!f.manager.verify("nobody").await);
    }
}
