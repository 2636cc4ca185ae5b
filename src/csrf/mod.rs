//! Single-use CSRF tokens scoped to a user.
//!
//! Tokens live in the TTL key-value namespace. Validation deletes the
//! token only on success, so a replay after a successful use shows up as
//! a plain "missing" case: a token can never validate twice.

use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{EventKind, SecurityLog, Severity};
use crate::kv::KvStore;

const KEY_PREFIX: &str = "csrf:";

/// Issues and validates single-use, TTL-bound CSRF tokens.
pub struct CsrfTokens {
    kv: Arc<dyn KvStore>,
    audit: Arc<SecurityLog>,
    ttl: Duration,
}

impl CsrfTokens {
    /// # Arguments
    /// * `ttl_minutes` - Token lifetime (default deployment uses 60)
    pub fn new(kv: Arc<dyn KvStore>, audit: Arc<SecurityLog>, ttl_minutes: i64) -> Self {
        Self {
            kv,
            audit,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Issues a fresh token bound to `user_id`.
    pub fn issue(&self, user_id: &str) -> String {
        let token = Uuid::new_v4().to_string();
        self.kv
            .put(&format!("{}{}", KEY_PREFIX, token), user_id, self.ttl);
        token
    }

    /// Validates and, on success only, consumes a token.
    ///
    /// A token bound to another user is rejected without being consumed,
    /// so a guessing attacker cannot burn the rightful owner's token.
    pub fn validate(&self, token: &str, user_id: &str) -> bool {
        let key = format!("{}{}", KEY_PREFIX, token);

        let Some(owner) = self.kv.get(&key) else {
            // Missing, expired, or already used
            self.audit.record(
                EventKind::CsrfRejected,
                user_id,
                "unknown or expired token",
                Severity::Medium,
                None,
            );
            return false;
        };

        if owner != user_id {
            self.audit.record(
                EventKind::CsrfRejected,
                user_id,
                "token bound to a different user",
                Severity::High,
                None,
            );
            return false;
        }

        self.kv.remove(&key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn service() -> (CsrfTokens, Arc<SecurityLog>) {
        let audit = Arc::new(SecurityLog::new(50, 24));
        let kv = Arc::new(MemoryKv::new());
        (CsrfTokens::new(kv, audit.clone(), 60), audit)
    }

    #[test]
    fn test_issue_then_validate_once() {
        let (csrf, _) = service();

        let token = csrf.issue("U1");
        assert!(csrf.validate(&token, "U1"));

        // Second use is a replay and must fail
        assert!(!csrf.validate(&token, "U1"));
    }

    #[test]
    fn test_wrong_user_does_not_consume() {
        let (csrf, audit) = service();

        let token = csrf.issue("U1");
        assert!(!csrf.validate(&token, "U2"));

        // Token is still redeemable by its rightful owner
        assert!(csrf.validate(&token, "U1"));
        assert_eq!(audit.stats(5).by_kind.get("csrfrejected"), Some(&1));
    }

    #[test]
    fn test_unknown_token_rejected_with_event() {
        let (csrf, audit) = service();

        assert!(!csrf.validate("never-issued", "U1"));
        assert_eq!(audit.stats(5).by_kind.get("csrfrejected"), Some(&1));
    }

    #[test]
    fn test_expired_token_rejected() {
        let audit = Arc::new(SecurityLog::new(50, 24));
        let kv = Arc::new(MemoryKv::new());
        let csrf = CsrfTokens::new(kv.clone(), audit, 60);

        let token = csrf.issue("U1");
        // Force expiry by overwriting with a negative TTL
        kv.put(&format!("csrf:{}", token), "U1", Duration::seconds(-1));

        assert!(!csrf.validate(&token, "U1"));
    }

    #[test]
    fn test_tokens_are_unique() {
        let (csrf, _) = service();
        assert_ne!(csrf.issue("U1"), csrf.issue("U1"));
    }
}
