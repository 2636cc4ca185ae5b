//! Progressive login-attempt lockout.
//!
//! Process-local (DashMap) by design: good for a single-instance bot,
//! a clustered deployment needs these records in a shared store.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::audit::{EventKind, SecurityLog, Severity};

/// Result of a pre-login check.
#[derive(Clone, Copy, Debug)]
pub struct Verdict {
    pub allowed: bool,
    pub remaining_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug)]
struct AttemptRecord {
    failures: u32,
    last_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

/// Locks a user out after `max_failures` consecutive failed logins.
///
/// An expired lock is equivalent to no record: the next `check` resets it,
/// no timer involved.
pub struct LoginGuard {
    records: DashMap<String, AttemptRecord>,
    max_failures: u32,
    lockout: Duration,
    audit: Arc<SecurityLog>,
}

impl LoginGuard {
    pub fn new(max_failures: u32, lockout_minutes: i64, audit: Arc<SecurityLog>) -> Self {
        Self {
            records: DashMap::new(),
            max_failures,
            lockout: Duration::minutes(lockout_minutes),
            audit,
        }
    }

    pub fn check(&self, user_id: &str) -> Verdict {
        self.check_at(user_id, Utc::now())
    }

    fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> Verdict {
        let expired = match self.records.get(user_id) {
            Some(record) => match record.locked_until {
                Some(until) if until > now => {
                    return Verdict {
                        allowed: false,
                        remaining_attempts: 0,
                        locked_until: Some(until),
                    };
                }
                Some(_) => true,
                None => {
                    return Verdict {
                        allowed: true,
                        remaining_attempts: self.max_failures.saturating_sub(record.failures),
                        locked_until: None,
                    };
                }
            },
            None => false,
        };

        if expired {
            // Lock has lapsed: the record resets to zero
            self.records.remove(user_id);
        }

        Verdict {
            allowed: true,
            remaining_attempts: self.max_failures,
            locked_until: None,
        }
    }

    /// Records a failed login; locks the account on reaching the maximum.
    pub fn record_failure(&self, user_id: &str) {
        self.record_failure_at(user_id, Utc::now());
    }

    fn record_failure_at(&self, user_id: &str, now: DateTime<Utc>) {
        let mut record = self.records.entry(user_id.to_string()).or_insert(AttemptRecord {
            failures: 0,
            last_attempt: now,
            locked_until: None,
        });

        // A lapsed lock is equivalent to no record: this failure starts a
        // fresh count instead of piling onto the old one
        if record.locked_until.is_some_and(|until| until <= now) {
            record.failures = 0;
            record.locked_until = None;
        }

        record.failures += 1;
        record.last_attempt = now;

        if record.failures >= self.max_failures && record.locked_until.is_none() {
            let until = now + self.lockout;
            record.locked_until = Some(until);
            drop(record);

            self.audit.record(
                EventKind::AccountLocked,
                user_id,
                &format!("{} consecutive failed logins", self.max_failures),
                Severity::High,
                None,
            );
        }
    }

    /// Clears the record entirely after a successful login.
    pub fn record_success(&self, user_id: &str) {
        self.records.remove(user_id);
    }
}
