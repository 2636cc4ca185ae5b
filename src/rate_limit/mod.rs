// Per-user, per-action rate limiting for bot commands.
//
// Fixed-window counting, persisted in SQLite so limits survive restarts.
// Fixed windows are deliberate: simpler than sliding windows and sufficient
// at per-15-minute policy granularity, at the cost of up to a 2x burst
// straddling a window boundary. On storage failure the limiter fails OPEN
// (the request is allowed) and the fault is logged: availability is
// prioritized over strict enforcement.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::audit::{EventKind, SecurityLog, Severity};
use crate::error::Result;

/// Limit for one action: at most `max` requests per `window`.
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    pub max: u32,
    pub window: Duration,
}

impl Policy {
    pub fn new(max: u32, window_secs: i64) -> Self {
        Self {
            max,
            window: Duration::seconds(window_secs),
        }
    }
}

/// Maps action names to policies, with a fallback for unknown actions.
#[derive(Clone, Debug)]
pub struct PolicyTable {
    policies: HashMap<String, Policy>,
    default: Policy,
}

impl PolicyTable {
    pub fn new(default: Policy) -> Self {
        Self {
            policies: HashMap::new(),
            default,
        }
    }

    pub fn with_policy(mut self, action: &str, policy: Policy) -> Self {
        self.policies.insert(action.to_string(), policy);
        self
    }

    pub fn policy_for(&self, action: &str) -> Policy {
        self.policies.get(action).copied().unwrap_or(self.default)
    }
}

/// Outcome of a rate-limit check.
#[derive(Clone, Copy, Debug)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// When the current window resets.
    pub reset_at: DateTime<Utc>,
}

/// Fixed-window rate limiter persisted in SQLite.
///
/// One counter row per (user, action) pair, upsert semantics. The
/// read-then-write sequence is a known check-then-act race under true
/// concurrent multi-instance access; a single-instance deployment behind
/// the connection mutex is race-free.
pub struct RateLimiter {
    conn: Mutex<Connection>,
    policies: PolicyTable,
}

impl RateLimiter {
    pub fn open<P: AsRef<Path>>(db_path: P, policies: PolicyTable) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open rate-limit database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                count INTEGER NOT NULL,
                window_start TEXT NOT NULL,
                PRIMARY KEY (user_id, action)
            )
            "#,
            [],
        )
        .context("failed to create rate_limits table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            policies,
        })
    }

    /// Checks and consumes one request for (user, action).
    ///
    /// Denials do not increment the counter. Storage faults fail open.
    pub fn check_and_consume(&self, user_id: &str, action: &str, audit: &SecurityLog) -> Decision {
        let now = Utc::now();
        let policy = self.policies.policy_for(action);

        match self.check_at(user_id, action, policy, now) {
            Ok(decision) => {
                if !decision.allowed {
                    audit.record(
                        EventKind::RateLimited,
                        user_id,
                        &format!("action '{}' denied until {}", action, decision.reset_at),
                        Severity::Medium,
                        None,
                    );
                }
                decision
            }
            Err(e) => {
                // Fail open: a storage outage must not deny all users service
                tracing::warn!(user = %user_id, action = %action, error = %e, "rate-limit storage fault, failing open");
                audit.record(
                    EventKind::StorageFault,
                    user_id,
                    "rate limiter failed open",
                    Severity::High,
                    None,
                );
                Decision {
                    allowed: true,
                    remaining: policy.max.saturating_sub(1),
                    reset_at: now + policy.window,
                }
            }
        }
    }

    fn check_at(
        &self,
        user_id: &str,
        action: &str,
        policy: Policy,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(u32, String)> = conn
            .query_row(
                "SELECT count, window_start FROM rate_limits WHERE user_id = ?1 AND action = ?2",
                params![user_id, action],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read rate-limit counter")?;

        let (count, window_start) = match row {
            Some((count, start)) => {
                let start = DateTime::parse_from_rfc3339(&start)
                    .context("failed to parse window start")?
                    .with_timezone(&Utc);
                (count, start)
            }
            None => {
                conn.execute(
                    "INSERT INTO rate_limits (user_id, action, count, window_start)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(user_id, action) DO UPDATE SET
                         count = 1, window_start = excluded.window_start",
                    params![user_id, action, now.to_rfc3339()],
                )
                .context("failed to create rate-limit counter")?;
                return Ok(Decision {
                    allowed: true,
                    remaining: policy.max.saturating_sub(1),
                    reset_at: now + policy.window,
                });
            }
        };

        if now - window_start >= policy.window {
            // Stale window: reset to a fresh one with this request counted
            conn.execute(
                "UPDATE rate_limits SET count = 1, window_start = ?3
                 WHERE user_id = ?1 AND action = ?2",
                params![user_id, action, now.to_rfc3339()],
            )
            .context("failed to reset rate-limit window")?;
            return Ok(Decision {
                allowed: true,
                remaining: policy.max.saturating_sub(1),
                reset_at: now + policy.window,
            });
        }

        let reset_at = window_start + policy.window;

        if count >= policy.max {
            // Deny without incrementing
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        conn.execute(
            "UPDATE rate_limits SET count = count + 1 WHERE user_id = ?1 AND action = ?2",
            params![user_id, action],
        )
        .context("failed to increment rate-limit counter")?;

        Ok(Decision {
            allowed: true,
            remaining: policy.max - count - 1,
            reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(policies: PolicyTable) -> RateLimiter {
        RateLimiter::open(":memory:", policies).unwrap()
    }

    fn table(max: u32, window_secs: i64) -> PolicyTable {
        PolicyTable::new(Policy::new(max, window_secs))
    }

    #[test]
    fn test_window_counting_sequence() {
        let rl = limiter(table(3, 60));
        let policy = Policy::new(3, 60);
        let now = Utc::now();

        // 3 allowed with remaining 2, 1, 0
        for expected_remaining in [2, 1, 0] {
            let d = rl.check_at("U1", "upload", policy, now).unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        // 4th denied, counter not incremented, reset_at = start + window
        let denied = rl.check_at("U1", "upload", policy, now).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at.timestamp(), (now + Duration::seconds(60)).timestamp());

        // Denials repeat without consuming anything
        assert!(!rl.check_at("U1", "upload", policy, now).unwrap().allowed);
    }

    #[test]
    fn test_window_reset_after_elapse() {
        let rl = limiter(table(3, 60));
        let policy = Policy::new(3, 60);
        let start = Utc::now();

        for _ in 0..3 {
            rl.check_at("U1", "upload", policy, start).unwrap();
        }
        assert!(!rl.check_at("U1", "upload", policy, start).unwrap().allowed);

        // Next call after the window elapses starts a fresh window
        let later = start + Duration::seconds(61);
        let d = rl.check_at("U1", "upload", policy, later).unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[test]
    fn test_counters_are_per_user_and_action() {
        let rl = limiter(table(1, 60));
        let policy = Policy::new(1, 60);
        let now = Utc::now();

        assert!(rl.check_at("U1", "upload", policy, now).unwrap().allowed);
        assert!(!rl.check_at("U1", "upload", policy, now).unwrap().allowed);

        // Different action and different user are unaffected
        assert!(rl.check_at("U1", "search", policy, now).unwrap().allowed);
        assert!(rl.check_at("U2", "upload", policy, now).unwrap().allowed);
    }

    #[test]
    fn test_unknown_action_uses_default_policy() {
        let policies = table(2, 60).with_policy("upload", Policy::new(5, 60));
        assert_eq!(policies.policy_for("upload").max, 5);
        assert_eq!(policies.policy_for("anything-else").max, 2);
    }

    #[test]
    fn test_counters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.db");
        let policy = Policy::new(2, 600);
        let now = Utc::now();

        {
            let rl = RateLimiter::open(&path, table(2, 600)).unwrap();
            rl.check_at("U1", "upload", policy, now).unwrap();
            rl.check_at("U1", "upload", policy, now).unwrap();
        }

        let rl = RateLimiter::open(&path, table(2, 600)).unwrap();
        assert!(!rl.check_at("U1", "upload", policy, now).unwrap().allowed);
    }

    #[test]
    fn test_denial_records_security_event() {
        let rl = limiter(table(1, 60));
        let audit = SecurityLog::new(10, 24);

        assert!(rl.check_and_consume("U1", "upload", &audit).allowed);
        assert!(!rl.check_and_consume("U1", "upload", &audit).allowed);

        let stats = audit.stats(5);
        assert_eq!(stats.by_kind.get("ratelimited"), Some(&1));
    }
}
