//! Security event log.
//!
//! Bounded in-memory ring of classified events with a rolling 24-hour
//! retention, feeding the `stats` endpoint and a pluggable requires-review
//! hook for critical events. Process-local: a clustered deployment needs a
//! shared backing store instead.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Classified event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoginFailed,
    AccountLocked,
    StateMismatch,
    SessionReplay,
    CsrfRejected,
    RateLimited,
    CorruptedSecret,
    TokenRefreshed,
    CredentialRevoked,
    StorageFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SecurityEvent {
    pub kind: EventKind,
    pub user_id: String,
    pub severity: Severity,
    pub details: String,
    /// Network origin metadata (remote address, forwarded-for), if known.
    pub origin: Option<String>,
    pub at: DateTime<Utc>,
}

/// Aggregate view for operational dashboards.
#[derive(Debug, serde::Serialize)]
pub struct LogStats {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub recent: Vec<SecurityEvent>,
}

type ReviewHook = Box<dyn Fn(&SecurityEvent) + Send + Sync>;

/// Bounded security event ring.
pub struct SecurityLog {
    events: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
    retention: Duration,
    review_hook: ReviewHook,
}

impl SecurityLog {
    /// Creates a log keeping at most `capacity` events for at most
    /// `retention_hours` hours.
    pub fn new(capacity: usize, retention_hours: i64) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            retention: Duration::hours(retention_hours),
            review_hook: Box::new(|_| {}),
        }
    }

    /// Replaces the no-op requires-review hook, called for every
    /// critical-severity event.
    pub fn with_review_hook(mut self, hook: ReviewHook) -> Self {
        self.review_hook = hook;
        self
    }

    /// Appends an event, evicting the oldest beyond capacity and anything
    /// past the retention window.
    pub fn record(
        &self,
        kind: EventKind,
        user_id: &str,
        details: &str,
        severity: Severity,
        origin: Option<&str>,
    ) {
        let event = SecurityEvent {
            kind,
            user_id: user_id.to_string(),
            severity,
            details: details.to_string(),
            origin: origin.map(str::to_string),
            at: Utc::now(),
        };

        tracing::info!(
            kind = ?event.kind,
            user = %event.user_id,
            severity = ?event.severity,
            "security event"
        );

        if severity == Severity::Critical {
            (self.review_hook)(&event);
        }

        let mut events = self.events.lock().unwrap();
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
        Self::prune(&mut events, self.retention);
    }

    /// Drops events older than the retention window. Invoked by the
    /// periodic cleanup task in addition to the per-record pass.
    pub fn cleanup(&self) -> usize {
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        Self::prune(&mut events, self.retention);
        before - events.len()
    }

    fn prune(events: &mut VecDeque<SecurityEvent>, retention: Duration) {
        let cutoff = Utc::now() - retention;
        while events.front().is_some_and(|e| e.at < cutoff) {
            events.pop_front();
        }
    }

    /// Aggregate counts plus the `recent_n` most recent events.
    pub fn stats(&self, recent_n: usize) -> LogStats {
        let events = self.events.lock().unwrap();

        let mut by_kind = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for event in events.iter() {
            *by_kind
                .entry(format!("{:?}", event.kind).to_lowercase())
                .or_insert(0) += 1;
            *by_severity
                .entry(format!("{:?}", event.severity).to_lowercase())
                .or_insert(0) += 1;
        }

        LogStats {
            total: events.len(),
            by_kind,
            by_severity,
            recent: events.iter().rev().take(recent_n).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_record_and_stats() {
        let log = SecurityLog::new(100, 24);
        log.record(EventKind::LoginFailed, "U1", "bad password", Severity::Low, None);
        log.record(EventKind::LoginFailed, "U1", "bad password", Severity::Low, None);
        log.record(
            EventKind::AccountLocked,
            "U1",
            "5 consecutive failures",
            Severity::High,
            Some("203.0.113.9"),
        );

        let stats = log.stats(2);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind["loginfailed"], 2);
        assert_eq!(stats.by_severity["high"], 1);
        assert_eq!(stats.recent.len(), 2);
        // Most recent first
        assert_eq!(stats.recent[0].kind, EventKind::AccountLocked);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = SecurityLog::new(3, 24);
        for i in 0..5 {
            log.record(
                EventKind::RateLimited,
                &format!("U{}", i),
                "",
                Severity::Low,
                None,
            );
        }

        assert_eq!(log.len(), 3);
        let stats = log.stats(3);
        // U0 and U1 were evicted
        assert!(stats.recent.iter().all(|e| e.user_id != "U0"));
        assert!(stats.recent.iter().any(|e| e.user_id == "U4"));
    }

    #[test]
    fn test_retention_pruned_on_cleanup() {
        let log = SecurityLog::new(100, 0); // zero-hour retention
        log.record(EventKind::LoginFailed, "U1", "", Severity::Low, None);

        std::thread::sleep(std::time::Duration::from_millis(5));
        log.cleanup();
        assert!(log.is_empty());
    }

    #[test]
    fn test_critical_routes_through_review_hook() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let log = SecurityLog::new(10, 24).with_review_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        log.record(EventKind::CorruptedSecret, "U1", "", Severity::Critical, None);
        log.record(EventKind::LoginFailed, "U1", "", Severity::Low, None);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
