//! Consecutive login failure tracking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Consecutive login failures per identity, cleared on success.
#[derive(Default)]
pub struct LoginFailureTracker {
    failures: DashMap<String, FailureRecord>,
}

#[derive(Clone)]
struct FailureRecord {
    count: u32,
    first_failure: DateTime<Utc>,
    last_failure: DateTime<Utc>,
    last_error: String,
}

/// Information about failures for an identity.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub count: u32,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    pub last_error: String,
}

impl LoginFailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the updated count.
    pub fn record_failure(&self, identifier: &str, error: &str) -> u32 {
        let now = Utc::now();
        let mut entry = self
            .failures
            .entry(identifier.to_string())
            .or_insert(FailureRecord {
                count: 0,
                first_failure: now,
                last_failure: now,
                last_error: String::new(),
            });

        entry.count += 1;
        entry.last_failure = now;
        entry.last_error = error.to_string();
        entry.count
    }

    pub fn clear(&self, identifier: &str) {
        self.failures.remove(identifier);
    }

    pub fn failure_count(&self, identifier: &str) -> u32 {
        self.failures.get(identifier).map(|r| r.count).unwrap_or(0)
    }

    pub fn failure_info(&self, identifier: &str) -> Option<FailureInfo> {
        self.failures.get(identifier).map(|r| FailureInfo {
            count: r.count,
            first_failure: r.first_failure,
            last_failure: r.last_failure,
            last_error: r.last_error.clone(),
        })
    }

    pub fn clear_all(&self) {
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_until_cleared() {
        let tracker = LoginFailureTracker::new();
        assert_eq!(tracker.failure_count("110000000"), 0);

        tracker.record_failure("110000000", "captcha unsolvable");
        assert_eq!(tracker.record_failure("110000000", "network"), 2);
        assert_eq!(tracker.failure_count("other"), 0);

        let info = tracker.failure_info("110000000").unwrap();
        assert_eq!(info.last_error, "network");
        assert!(info.first_failure <= info.last_failure);

        tracker.clear("110000000");
        assert_eq!(tracker.failure_count("110000000"), 0);
    }
}
