use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStore, CacheValue, unit_key};

/// How long a recorded status stays visible to the host.
pub const STATUS_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub status: StatusKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl UpdateStatus {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == StatusKind::Error
    }
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    cache: Arc<CacheStore>,
    key: String,
}

impl StatusReporter {
    pub fn new(cache: Arc<CacheStore>, unit_id: &str) -> Self {
        Self {
            cache,
            key: unit_key(unit_id, "status", ""),
        }
    }

    pub fn record_success(&self, message: impl Into<String>) {
        self.record(StatusKind::Success, message.into());
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.record(StatusKind::Error, message.into());
    }

    fn record(&self, status: StatusKind, message: String) {
        let status = UpdateStatus {
            status,
            message,
            timestamp: self.cache.now(),
        };
        self.cache.set(&self.key, CacheValue::Status(status), STATUS_TTL);
    }

    #[must_use]
    pub fn last(&self) -> Option<UpdateStatus> {
        match self.cache.get(&self.key) {
            Some(CacheValue::Status(status)) => Some(status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{StatusKind, StatusReporter};
    use crate::cache::CacheStore;
    use crate::clock::ManualClock;

    #[test]
    fn last_status_is_replaced_and_expires() {
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(CacheStore::new(clock.clone()));
        let reporter = StatusReporter::new(cache.clone(), "acme");
        assert!(reporter.last().is_none());

        reporter.record_error("server unreachable");
        reporter.record_success("update 1.1.0 available");
        let status = reporter.last().expect("status should be recorded");
        assert_eq!(status.status, StatusKind::Success);
        assert_eq!(status.message, "update 1.1.0 available");
        assert_eq!(status.timestamp, cache.now());

        clock.advance(Duration::from_secs(31));
        assert!(reporter.last().is_none());
    }

    #[test]
    fn statuses_are_kept_per_unit() {
        let cache = Arc::new(CacheStore::default());
        let first = StatusReporter::new(cache.clone(), "first");
        let second = StatusReporter::new(cache, "second");

        first.record_error("boom");
        assert!(first.last().is_some_and(|status| status.is_error()));
        assert!(second.last().is_none());
    }
}
