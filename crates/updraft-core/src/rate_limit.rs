use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CacheStore, CacheValue, unit_key};
use crate::clock::add_duration;
use crate::config::RateLimitSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "rate limit reached for '{endpoint}': {limit} requests per {window_secs}s, retry in {retry_after_secs}s"
)]
pub struct RateLimited {
    pub endpoint: String,
    pub limit: u32,
    pub window_secs: u64,
    pub retry_after_secs: u64,
}

/// Fixed-window request gate for one unit.
///
/// Windows are not sliding: a counter lives for exactly one window after the
/// first request and is then recreated, so up to twice the limit can pass
/// around a window boundary.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cache: Arc<CacheStore>,
    unit_id: String,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(cache: Arc<CacheStore>, unit_id: &str, settings: RateLimitSettings) -> Self {
        Self {
            cache,
            unit_id: unit_id.to_string(),
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Count one request against `endpoint`.
    ///
    /// # Errors
    /// Returns [`RateLimited`] once the window's limit has been reached; the
    /// counter is not changed by a denied call.
    pub fn allow(&self, endpoint: &str) -> Result<(), RateLimited> {
        self.cache
            .increment_within_limit(
                &self.key(endpoint),
                self.settings.requests_per_window,
                self.settings.window(),
            )
            .map(|_| ())
            .map_err(|window| self.denied(endpoint, window))
    }

    /// Requests still allowed in the current window, without consuming one.
    #[must_use]
    pub fn remaining(&self, endpoint: &str) -> u32 {
        match self.cache.get(&self.key(endpoint)) {
            Some(CacheValue::Counter(window)) => {
                self.settings.requests_per_window.saturating_sub(window.count)
            }
            _ => self.settings.requests_per_window,
        }
    }

    fn denied(&self, endpoint: &str, window: RateWindow) -> RateLimited {
        let resets_at = add_duration(window.window_start, self.settings.window());
        let retry_after_secs = (resets_at - self.cache.now())
            .num_seconds()
            .max(0)
            .unsigned_abs();
        RateLimited {
            endpoint: endpoint.to_string(),
            limit: self.settings.requests_per_window,
            window_secs: self.settings.window_seconds,
            retry_after_secs,
        }
    }

    fn key(&self, endpoint: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.unit_id.as_bytes());
        hasher.update([0_u8]);
        hasher.update(endpoint.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        unit_key(&self.unit_id, "rate", &digest[..32])
    }
}
