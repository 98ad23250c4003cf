use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock, add_duration};
use crate::metadata::RemoteMetadata;
use crate::rate_limit::RateWindow;
use crate::status::UpdateStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
    Metadata(RemoteMetadata),
    /// Negative-cache marker for a failed lookup.
    Failure { message: String },
    Counter(RateWindow),
    Status(UpdateStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    saved_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
}

/// Process-wide key-value store with per-entry expiry.
///
/// Keys are namespaced by unit identifier by the components that write them;
/// see [`unit_key`].
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

/// Namespaced cache key for one unit.
#[must_use]
pub fn unit_key(unit_id: &str, kind: &str, detail: &str) -> String {
    if detail.is_empty() {
        format!("updraft:{unit_id}:{kind}")
    } else {
        format!("updraft:{unit_id}:{kind}:{detail}")
    }
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// The store shared by every client in this process that was not given
    /// one explicitly.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<CacheStore>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::default())).clone()
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Look up a live entry. Expired entries are dropped and reported as a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = self.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: CacheValue, ttl: Duration) {
        let expires_at = add_duration(self.now(), ttl);
        self.lock().insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                expires_at,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`; returns how many
    /// were removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Atomically count one request against a fixed window.
    ///
    /// A missing or expired counter starts a new window with `count = 1`
    /// expiring after `window`. A live counter is incremented while it is
    /// below `limit`; at the limit the window is returned as `Err` and left
    /// untouched.
    ///
    /// # Errors
    /// Returns the current window when it has already reached `limit`.
    pub fn increment_within_limit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateWindow, RateWindow> {
        let now = self.now();
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(key)
            && entry.is_live(now)
            && let CacheValue::Counter(counter) = &mut entry.value
        {
            if counter.count >= limit {
                return Err(*counter);
            }
            counter.count += 1;
            return Ok(*counter);
        }

        let counter = RateWindow {
            count: 1,
            window_start: now,
        };
        entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value: CacheValue::Counter(counter),
                expires_at: add_duration(now, window),
            },
        );
        Ok(counter)
    }

    /// Expiry of a live entry.
    #[must_use]
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = self.now();
        self.lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at)
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Load live entries persisted by [`CacheStore::save_to_path`]. A missing
    /// or unreadable file yields an empty store.
    pub fn load_from_path(path: &Path, clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(clock);
        let Ok(data) = std::fs::read_to_string(path) else {
            return store;
        };
        let persisted: PersistedCache = match serde_json::from_str(&data) {
            Ok(persisted) => persisted,
            Err(error) => {
                warn!("Ignoring unreadable cache file {}: {error}", path.display());
                return store;
            }
        };

        let now = store.now();
        {
            let mut entries = store.lock();
            for entry in persisted.entries {
                if entry.is_live(now) {
                    entries.insert(entry.key.clone(), entry);
                }
            }
        }
        debug!(
            "Loaded {} cache entries saved at {}",
            store.len(),
            persisted.saved_at
        );
        store
    }

    /// Persist live entries with an atomic replace of `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be serialized or written.
    pub fn save_to_path(&self, path: &Path) -> std::io::Result<()> {
        let now = self.now();
        let mut entries: Vec<CacheEntry> = self
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .cloned()
            .collect();
        entries.sort_by(|left, right| left.key.cmp(&right.key));

        let data = serde_json::to_vec(&PersistedCache {
            saved_at: now,
            entries,
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(path, &data)
    }
}

/// Replace `path` in one rename so readers never see a half-written cache.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "cache path has no parent")
    })?;
    let mut file = tempfile::Builder::new()
        .prefix(".updraft-cache-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}
