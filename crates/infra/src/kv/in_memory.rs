//! In-memory key-value store for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};

use super::{KeyPattern, KvError, KvStore};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory store. Every operation runs under one lock, which also makes
/// `compare_and_set` atomic.
#[derive(Debug)]
pub struct InMemoryKvStore {
    inner: RwLock<HashMap<String, StoredValue>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose expiry checks use the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        // A TTL too large to represent behaves like no TTL.
        let ttl = chrono::Duration::from_std(ttl?).ok()?;
        self.clock.now().checked_add_signed(ttl)
    }

    fn poisoned() -> KvError {
        KvError::Unavailable("in-memory store lock poisoned".to_string())
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        let now = self.clock.now();
        Ok(map
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = self.expiry(ttl);
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        map.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = self.clock.now();
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(map.remove(key).is_some_and(|v| v.is_live(now)))
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let pattern = KeyPattern::new(pattern)?;
        let now = self.clock.now();
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        // Scans are the natural place to drop expired entries.
        map.retain(|_, v| v.is_live(now));

        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;

        let current = map
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.as_str());
        if current != expected {
            return Ok(false);
        }

        map.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }
}
