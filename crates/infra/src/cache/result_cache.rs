//! JSON result cache with TTL, pattern invalidation, and `cache_around`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::kv::{KvError, KvStore};

use super::key::{CacheKey, KeyArgs};

/// Failure of the computation wrapped by [`ResultCache::cache_around`].
#[derive(Debug, thiserror::Error)]
pub enum ComputeError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("computation timed out after {0:?}")]
    TimedOut(Duration),
}

/// Cache counters (process lifetime).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidated: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidated: AtomicU64,
    store_errors: AtomicU64,
}

/// Result cache over a shared key-value store.
///
/// Values are stored as JSON text and only ever decoded with `serde_json`.
/// Every key lives under `prefix`; invalidation never reaches outside it.
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    prefix: String,
    compute_timeout: Duration,
    counters: Counters,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("prefix", &self.prefix)
            .field("compute_timeout", &self.compute_timeout)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, compute_timeout: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            compute_timeout,
            counters: Counters::default(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for `args` under `namespace` in this cache.
    pub fn key(&self, namespace: &str, args: &KeyArgs) -> CacheKey {
        CacheKey::derive(&self.prefix, namespace, args)
    }

    /// Cached value for `key`, or `None` when absent, expired, undecodable,
    /// or when the store is unavailable.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.store.get(key.as_str()) {
            Ok(raw) => raw,
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key = %key, error = %e, "cache unavailable; treating as miss");
                return None;
            }
        };

        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(cache_key = %key, error = %e, "undecodable cache entry; treating as miss");
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    ///
    /// Returns whether the write reached the store.
    pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(cache_key = %key, error = %e, "value not cacheable");
                return false;
            }
        };

        match self.store.set(key.as_str(), &encoded, Some(ttl)) {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key = %key, error = %e, "cache unavailable; write skipped");
                false
            }
        }
    }

    /// Remove every entry whose key matches `pattern` (glob) under this
    /// cache's prefix. Best-effort: entries are deleted one by one.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let scoped = format!("{}:{}", self.prefix, pattern);
        let keys = match self.store.scan(&scoped) {
            Ok(keys) => keys,
            Err(e @ KvError::InvalidPattern { .. }) => {
                warn!(pattern = %scoped, error = %e, "invalid invalidation pattern; nothing removed");
                return 0;
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(pattern = %scoped, error = %e, "cache unavailable; invalidation skipped");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            match self.store.delete(&key) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(cache_key = %key, error = %e, "failed to delete cache entry");
                }
            }
        }

        self.counters
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(pattern = %scoped, removed, "cache invalidated");
        removed
    }

    /// Return the cached result for `args` under `namespace`, computing and
    /// storing it on a miss.
    ///
    /// `compute` runs at most once per call and is bounded by the cache's
    /// compute timeout. Concurrent misses on the same key each compute; the
    /// last write wins.
    pub async fn cache_around<T, E, F, Fut>(
        &self,
        namespace: &str,
        ttl: Duration,
        args: &KeyArgs,
        compute: F,
    ) -> Result<T, ComputeError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.key(namespace, args);

        if let Some(hit) = self.get::<T>(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache_key = %key, "cache hit");
            return Ok(hit);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key = %key, "cache miss");

        let value = tokio::time::timeout(self.compute_timeout, compute())
            .await
            .map_err(|_| ComputeError::TimedOut(self.compute_timeout))?
            .map_err(ComputeError::Failed)?;

        self.set(&key, &value, ttl);
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::{InMemoryKvStore, KvError};

    const TTL: Duration = Duration::from_secs(300);

    fn cache_with_clock() -> (ResultCache, Arc<InMemoryKvStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let cache = ResultCache::new(store.clone(), "estimation_app", Duration::from_secs(5));
        (cache, store, clock)
    }

    /// Store that fails every call.
    struct DownStore;

    impl KvStore for DownStore {
        fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        fn delete(&self, _key: &str) -> Result<bool, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        fn scan(&self, _pattern: &str) -> Result<Vec<String>, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> Result<bool, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn set_then_get_until_ttl_elapses() {
        let (cache, _store, clock) = cache_with_clock();
        let key = cache.key("estimate", &KeyArgs::new().arg("1"));

        assert!(cache.set(&key, &serde_json::json!({"total_cost": 15500.0}), TTL));
        assert_eq!(
            cache.get::<serde_json::Value>(&key),
            Some(serde_json::json!({"total_cost": 15500.0}))
        );

        clock.advance(TTL - Duration::from_secs(1));
        assert!(cache.get::<serde_json::Value>(&key).is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<serde_json::Value>(&key), None);
    }

    #[test]
    fn set_overwrites_and_restarts_ttl() {
        let (cache, _store, clock) = cache_with_clock();
        let key = cache.key("estimate", &KeyArgs::new().arg("1"));

        cache.set(&key, &1u32, TTL);
        clock.advance(Duration::from_secs(200));
        cache.set(&key, &2u32, TTL);
        clock.advance(Duration::from_secs(200));

        assert_eq!(cache.get::<u32>(&key), Some(2));
    }

    #[test]
    fn invalidate_only_touches_matching_keys_in_prefix() {
        let (cache, store, _clock) = cache_with_clock();
        let e1 = cache.key("estimate", &KeyArgs::new().arg("1"));
        let e2 = cache.key("estimate", &KeyArgs::new().arg("2"));
        let report = cache.key("report", &KeyArgs::new().arg("1"));
        cache.set(&e1, &"a", TTL);
        cache.set(&e2, &"b", TTL);
        cache.set(&report, &"c", TTL);
        store.set("other_app:estimate:x", "\"d\"", None).unwrap();

        assert_eq!(cache.invalidate("estimate:*"), 2);

        assert_eq!(cache.get::<String>(&e1), None);
        assert_eq!(cache.get::<String>(&e2), None);
        assert_eq!(cache.get::<String>(&report).as_deref(), Some("c"));
        assert_eq!(
            store.get("other_app:estimate:x").unwrap().as_deref(),
            Some("\"d\"")
        );
    }

    #[test]
    fn invalid_pattern_removes_nothing() {
        let (cache, _store, _clock) = cache_with_clock();
        let e1 = cache.key("estimate", &KeyArgs::new().arg("1"));
        cache.set(&e1, &"a", TTL);

        assert_eq!(cache.invalidate("estimate:[z-a]"), 0);
        assert_eq!(cache.get::<String>(&e1).as_deref(), Some("a"));
        assert_eq!(cache.stats().store_errors, 0);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let (cache, store, _clock) = cache_with_clock();
        let key = cache.key("estimate", &KeyArgs::new().arg("1"));
        store.set(key.as_str(), "{'not': json}", None).unwrap();

        assert_eq!(cache.get::<serde_json::Value>(&key), None);
    }

    #[tokio::test]
    async fn cache_around_computes_once_for_identical_args() {
        let (cache, _store, _clock) = cache_with_clock();
        let calls = AtomicUsize::new(0);
        let args = KeyArgs::new().arg("est-1").named("include", "items");

        for _ in 0..2 {
            let value: u64 = cache
                .cache_around("est", TTL, &args, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(15_500)
                })
                .await
                .unwrap();
            assert_eq!(value, 15_500);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));
    }

    #[tokio::test]
    async fn cache_around_recomputes_after_expiry_and_for_other_args() {
        let (cache, _store, clock) = cache_with_clock();
        let calls = AtomicUsize::new(0);
        let run = |id: &'static str| {
            let args = KeyArgs::new().arg(id);
            let cache = &cache;
            let calls = &calls;
            async move {
                cache
                    .cache_around("est", TTL, &args, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Infallible>(id.to_string())
                    })
                    .await
                    .unwrap()
            }
        };

        assert_eq!(run("a").await, "a");
        assert_eq!(run("b").await, "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        clock.advance(TTL);
        run("a").await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cache_around_does_not_store_failures() {
        let (cache, _store, _clock) = cache_with_clock();
        let args = KeyArgs::new().arg("x");

        let err = cache
            .cache_around("est", TTL, &args, || async { Err::<u32, _>("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Failed("boom")));

        let value = cache
            .cache_around("est", TTL, &args, || async { Ok::<_, &str>(7u32) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cache_around_times_out_slow_computation() {
        let store = Arc::new(InMemoryKvStore::new());
        let cache = ResultCache::new(store, "estimation_app", Duration::from_millis(20));

        let err = cache
            .cache_around("est", TTL, &KeyArgs::new(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Infallible>(1u32)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::TimedOut(_)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_open() {
        let cache = ResultCache::new(Arc::new(DownStore), "estimation_app", Duration::from_secs(5));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = cache
                .cache_around("est", TTL, &KeyArgs::new().arg(1), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(42u32)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.invalidate("*"), 0);
        assert!(cache.stats().store_errors >= 4);
    }
}
