//! Process-wide wiring of the cache, job system, and performance tracker.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::cache::ResultCache;
use crate::config::Settings;
use crate::jobs::{
    InMemoryTaskQueue, JobRunner, JobRunnerConfig, JobRunnerHandle, KvJobStore, RetryPolicy, TaskQueue,
};
use crate::kv::{InMemoryKvStore, KvError, KvStore};
use crate::perf::PerformanceTracker;
use crate::persistence::{EstimateRepository, InMemoryEstimateRepository};
use crate::tasks::{self, ImageAnalyzer, MockImageAnalyzer, TaskDeps};

/// Startup failure.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("key-value store: {0}")]
    Store(#[from] KvError),
}

/// Explicitly constructed service context: one per process (or per test).
pub struct EstimationCore {
    settings: Settings,
    cache: Arc<ResultCache>,
    jobs: JobRunner,
    estimates: Arc<dyn EstimateRepository>,
    perf: Arc<PerformanceTracker>,
    queue: Arc<dyn TaskQueue>,
    workers: Mutex<Option<JobRunnerHandle>>,
}

impl std::fmt::Debug for EstimationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstimationCore")
            .field("settings", &self.settings)
            .field("cache", &self.cache)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl EstimationCore {
    /// Build from settings: Redis when `REDIS_URL` is set (and the `redis`
    /// feature is compiled in), in-memory otherwise.
    pub fn init(settings: Settings) -> Result<Self, InitError> {
        let kv = open_store(&settings)?;
        Ok(Self::with_parts(
            settings,
            kv,
            Arc::new(InMemoryEstimateRepository::new()),
            Arc::new(MockImageAnalyzer::new()),
        ))
    }

    /// Build from explicit collaborators. Workers are not started.
    pub fn with_parts(
        settings: Settings,
        kv: Arc<dyn KvStore>,
        estimates: Arc<dyn EstimateRepository>,
        analyzer: Arc<dyn ImageAnalyzer>,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(
            kv.clone(),
            settings.cache_key_prefix.clone(),
            settings.compute_timeout,
        ));
        let perf = Arc::new(PerformanceTracker::new(settings.slow_operation_threshold));
        let store = Arc::new(KvJobStore::new(
            kv,
            format!("{}_jobs", settings.cache_key_prefix),
            settings.job_retention,
        ));
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());

        let config = JobRunnerConfig::default()
            .with_name("estimation-jobs")
            .with_workers(settings.job_workers)
            .with_timeouts(settings.job_soft_timeout, settings.job_hard_timeout)
            .with_retry_policy(RetryPolicy {
                max_attempts: settings.job_max_attempts,
                ..RetryPolicy::default()
            });
        let jobs = JobRunner::new(store, queue.clone(), perf.clone(), config);

        tasks::register_builtin_tasks(
            &jobs,
            TaskDeps {
                cache: cache.clone(),
                estimates: estimates.clone(),
                analyzer,
                analysis_ttl: settings.analysis_cache_ttl,
            },
        );

        Self {
            settings,
            cache,
            jobs,
            estimates,
            perf,
            queue,
            workers: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    pub fn estimates(&self) -> &Arc<dyn EstimateRepository> {
        &self.estimates
    }

    pub fn perf(&self) -> &Arc<PerformanceTracker> {
        &self.perf
    }

    /// Start the worker pool (idempotent). Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_none() {
            *workers = Some(self.jobs.spawn_workers());
        }
    }

    /// Stop accepting jobs, let in-flight jobs finish, and stop the workers.
    pub async fn shutdown(&self) {
        self.queue.close();
        let handle = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        info!("estimation core stopped");
    }
}

fn open_store(settings: &Settings) -> Result<Arc<dyn KvStore>, InitError> {
    match settings.redis_url.as_deref() {
        None => {
            info!("REDIS_URL not set; using in-memory store");
            Ok(InMemoryKvStore::arc())
        }
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = crate::kv::RedisKvStore::new(url)?;
            info!("using Redis store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("REDIS_URL is set but the redis feature is not compiled in; using in-memory store");
            Ok(InMemoryKvStore::arc())
        }
    }
}
