//! Job runner: submission, a bounded worker pool, timeouts, and retries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::perf::PerformanceTracker;

use super::context::JobContext;
use super::queue::{QueueError, TaskQueue};
use super::store::{JobStore, JobStoreError};
use super::types::{
    FailureKind, Job, JobFailure, JobId, JobState, JobUpdate, RetryPolicy, TaskError,
};

/// Boxed future returned by a task handler.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<JsonValue, TaskError>> + Send>>;

/// Task handler function type.
pub type TaskHandler = Arc<dyn Fn(JobContext) -> TaskFuture + Send + Sync>;

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Name for logging
    pub name: String,
    /// Number of workers (each runs one job at a time)
    pub workers: usize,
    /// Execution is abandoned after this long
    pub hard_timeout: Duration,
    /// Handlers may checkpoint after this long
    pub soft_timeout: Duration,
    /// Attempts and backoff for transient failures
    pub retry_policy: RetryPolicy,
    /// Treat hard timeouts as transient (retry) instead of final
    pub retry_timeouts: bool,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            name: "job-runner".to_string(),
            workers: 4,
            hard_timeout: Duration::from_secs(300),
            soft_timeout: Duration::from_secs(240),
            retry_policy: RetryPolicy::default(),
            retry_timeouts: false,
        }
    }
}

impl JobRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeouts(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_timeout = soft;
        self.hard_timeout = hard;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Submission failure.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Cancellation failure.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("job {id} is {state} and can no longer be cancelled")]
    NotCancellable { id: JobId, state: JobState },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Runner statistics (process lifetime).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_timed_out: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    store_errors: AtomicU64,
}

struct RunnerInner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    tracker: Arc<PerformanceTracker>,
    config: JobRunnerConfig,
    counters: Counters,
}

/// Background job runner.
///
/// Cheap to clone; clones share handlers, store, queue, and statistics.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Finished(Result<JsonValue, TaskError>),
    TimedOut,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        tracker: Arc<PerformanceTracker>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                queue,
                handlers: RwLock::new(HashMap::new()),
                tracker,
                config,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.inner.config
    }

    /// Register a handler for a task name. `"prefix.*"` matches every task
    /// starting with `prefix.`, `"*"` matches anything.
    pub fn register_task<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, TaskError>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx| Box::pin(handler(ctx)) as TaskFuture);
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.into(), handler);
    }

    fn handler(&self, task: &str) -> Option<TaskHandler> {
        let handlers = self.inner.handlers.read().unwrap_or_else(|e| e.into_inner());

        if let Some(h) = handlers.get(task) {
            return Some(h.clone());
        }

        // Category match (e.g., "report.*" matches "report.pdf")
        for (pattern, handler) in handlers.iter() {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if task.starts_with(prefix) && task[prefix.len()..].starts_with('.') {
                    return Some(handler.clone());
                }
            }
        }

        handlers.get("*").cloned()
    }

    /// Queue a task for background execution.
    pub fn submit(&self, task: &str, args: JsonValue) -> Result<JobId, SubmitError> {
        if self.handler(task).is_none() {
            return Err(SubmitError::UnknownTask(task.to_string()));
        }

        let job = Job::new(task, args, self.inner.config.retry_policy.max_attempts);
        self.inner.store.create(&job)?;

        if let Err(e) = self.inner.queue.push(job.id) {
            // Do not leave an orphaned QUEUED record behind.
            self.abandon(job.id, 0, format!("not enqueued: {e}"));
            return Err(e.into());
        }

        info!(runner = %self.inner.config.name, job_id = %job.id, task, "job submitted");
        Ok(job.id)
    }

    /// Current state of a job.
    pub fn status(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.inner.store.get(job_id)
    }

    /// Cancel a job that no worker has started yet.
    pub fn cancel(&self, job_id: JobId) -> Result<Job, CancelError> {
        let cancelled = self.inner.store.transition(
            job_id,
            JobState::Failed,
            JobUpdate::failure(JobFailure {
                kind: FailureKind::Cancelled,
                message: "cancelled before start".to_string(),
                attempt: 0,
            }),
        );

        match cancelled {
            Ok(job) => {
                // A worker that already popped the id will fail to claim it.
                self.inner.queue.remove(job_id);
                info!(runner = %self.inner.config.name, job_id = %job_id, "job cancelled");
                Ok(job)
            }
            Err(JobStoreError::InvalidTransition { source, .. }) => Err(CancelError::NotCancellable {
                id: job_id,
                state: source.from,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> RunnerStats {
        let c = &self.inner.counters;
        RunnerStats {
            jobs_processed: c.processed.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            jobs_retried: c.retried.load(Ordering::Relaxed),
            jobs_timed_out: c.timed_out.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn spawn_workers(&self) -> JobRunnerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..self.inner.config.workers.max(1))
            .map(|worker| {
                let runner = self.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { worker_loop(runner, worker, shutdown).await })
            })
            .collect();

        info!(
            runner = %self.inner.config.name,
            workers = self.inner.config.workers.max(1),
            "job runner started"
        );

        JobRunnerHandle {
            name: self.inner.config.name.clone(),
            shutdown: shutdown_tx,
            workers,
        }
    }

    /// Claim and run one job to its next state.
    async fn execute(&self, job_id: JobId) {
        let store = &self.inner.store;
        let config = &self.inner.config;

        let job = match store.claim(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "job no longer queued; skipping");
                return;
            }
            Err(e) => {
                self.inner.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(job_id = %job_id, error = %e, "failed to claim job");
                return;
            }
        };
        self.inner.counters.processed.fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.handler(&job.task) else {
            let message = format!("no handler registered for task {}", job.task);
            warn!(job_id = %job.id, task = %job.task, "no handler for job");
            self.fail(&job, FailureKind::Permanent, message);
            return;
        };

        debug!(job_id = %job.id, task = %job.task, attempt = job.attempt, "job started");
        let ctx = JobContext::new(&job, store.clone(), Instant::now() + config.soft_timeout);

        let outcome = {
            let _timing = self.inner.tracker.track_time(format!("task.{}", job.task));
            let mut running = tokio::spawn(handler(ctx));
            match tokio::time::timeout(config.hard_timeout, &mut running).await {
                Ok(Ok(result)) => Outcome::Finished(result),
                Ok(Err(join_error)) => Outcome::Finished(Err(TaskError::permanent(format!(
                    "task aborted: {join_error}"
                )))),
                Err(_) => {
                    running.abort();
                    Outcome::TimedOut
                }
            }
        };

        match outcome {
            Outcome::Finished(Ok(result)) => {
                match store.transition(job.id, JobState::Succeeded, JobUpdate::result(result)) {
                    Ok(_) => {
                        self.inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                        info!(job_id = %job.id, task = %job.task, attempt = job.attempt, "job succeeded");
                    }
                    Err(e) => self.store_failed(&job, e),
                }
            }
            Outcome::Finished(Err(TaskError::Permanent(message))) => {
                self.fail(&job, FailureKind::Permanent, message);
            }
            Outcome::Finished(Err(TaskError::Transient(message))) => {
                self.retry_or_fail(&job, FailureKind::Transient, message);
            }
            Outcome::TimedOut => {
                self.inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let message = format!("exceeded hard timeout of {:?}", config.hard_timeout);
                if config.retry_timeouts {
                    self.retry_or_fail(&job, FailureKind::Timeout, message);
                } else {
                    self.fail(&job, FailureKind::Timeout, message);
                }
            }
        }
    }

    fn retry_or_fail(&self, job: &Job, kind: FailureKind, message: String) {
        if !job.can_retry() {
            self.fail(job, kind, message);
            return;
        }

        let failure = JobFailure {
            kind,
            message,
            attempt: job.attempt,
        };
        if let Err(e) = self
            .inner
            .store
            .transition(job.id, JobState::Queued, JobUpdate::failure(failure.clone()))
        {
            self.store_failed(job, e);
            return;
        }

        self.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
        let delay = self.inner.config.retry_policy.delay_for_attempt(job.attempt);
        warn!(
            job_id = %job.id,
            task = %job.task,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure.message,
            "job attempt failed; retrying"
        );

        if delay.is_zero() {
            self.requeue(job.id, job.attempt);
        } else {
            let runner = self.clone();
            let (job_id, attempt) = (job.id, job.attempt);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                runner.requeue(job_id, attempt);
            });
        }
    }

    /// Push a job that is already back in `Queued`. A closed queue means the
    /// runner is shutting down; the job is failed so it never stays queued.
    fn requeue(&self, job_id: JobId, attempt: u32) {
        if let Err(e) = self.inner.queue.push(job_id) {
            warn!(job_id = %job_id, attempt, error = %e, "could not requeue job");
            self.abandon(job_id, attempt, format!("runner shut down before retry: {e}"));
        }
    }

    /// Mark a queued job that will never reach a worker as `Failed/Cancelled`.
    fn abandon(&self, job_id: JobId, attempt: u32, message: String) {
        let failure = JobFailure {
            kind: FailureKind::Cancelled,
            message,
            attempt,
        };
        match self
            .inner
            .store
            .transition(job_id, JobState::Failed, JobUpdate::failure(failure))
        {
            Ok(_) => {}
            // Cancelled by a client in the meantime.
            Err(JobStoreError::InvalidTransition { .. }) => {
                debug!(job_id = %job_id, "job already left the queue");
            }
            Err(e) => {
                self.inner.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(job_id = %job_id, error = %e, "failed to mark unqueued job as failed");
            }
        }
    }

    fn fail(&self, job: &Job, kind: FailureKind, message: String) {
        let failure = JobFailure {
            kind,
            message,
            attempt: job.attempt,
        };
        match self
            .inner
            .store
            .transition(job.id, JobState::Failed, JobUpdate::failure(failure.clone()))
        {
            Ok(_) => {
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %job.id,
                    task = %job.task,
                    attempt = job.attempt,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "job failed"
                );
            }
            Err(e) => self.store_failed(job, e),
        }
    }

    fn store_failed(&self, job: &Job, e: JobStoreError) {
        self.inner.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        error!(job_id = %job.id, task = %job.task, error = %e, "failed to persist job outcome");
    }
}

async fn worker_loop(runner: JobRunner, worker: usize, mut shutdown: watch::Receiver<bool>) {
    let name = runner.inner.config.name.clone();
    debug!(runner = %name, worker, "worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = runner.inner.queue.pop() => next,
        };

        let Some(job_id) = next else {
            break;
        };
        runner.execute(job_id).await;

        if *shutdown.borrow() {
            break;
        }
    }

    debug!(runner = %name, worker, "worker stopped");
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct JobRunnerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl JobRunnerHandle {
    /// Stop taking new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(runner = %self.name, error = %e, "worker terminated abnormally");
            }
        }
        info!(runner = %self.name, "job runner stopped");
    }
}
