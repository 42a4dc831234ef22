//! Per-attempt execution context handed to task handlers.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobProgress, JobState, JobUpdate, TaskError};

/// What a handler sees of its job: arguments, progress reporting, the soft
/// deadline, and idempotent side-effect gating.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    task: String,
    args: JsonValue,
    attempt: u32,
    max_attempts: u32,
    soft_deadline: Instant,
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("task", &self.task)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Store failures inside a handler are worth a retry.
fn store_error(e: JobStoreError) -> TaskError {
    TaskError::transient(format!("job store: {e}"))
}

impl JobContext {
    pub(crate) fn new(job: &Job, store: Arc<dyn JobStore>, soft_deadline: Instant) -> Self {
        Self {
            job_id: job.id,
            task: job.task.clone(),
            args: job.args.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            soft_deadline,
            store,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Current attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn args(&self) -> &JsonValue {
        &self.args
    }

    /// Decode the arguments; malformed arguments are a permanent failure.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| TaskError::permanent(format!("invalid arguments for {}: {e}", self.task)))
    }

    /// Persist `current/total` progress.
    pub fn report_progress(&self, current: u64, total: u64) -> Result<(), TaskError> {
        self.report(JobProgress::count(current, total))
    }

    /// Persist a free-form status message.
    pub fn report_message(&self, message: impl Into<String>) -> Result<(), TaskError> {
        self.report(JobProgress::message(message))
    }

    fn report(&self, progress: JobProgress) -> Result<(), TaskError> {
        self.store
            .transition(self.job_id, JobState::Running, JobUpdate::progress(progress))
            .map(|_| ())
            .map_err(store_error)
    }

    /// Whether the soft timeout has passed. Handlers may checkpoint and keep
    /// going; only the hard timeout stops them.
    pub fn soft_timeout_exceeded(&self) -> bool {
        Instant::now() >= self.soft_deadline
    }

    /// Record a checkpoint message once the soft timeout has passed.
    /// Returns whether the soft timeout has passed.
    pub fn checkpoint(&self, message: impl Into<String>) -> Result<bool, TaskError> {
        if !self.soft_timeout_exceeded() {
            return Ok(false);
        }
        let message = message.into();
        warn!(job_id = %self.job_id, task = %self.task, checkpoint = %message, "soft timeout exceeded");
        self.report_message(message)?;
        Ok(true)
    }

    /// Run a side-effecting step at most once per job.
    ///
    /// The stored job is checked before running `effect`; after it succeeds
    /// the step is recorded, so later attempts skip it. Returns whether the
    /// step ran on this call.
    pub async fn apply_once<F, Fut>(&self, effect: &str, run: F) -> Result<bool, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), TaskError>>,
    {
        if self
            .store
            .effect_applied(self.job_id, effect)
            .map_err(store_error)?
        {
            debug!(job_id = %self.job_id, effect, "effect already applied; skipping");
            return Ok(false);
        }

        run().await?;

        self.store
            .record_effect(self.job_id, effect)
            .map_err(store_error)?;
        debug!(job_id = %self.job_id, effect, attempt = self.attempt, "effect applied");
        Ok(true)
    }
}
