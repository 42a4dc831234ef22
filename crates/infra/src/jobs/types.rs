//! Core job types, the job state machine, and retry policy.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for a worker
    Queued,
    /// Picked up by a worker
    Running,
    /// Finished with a result (terminal)
    Succeeded,
    /// Finished with an error (terminal)
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Exceeded the hard execution timeout
    Timeout,
    /// Transient failure that exhausted its attempts
    Transient,
    /// Permanent failure (e.g. invalid input); never retried
    Permanent,
    /// Cancelled before a worker started it
    Cancelled,
}

/// Error detail of a failed job (or of a failed attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempt: u32,
}

/// Progress of a running job: `current/total` counts, a free-form message, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    pub fn count(current: u64, total: u64) -> Self {
        Self {
            current: Some(current),
            total: Some(total),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            current: None,
            total: None,
            message: Some(message.into()),
        }
    }
}

/// Metadata carried by a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub progress: Option<JobProgress>,
    pub result: Option<JsonValue>,
    pub error: Option<JobFailure>,
}

impl JobUpdate {
    pub fn progress(progress: JobProgress) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn result(result: JsonValue) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(error: JobFailure) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before re-running after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts have run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Registered task name
    pub task: String,
    /// JSON arguments
    pub args: JsonValue,
    /// Current state
    pub state: JobState,
    /// Number of attempts started so far
    pub attempt: u32,
    /// Total attempts allowed
    pub max_attempts: u32,
    /// Latest progress (high-water mark for counts)
    pub progress: Option<JobProgress>,
    /// Result payload, only when `Succeeded`
    pub result: Option<JsonValue>,
    /// Error detail, only when `Failed`
    pub error: Option<JobFailure>,
    /// Side-effecting steps already applied for this job
    #[serde(default)]
    pub applied_effects: BTreeSet<String>,
    /// Finished attempts
    #[serde(default)]
    pub history: Vec<JobAttemptRecord>,
    /// Start of the current attempt
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(task: impl Into<String>, args: JsonValue, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            task: task.into(),
            args,
            state: JobState::Queued,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            progress: None,
            result: None,
            error: None,
            applied_effects: BTreeSet::new(),
            history: Vec::new(),
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state transition.
    ///
    /// Legal edges: `Queued -> Running`, `Queued -> Failed` (cancellation only),
    /// `Running -> Running` (progress), `Running -> Queued` (retry),
    /// `Running -> Succeeded`, `Running -> Failed` (anything but cancellation).
    /// Nothing leaves a terminal state.
    pub fn apply_transition(&mut self, to: JobState, update: JobUpdate) -> Result<(), InvalidTransition> {
        let from = self.state;
        let invalid = InvalidTransition { from, to };
        let cancelling = update
            .error
            .as_ref()
            .is_some_and(|e| e.kind == FailureKind::Cancelled);

        let now = Utc::now();
        match (from, to) {
            (JobState::Queued, JobState::Running) => {
                self.attempt += 1;
                self.started_at = Some(now);
                self.merge_progress(update.progress);
            }
            (JobState::Queued, JobState::Failed) if cancelling => {
                self.error = update.error;
            }
            (JobState::Running, JobState::Running) => {
                self.merge_progress(update.progress);
            }
            (JobState::Running, JobState::Queued) => {
                let message = update.error.map(|e| e.message);
                self.finish_attempt(now, false, message);
                self.merge_progress(update.progress);
            }
            (JobState::Running, JobState::Succeeded) => {
                self.finish_attempt(now, true, None);
                self.merge_progress(update.progress);
                self.result = Some(update.result.unwrap_or(JsonValue::Null));
                self.error = None;
            }
            (JobState::Running, JobState::Failed) if !cancelling => {
                let error = update.error.unwrap_or_else(|| JobFailure {
                    kind: FailureKind::Permanent,
                    message: "failed".to_string(),
                    attempt: self.attempt,
                });
                self.finish_attempt(now, false, Some(error.message.clone()));
                self.merge_progress(update.progress);
                self.error = Some(error);
                self.result = None;
            }
            _ => return Err(invalid),
        }

        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Keep count-based progress monotonic: a lower `current` than stored is
    /// ignored, a message always replaces the previous one.
    fn merge_progress(&mut self, incoming: Option<JobProgress>) {
        let Some(incoming) = incoming else {
            return;
        };

        let progress = self.progress.get_or_insert_with(JobProgress::default);
        if let Some(current) = incoming.current {
            let stored = progress.current.unwrap_or(0);
            let same_total = progress.total.is_none() || progress.total == incoming.total;
            if current >= stored || !same_total {
                progress.current = Some(current);
                progress.total = incoming.total;
            }
        }
        if incoming.message.is_some() {
            progress.message = incoming.message;
        }
    }

    fn finish_attempt(&mut self, now: DateTime<Utc>, success: bool, error: Option<String>) {
        let started_at = self.started_at.take().unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Worth retrying (timeouts, dependency unavailable).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help (invalid input, missing record).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Transient(m) | TaskError::Permanent(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FailureKind) -> JobUpdate {
        JobUpdate::failure(JobFailure {
            kind,
            message: "boom".to_string(),
            attempt: 1,
        })
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn job_lifecycle_success() {
        let mut job = Job::new("test", serde_json::json!({"key": "value"}), 3);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);

        job.apply_transition(JobState::Running, JobUpdate::default()).unwrap();
        assert_eq!(job.attempt, 1);

        job.apply_transition(JobState::Succeeded, JobUpdate::result(serde_json::json!(42)))
            .unwrap();
        assert_eq!(job.result, Some(serde_json::json!(42)));
        assert!(job.error.is_none());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut done = Job::new("test", JsonValue::Null, 1);
        done.apply_transition(JobState::Running, JobUpdate::default()).unwrap();
        done.apply_transition(JobState::Succeeded, JobUpdate::default()).unwrap();

        let mut failed = Job::new("test", JsonValue::Null, 1);
        failed.apply_transition(JobState::Running, JobUpdate::default()).unwrap();
        failed
            .apply_transition(JobState::Failed, failure(FailureKind::Permanent))
            .unwrap();

        for job in [&mut done, &mut failed] {
            for to in [JobState::Queued, JobState::Running, JobState::Succeeded, JobState::Failed] {
                let from = job.state;
                assert_eq!(
                    job.apply_transition(to, JobUpdate::default()),
                    Err(InvalidTransition { from, to })
                );
            }
        }
    }

    #[test]
    fn retry_loops_back_to_queued_and_records_history() {
        let mut job = Job::new("test", JsonValue::Null, 2);
        job.apply_transition(JobState::Running, JobUpdate::default()).unwrap();
        job.apply_transition(JobState::Queued, failure(FailureKind::Transient))
            .unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert!(job.error.is_none());
        assert_eq!(job.history[0].error.as_deref(), Some("boom"));
        assert!(job.can_retry());

        job.apply_transition(JobState::Running, JobUpdate::default()).unwrap();
        assert_eq!(job.attempt, 2);
        assert!(!job.can_retry());
    }

    #[test]
    fn cancellation_only_from_queued() {
        let mut queued = Job::new("test", JsonValue::Null, 1);
        queued
            .apply_transition(JobState::Failed, failure(FailureKind::Cancelled))
            .unwrap();
        assert_eq!(queued.error.as_ref().unwrap().kind, FailureKind::Cancelled);

        let mut running = Job::new("test", JsonValue::Null, 1);
        running.apply_transition(JobState::Running, JobUpdate::default()).unwrap();
        assert!(running
            .apply_transition(JobState::Failed, failure(FailureKind::Cancelled))
            .is_err());

        let mut queued = Job::new("test", JsonValue::Null, 1);
        assert!(queued
            .apply_transition(JobState::Failed, failure(FailureKind::Permanent))
            .is_err());
        assert!(queued
            .apply_transition(JobState::Succeeded, JobUpdate::default())
            .is_err());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut job = Job::new("batch", JsonValue::Null, 1);
        job.apply_transition(JobState::Running, JobUpdate::default()).unwrap();

        job.apply_transition(JobState::Running, JobUpdate::progress(JobProgress::count(2, 3)))
            .unwrap();
        job.apply_transition(JobState::Running, JobUpdate::progress(JobProgress::count(1, 3)))
            .unwrap();
        assert_eq!(job.progress, Some(JobProgress::count(2, 3)));

        job.apply_transition(JobState::Running, JobUpdate::progress(JobProgress::message("almost")))
            .unwrap();
        let progress = job.progress.clone().unwrap();
        assert_eq!(progress.current, Some(2));
        assert_eq!(progress.message.as_deref(), Some("almost"));
    }
}
