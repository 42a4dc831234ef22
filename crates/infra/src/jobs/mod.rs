//! Background job system with progress, timeouts, retry, and backoff.
//!
//! ## Design
//!
//! - Jobs move `QUEUED -> RUNNING -> SUCCEEDED | FAILED`; a transient failure
//!   sends a running job back to `QUEUED` until its attempts are spent
//! - Every store mutation is an atomic compare-and-set, so workers and
//!   status queries never see a half-applied transition
//! - Side-effecting steps run through [`JobContext::apply_once`] and are
//!   recorded on the job, so a retried attempt never repeats them
//! - Only queued jobs can be cancelled
//!
//! ## Components
//!
//! - `Job`: job record and state machine
//! - `JobStore`: persistence (any [`crate::kv::KvStore`])
//! - `TaskQueue`: ids waiting for a worker
//! - `JobRunner`: submission and the worker pool

pub mod context;
pub mod queue;
pub mod runner;
pub mod store;
pub mod types;

pub use context::JobContext;
pub use queue::{InMemoryTaskQueue, QueueError, TaskQueue};
pub use runner::{
    CancelError, JobRunner, JobRunnerConfig, JobRunnerHandle, RunnerStats, SubmitError, TaskFuture,
    TaskHandler,
};
pub use store::{JobStats, JobStore, JobStoreError, KvJobStore};
pub use types::{
    BackoffStrategy, FailureKind, InvalidTransition, Job, JobAttemptRecord, JobFailure, JobId,
    JobProgress, JobState, JobUpdate, RetryPolicy, TaskError,
};
