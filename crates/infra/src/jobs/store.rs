//! Job storage.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::kv::{InMemoryKvStore, KvError, KvStore};

use super::types::{InvalidTransition, Job, JobId, JobState, JobUpdate};

/// Job store abstraction.
///
/// Every mutation is atomic: concurrent workers and status queries never
/// observe a half-applied transition.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Move a job to `to`, applying `update` (see [`Job::apply_transition`]).
    fn transition(&self, job_id: JobId, to: JobState, update: JobUpdate) -> Result<Job, JobStoreError>;

    /// Claim a queued job for execution (`Queued -> Running`).
    /// Returns `None` when the job is no longer queued.
    fn claim(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Whether a side-effecting step was already applied for the job.
    fn effect_applied(&self, job_id: JobId, effect: &str) -> Result<bool, JobStoreError>;

    /// Record a side-effecting step as applied. Returns `false` if it already was.
    fn record_effect(&self, job_id: JobId, effect: &str) -> Result<bool, JobStoreError>;

    /// Most recent jobs first.
    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Job counts by state.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id}: {source}")]
    InvalidTransition {
        id: JobId,
        #[source]
        source: InvalidTransition,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job record: {0}")]
    Serialize(String),
}

impl From<KvError> for JobStoreError {
    fn from(e: KvError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Attempts before a contended compare-and-set gives up.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Job store on top of a [`KvStore`].
///
/// Jobs are JSON documents under `{prefix}:{job_id}`; every mutation is a
/// read/modify/compare-and-set loop, so atomicity comes from the store.
#[derive(Debug)]
pub struct KvJobStore<S> {
    kv: S,
    prefix: String,
    retention: Option<Duration>,
}

impl KvJobStore<Arc<InMemoryKvStore>> {
    /// Store backed by a private in-memory key-value store.
    pub fn in_memory() -> Self {
        Self::new(InMemoryKvStore::arc(), "jobs", None)
    }
}

impl<S: KvStore> KvJobStore<S> {
    /// `retention` is the TTL applied to job records on every write
    /// (`None` keeps them forever).
    pub fn new(kv: S, prefix: impl Into<String>, retention: Option<Duration>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            retention,
        }
    }

    fn key(&self, job_id: JobId) -> String {
        format!("{}:{}", self.prefix, job_id)
    }

    fn read(&self, job_id: JobId) -> Result<(String, Job), JobStoreError> {
        let raw = self
            .kv
            .get(&self.key(job_id))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        let job = decode(&raw)?;
        Ok((raw, job))
    }

    /// Read-modify-write with compare-and-set. `f` returns `Ok(false)` to
    /// leave the record untouched.
    fn modify<F>(&self, job_id: JobId, mut f: F) -> Result<(Job, bool), JobStoreError>
    where
        F: FnMut(&mut Job) -> Result<bool, JobStoreError>,
    {
        let key = self.key(job_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, mut job) = self.read(job_id)?;
            if !f(&mut job)? {
                return Ok((job, false));
            }

            let encoded = encode(&job)?;
            if self
                .kv
                .compare_and_set(&key, Some(&raw), &encoded, self.retention)?
            {
                return Ok((job, true));
            }
            debug!(job_id = %job_id, "job record changed concurrently; retrying");
        }

        Err(JobStoreError::Storage(format!(
            "job {job_id}: too much contention updating record"
        )))
    }
}

fn encode(job: &Job) -> Result<String, JobStoreError> {
    serde_json::to_string(job).map_err(|e| JobStoreError::Serialize(e.to_string()))
}

fn decode(raw: &str) -> Result<Job, JobStoreError> {
    serde_json::from_str(raw).map_err(|e| JobStoreError::Serialize(e.to_string()))
}

impl<S: KvStore> JobStore for KvJobStore<S> {
    fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let encoded = encode(job)?;
        if self
            .kv
            .compare_and_set(&self.key(job.id), None, &encoded, self.retention)?
        {
            Ok(())
        } else {
            Err(JobStoreError::AlreadyExists(job.id))
        }
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.read(job_id).map(|(_, job)| job)
    }

    fn transition(&self, job_id: JobId, to: JobState, update: JobUpdate) -> Result<Job, JobStoreError> {
        let (job, _) = self.modify(job_id, |job| {
            job.apply_transition(to, update.clone())
                .map_err(|source| JobStoreError::InvalidTransition { id: job_id, source })?;
            Ok(true)
        })?;
        Ok(job)
    }

    fn claim(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let (job, claimed) = self.modify(job_id, |job| {
            if job.state != JobState::Queued {
                return Ok(false);
            }
            job.apply_transition(JobState::Running, JobUpdate::default())
                .map_err(|source| JobStoreError::InvalidTransition { id: job_id, source })?;
            Ok(true)
        })?;
        Ok(claimed.then_some(job))
    }

    fn effect_applied(&self, job_id: JobId, effect: &str) -> Result<bool, JobStoreError> {
        Ok(self.get(job_id)?.applied_effects.contains(effect))
    }

    fn record_effect(&self, job_id: JobId, effect: &str) -> Result<bool, JobStoreError> {
        let (_, recorded) = self.modify(job_id, |job| Ok(job.applied_effects.insert(effect.to_string())))?;
        Ok(recorded)
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let keys = self.kv.scan(&format!("{}:*", self.prefix))?;
        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            // A record can expire between scan and get.
            if let Some(raw) = self.kv.get(&key)? {
                jobs.push(decode(&raw)?);
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.list(usize::MAX)? {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).create(job)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(job_id)
    }

    fn transition(&self, job_id: JobId, to: JobState, update: JobUpdate) -> Result<Job, JobStoreError> {
        (**self).transition(job_id, to, update)
    }

    fn claim(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).claim(job_id)
    }

    fn effect_applied(&self, job_id: JobId, effect: &str) -> Result<bool, JobStoreError> {
        (**self).effect_applied(job_id, effect)
    }

    fn record_effect(&self, job_id: JobId, effect: &str) -> Result<bool, JobStoreError> {
        (**self).record_effect(job_id, effect)
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
