//! Work queue feeding job ids to the runner's workers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::types::JobId;

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// FIFO of job ids awaiting a worker.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a job id.
    fn push(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Wait for the next job id. `None` once the queue is closed and drained.
    async fn pop(&self) -> Option<JobId>;

    /// Remove a job id that no worker has taken yet. Returns whether it was queued.
    fn remove(&self, job_id: JobId) -> bool;

    /// Stop accepting pushes and wake every waiting worker.
    fn close(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process queue.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    items: Mutex<VecDeque<JobId>>,
    closed: AtomicBool,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<JobId>> {
        // The critical sections never panic; recover the data if one ever did.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    fn push(&self, job_id: JobId) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.items().push_back(job_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Option<JobId> {
        loop {
            // Register interest before checking, so a push or close between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job_id) = self.items().pop_front() {
                return Some(job_id);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    fn remove(&self, job_id: JobId) -> bool {
        let mut items = self.items();
        let before = items.len();
        items.retain(|id| *id != job_id);
        before != items.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.items().len()
    }
}
