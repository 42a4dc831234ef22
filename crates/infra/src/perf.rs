//! Operation timing and slow-operation alerting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

/// Aggregate timing for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: usize,
    #[serde(with = "secs")]
    pub total: Duration,
    #[serde(with = "secs")]
    pub average: Duration,
    #[serde(with = "secs")]
    pub min: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
}

/// Durations serialize as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Records wall-clock durations per operation name.
///
/// Samples are kept for the life of the process.
#[derive(Debug)]
pub struct PerformanceTracker {
    samples: Mutex<HashMap<String, Vec<Duration>>>,
    slow_threshold: Duration,
}

impl PerformanceTracker {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            slow_threshold,
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Start timing `operation`. The duration is recorded when the guard is
    /// dropped, whichever way the scope is left.
    pub fn track_time(&self, operation: impl Into<String>) -> TimingGuard<'_> {
        TimingGuard {
            tracker: self,
            operation: operation.into(),
            started: Instant::now(),
        }
    }

    /// Time a future to completion (or until it is dropped).
    pub async fn track<F: Future>(&self, operation: impl Into<String>, fut: F) -> F::Output {
        let _guard = self.track_time(operation);
        fut.await
    }

    /// Record one sample.
    pub fn record(&self, operation: &str, duration: Duration) {
        debug!(
            operation,
            duration_ms = duration.as_secs_f64() * 1000.0,
            "operation timed"
        );
        if duration > self.slow_threshold {
            warn!(
                operation,
                duration_secs = duration.as_secs_f64(),
                threshold_secs = self.slow_threshold.as_secs_f64(),
                "slow operation"
            );
        }

        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.entry(operation.to_string()).or_default().push(duration);
    }

    /// Statistics for `operation`, `None` if it was never recorded.
    pub fn statistics(&self, operation: &str) -> Option<OperationStats> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let times = samples.get(operation).filter(|t| !t.is_empty())?;

        let total: Duration = times.iter().sum();
        Some(OperationStats {
            count: times.len(),
            total,
            average: total / times.len() as u32,
            min: times.iter().copied().min().unwrap_or_default(),
            max: times.iter().copied().max().unwrap_or_default(),
        })
    }

    /// Names of every operation recorded so far, sorted.
    pub fn operations(&self) -> Vec<String> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = samples.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Scope guard returned by [`PerformanceTracker::track_time`].
#[must_use = "the operation is timed until the guard is dropped"]
#[derive(Debug)]
pub struct TimingGuard<'a> {
    tracker: &'a PerformanceTracker,
    operation: String,
    started: Instant,
}

impl TimingGuard<'_> {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        self.tracker.record(&self.operation, self.started.elapsed());
    }
}
