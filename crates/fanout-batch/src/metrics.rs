//! Metrics for array-task reconciliation.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fanout_batch_passes_total` | Counter | `phase` | Reconciliation passes by starting phase |
//! | `fanout_batch_phase_transitions_total` | Counter | `from_phase`, `to_phase` | Phase transitions |
//! | `fanout_batch_backend_calls_total` | Counter | `operation`, `result` | Remote backend calls |
//! | `fanout_batch_rate_limited_total` | Counter | `limiter` | Calls rejected under fail-fast |
//! | `fanout_batch_resync_duration_seconds` | Histogram | - | Job store resync time |
//! | `fanout_batch_resync_stale_total` | Counter | - | Resyncs that kept a stale snapshot |
//! | `fanout_batch_cached_jobs` | Gauge | - | Jobs held by the job store |
//! | `fanout_batch_subtask_outcomes_total` | Counter | `phase` | Sub-tasks reaching a terminal phase |
//! | `fanout_batch_definition_cache_total` | Counter | `result` | Job definition cache hits and misses |
//!
//! Metrics go through the `metrics` crate facade and are no-ops until a
//! recorder is installed.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Reconciliation passes.
    pub const PASSES_TOTAL: &str = "fanout_batch_passes_total";
    /// Counter: Phase transitions.
    pub const PHASE_TRANSITIONS_TOTAL: &str = "fanout_batch_phase_transitions_total";
    /// Counter: Remote backend calls.
    pub const BACKEND_CALLS_TOTAL: &str = "fanout_batch_backend_calls_total";
    /// Counter: Calls rejected by a rate limiter.
    pub const RATE_LIMITED_TOTAL: &str = "fanout_batch_rate_limited_total";
    /// Histogram: Resync duration in seconds.
    pub const RESYNC_DURATION_SECONDS: &str = "fanout_batch_resync_duration_seconds";
    /// Counter: Resyncs that retained a stale snapshot.
    pub const RESYNC_STALE_TOTAL: &str = "fanout_batch_resync_stale_total";
    /// Gauge: Jobs held by the job store.
    pub const CACHED_JOBS: &str = "fanout_batch_cached_jobs";
    /// Counter: Sub-tasks reaching a terminal phase.
    pub const SUBTASK_OUTCOMES_TOTAL: &str = "fanout_batch_subtask_outcomes_total";
    /// Counter: Job definition cache lookups.
    pub const DEFINITION_CACHE_TOTAL: &str = "fanout_batch_definition_cache_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Reconciliation or job phase.
    pub const PHASE: &str = "phase";
    /// Previous phase (for transitions).
    pub const FROM_PHASE: &str = "from_phase";
    /// Target phase (for transitions).
    pub const TO_PHASE: &str = "to_phase";
    /// Backend operation.
    pub const OPERATION: &str = "operation";
    /// Result status (ok, error, hit, miss).
    pub const RESULT: &str = "result";
    /// Rate limiter name.
    pub const LIMITER: &str = "limiter";
}

/// Records reconciliation metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct BatchMetrics;

impl BatchMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records one reconciliation pass starting in `phase`.
    pub fn record_pass(&self, phase: &str) {
        counter!(names::PASSES_TOTAL, labels::PHASE => phase.to_string()).increment(1);
    }

    /// Records a phase transition.
    pub fn record_phase_transition(&self, from_phase: &str, to_phase: &str) {
        counter!(
            names::PHASE_TRANSITIONS_TOTAL,
            labels::FROM_PHASE => from_phase.to_string(),
            labels::TO_PHASE => to_phase.to_string(),
        )
        .increment(1);
    }

    /// Records a backend call result.
    pub fn record_backend_call(&self, operation: &str, result: &str) {
        counter!(
            names::BACKEND_CALLS_TOTAL,
            labels::OPERATION => operation.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a call rejected by `limiter`.
    pub fn record_rate_limited(&self, limiter: &str) {
        counter!(names::RATE_LIMITED_TOTAL, labels::LIMITER => limiter.to_string()).increment(1);
    }

    /// Records resync duration.
    pub fn observe_resync_duration(&self, duration: Duration) {
        histogram!(names::RESYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a resync that kept a stale snapshot.
    pub fn record_resync_stale(&self) {
        counter!(names::RESYNC_STALE_TOTAL).increment(1);
    }

    /// Sets the number of jobs held by the job store.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_cached_jobs(&self, count: usize) {
        gauge!(names::CACHED_JOBS).set(count as f64);
    }

    /// Records `count` sub-tasks reaching terminal `phase`.
    pub fn record_subtask_outcomes(&self, phase: &str, count: u64) {
        if count == 0 {
            return;
        }
        counter!(names::SUBTASK_OUTCOMES_TOTAL, labels::PHASE => phase.to_string())
            .increment(count);
    }

    /// Records a job definition cache lookup.
    pub fn record_definition_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        counter!(names::DEFINITION_CACHE_TOTAL, labels::RESULT => result).increment(1);
    }
}

/// RAII guard that reports elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for one resync cycle.
#[must_use]
pub fn time_resync() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| BatchMetrics::new().observe_resync_duration(duration))
}
