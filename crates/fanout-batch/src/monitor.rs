//! Handler for [`Phase::CheckingSubTaskExecutions`].
//!
//! Each pass folds the latest cached job snapshot into the compact per-index
//! arrays and asks the aggregator whether the task is decided. The job store
//! is never written here except to seed a placeholder after a restart.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{ArraySummary, Outcome, decide_outcome, mark_cacheable};
use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::executor::TaskExecutionMetadata;
use crate::job::{Job, JobStatus};
use crate::job_store::JobStore;
use crate::metrics::BatchMetrics;
use crate::phase::{JobPhase, Phase};
use crate::state::ArrayTaskState;

const CANCEL_REASON: &str = "minimum successes can no longer be reached";

/// Returns the phase to record for a sub-task given its latest report.
///
/// A failed attempt stays retryable while the backend may still retry it.
/// Once `max_retries` attempts are used, or the umbrella job has finished, the
/// failure is permanent.
fn settle_phase(
    reported: JobPhase,
    attempts: u64,
    max_retries: u32,
    job_finished: bool,
) -> JobPhase {
    if reported == JobPhase::RetryableFailure
        && (attempts >= u64::from(max_retries) || job_finished)
    {
        JobPhase::PermanentFailure
    } else {
        reported
    }
}

/// Folds the cached job into `state` and advances once the outcome is known.
///
/// On a cache miss a queued placeholder is seeded and the state is left
/// unchanged; the next resync fills it in. When the success threshold becomes
/// unreachable the umbrella job is cancelled on a best-effort basis.
///
/// # Errors
///
/// Returns an error for inconsistent state or a poisoned lock. Backend
/// failures during cancellation are logged only.
#[tracing::instrument(
    skip_all,
    fields(task = %metadata.generated_name, size = state.execution_array_size)
)]
pub async fn check_sub_tasks_state(
    state: &mut ArrayTaskState,
    store: &JobStore,
    metadata: &TaskExecutionMetadata,
    config: &BatchConfig,
    deadline: Instant,
) -> Result<()> {
    let job_id = state
        .external_job_id
        .clone()
        .ok_or_else(|| Error::corrupted("checking phase reached without an external job id"))?;

    let placeholder =
        || Job::new(job_id.clone(), JobPhase::Queued).with_owner(metadata.owner.clone());
    let mut job = store.get_or_create(&metadata.generated_name, placeholder())?;
    if job.id != job_id {
        warn!(cached = %job.id, expected = %job_id, "cached job does not match state, reseeding");
        store.evict(&metadata.generated_name)?;
        job = store.get_or_create(&metadata.generated_name, placeholder())?;
    }

    let finished = job.is_finished();
    let mut newly_terminal: HashMap<JobPhase, u64> = HashMap::new();
    for index in 0..state.execution_array_size {
        let current = state.sub_task_phase(index)?;
        if current.is_terminal() {
            continue;
        }
        let reported: &JobStatus = if job.sub_jobs.is_empty() {
            &job.status
        } else if let Some(sub_job) = job.sub_jobs.get(index) {
            &sub_job.status
        } else {
            continue;
        };

        let attempts = state
            .retry_attempts
            .get(index)?
            .max(u64::from(reported.attempts))
            .min(state.retry_attempts.max_value());
        state.retry_attempts.set(index, attempts)?;

        let phase = settle_phase(reported.phase, attempts, config.max_retries, finished);
        if phase != current {
            state.set_sub_task_phase(index, phase)?;
            if phase.is_terminal() {
                *newly_terminal.entry(phase).or_default() += 1;
            }
        }
    }

    let metrics = BatchMetrics::new();
    for (phase, count) in newly_terminal {
        metrics.record_subtask_outcomes(phase.as_label(), count);
    }

    mark_cacheable(&state.detailed_phases, &mut state.indexes_to_cache)?;
    let summary = ArraySummary::from_phases(&state.detailed_phases)?;
    let min_successes = state.effective_min_successes();
    match decide_outcome(&summary, min_successes) {
        Outcome::Success => {
            info!(successes = summary.successes(), min_successes, "success threshold reached");
            state.transition_to(Phase::WriteToDiscovery)
        }
        Outcome::Failure => {
            info!(
                successes = summary.successes(),
                pending = summary.pending(),
                min_successes,
                "success threshold unreachable"
            );
            if !summary.all_terminal() && !finished {
                let cancelled = store
                    .client()
                    .cancel_job(&job_id, CANCEL_REASON, deadline)
                    .await;
                if let Err(err) = cancelled {
                    warn!(job_id = %job_id, error = %err, "failed to cancel doomed array job");
                }
            }
            state.transition_to(Phase::WriteToDiscovery)
        }
        Outcome::Running => {
            debug!(
                successes = summary.successes(),
                pending = summary.pending(),
                "array still running"
            );
            Ok(())
        }
    }
}
