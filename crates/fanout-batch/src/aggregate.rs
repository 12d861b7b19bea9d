//! Folds per-index sub-task phases into one task-level outcome.
//!
//! The policy against a success threshold `m`, with `s` successes and
//! `pending` indexes that are not yet terminal:
//!
//! - `s >= m`: Success, whatever is still pending
//! - `s + pending < m`: Failure, without waiting for pending indexes
//! - otherwise: Running
//!
//! Permanent failures and successes are sticky, so once the threshold is
//! proven unreachable it stays unreachable.

use fanout_core::{BitSet, CompactArray};

use crate::error::Result;
use crate::phase::{JobPhase, Phase, TaskPhase, TaskPhaseInfo};
use crate::state::ArrayTaskState;

/// Aggregate outcome of an array task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Enough sub-tasks succeeded.
    Success,
    /// The threshold can no longer be met.
    Failure,
    /// Not yet decidable.
    Running,
}

impl Outcome {
    /// Returns true for Success or Failure.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-phase counts over a compact phase array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArraySummary {
    counts: [usize; JobPhase::ALL.len()],
    total: usize,
}

impl ArraySummary {
    /// Counts every entry of `phases`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorruptedPluginState`] for an unknown phase code.
    pub fn from_phases(phases: &CompactArray) -> Result<Self> {
        let mut summary = Self::default();
        for code in phases.iter() {
            summary.record(JobPhase::from_code(code)?);
        }
        Ok(summary)
    }

    /// Adds one entry.
    pub fn record(&mut self, phase: JobPhase) {
        // as_code is bounded by MAX_CODE, which indexes `counts`.
        if let Some(slot) = usize::try_from(phase.as_code())
            .ok()
            .and_then(|i| self.counts.get_mut(i))
        {
            *slot += 1;
            self.total += 1;
        }
    }

    /// Number of entries in `phase`.
    #[must_use]
    pub fn count(&self, phase: JobPhase) -> usize {
        usize::try_from(phase.as_code())
            .ok()
            .and_then(|i| self.counts.get(i).copied())
            .unwrap_or_default()
    }

    /// Total number of entries.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Entries that finished successfully.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.count(JobPhase::Success)
    }

    /// Entries that failed permanently.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.count(JobPhase::PermanentFailure)
    }

    /// Entries that may still change.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.total - self.successes() - self.failures()
    }

    /// Returns true if every entry is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.pending() == 0
    }

    /// Returns true once anything has moved beyond waiting to run.
    #[must_use]
    pub fn any_started(&self) -> bool {
        JobPhase::ALL
            .iter()
            .filter(|p| {
                matches!(
                    p,
                    JobPhase::Initializing
                        | JobPhase::Running
                        | JobPhase::Success
                        | JobPhase::RetryableFailure
                        | JobPhase::PermanentFailure
                )
            })
            .any(|p| self.count(*p) > 0)
    }
}

/// Applies the min-successes policy.
#[must_use]
pub fn decide_outcome(summary: &ArraySummary, min_successes: usize) -> Outcome {
    let successes = summary.successes();
    if successes >= min_successes {
        Outcome::Success
    } else if successes + summary.pending() < min_successes {
        Outcome::Failure
    } else {
        Outcome::Running
    }
}

/// Sets the cache bit for every successful index and clears it for the rest.
///
/// # Errors
///
/// Returns an error if the two structures have different lengths or a phase
/// code is unknown.
pub fn mark_cacheable(detailed: &CompactArray, indexes_to_cache: &mut BitSet) -> Result<()> {
    if detailed.len() != indexes_to_cache.len() {
        return Err(fanout_core::Error::InvalidInput(format!(
            "phase array length {} does not match cache bitset length {}",
            detailed.len(),
            indexes_to_cache.len()
        ))
        .into());
    }
    for (index, code) in detailed.iter().enumerate() {
        if JobPhase::from_code(code)?.is_success() {
            indexes_to_cache.set(index)?;
        } else {
            indexes_to_cache.clear(index)?;
        }
    }
    Ok(())
}

fn progress_version(summary: &ArraySummary) -> u32 {
    let terminal = summary.successes() + summary.failures();
    u32::try_from(terminal).unwrap_or(u32::MAX)
}

/// Computes the task-level status to report to the host.
///
/// The version counts terminal sub-tasks so each pass that observes progress
/// reports something new.
///
/// # Errors
///
/// Returns an error if the phase array holds an unknown code.
pub fn map_state_to_phase_info(state: &ArrayTaskState) -> Result<TaskPhaseInfo> {
    let info = match state.current_phase {
        Phase::Start | Phase::PreLaunch | Phase::Launch => {
            TaskPhaseInfo::new(TaskPhase::Initializing, 0)
        }
        Phase::CheckingSubTaskExecutions => {
            let summary = ArraySummary::from_phases(&state.detailed_phases)?;
            if summary.any_started() {
                TaskPhaseInfo::new(TaskPhase::Running, progress_version(&summary))
            } else {
                TaskPhaseInfo::new(TaskPhase::Queued, 0)
            }
        }
        Phase::WriteToDiscovery => {
            let summary = ArraySummary::from_phases(&state.detailed_phases)?;
            TaskPhaseInfo::new(TaskPhase::Running, progress_version(&summary))
        }
        Phase::Success => TaskPhaseInfo::new(TaskPhase::Success, 0),
        Phase::Failure => TaskPhaseInfo::new(TaskPhase::PermanentFailure, 0).with_reason(
            state
                .reason
                .clone()
                .unwrap_or_else(|| "array task failed".to_string()),
        ),
    };
    Ok(info)
}
