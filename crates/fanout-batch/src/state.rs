//! Persisted reconciliation state for one array task.

use fanout_core::{BitSet, CompactArray};

use crate::error::{Error, Result};
use crate::phase::{JobPhase, Phase};

/// Everything the driver needs to resume reconciliation on the next pass.
///
/// `detailed_phases`, `indexes_to_cache` and `retry_attempts` are indexed by
/// execution index (`0..execution_array_size`). `cached_upstream` is indexed
/// by original index; execution index `i` maps to the `i`-th original index
/// whose bit is clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayTaskState {
    /// Current reconciliation phase.
    pub current_phase: Phase,
    /// Number of sub-tasks actually launched.
    pub execution_array_size: usize,
    /// Requested fan-out width.
    pub original_array_size: usize,
    /// Successes required across the original width.
    pub original_min_successes: usize,
    /// Per execution index job phase code.
    pub detailed_phases: CompactArray,
    /// Per execution index flag set when the output should be cached.
    pub indexes_to_cache: BitSet,
    /// Per execution index retry counter.
    pub retry_attempts: CompactArray,
    /// Per original index flag set when the output was found upstream.
    pub cached_upstream: BitSet,
    /// Remote umbrella job, once launched.
    pub external_job_id: Option<String>,
    /// Remote job definition, once registered.
    pub job_definition_handle: Option<String>,
    /// Explanation for a terminal failure.
    pub reason: Option<String>,
}

impl ArrayTaskState {
    /// Creates the state for a first pass.
    ///
    /// Until discoverability is determined the execution size is the
    /// original size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] with `InvalidInput` if `min_successes` exceeds
    /// `original_size`.
    pub fn new(original_size: usize, min_successes: usize) -> Result<Self> {
        if min_successes > original_size {
            return Err(fanout_core::Error::InvalidInput(format!(
                "min successes {min_successes} exceeds array size {original_size}"
            ))
            .into());
        }
        let mut state = Self {
            current_phase: Phase::Start,
            execution_array_size: 0,
            original_array_size: original_size,
            original_min_successes: min_successes,
            detailed_phases: CompactArray::new(0, JobPhase::BIT_WIDTH)?,
            indexes_to_cache: BitSet::new(0),
            retry_attempts: CompactArray::new(0, 1)?,
            cached_upstream: BitSet::new(original_size),
            external_job_id: None,
            job_definition_handle: None,
            reason: None,
        };
        state.set_execution_size(original_size, 1)?;
        Ok(state)
    }

    /// Resizes the per-index arrays to `size` entries, clearing them.
    ///
    /// Retry counters are sized to hold `max_retries`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] if the arrays cannot be allocated.
    pub fn set_execution_size(&mut self, size: usize, max_retries: u32) -> Result<()> {
        self.execution_array_size = size;
        self.detailed_phases = CompactArray::new(size, JobPhase::BIT_WIDTH)?;
        self.indexes_to_cache = BitSet::new(size);
        self.retry_attempts = CompactArray::for_max_value(size, u64::from(max_retries))?;
        Ok(())
    }

    /// Successes still required from launched sub-tasks.
    ///
    /// Indexes satisfied upstream already count toward the original threshold.
    #[must_use]
    pub fn effective_min_successes(&self) -> usize {
        let satisfied = self
            .original_array_size
            .saturating_sub(self.execution_array_size);
        self.original_min_successes.saturating_sub(satisfied)
    }

    /// Maps an execution index back to the original index it runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] with `IndexOutOfRange` if no such index exists.
    pub fn original_index(&self, execution_index: usize) -> Result<usize> {
        self.cached_upstream
            .iter_zeros()
            .nth(execution_index)
            .ok_or_else(|| {
                fanout_core::Error::IndexOutOfRange {
                    index: execution_index,
                    len: self.execution_array_size,
                }
                .into()
            })
    }

    /// Returns the original index of every execution index, in order.
    ///
    /// Prefer this over repeated [`ArrayTaskState::original_index`] calls when
    /// mapping many indexes; it walks the bitset once.
    #[must_use]
    pub fn original_indexes(&self) -> Vec<usize> {
        self.cached_upstream
            .iter_zeros()
            .take(self.execution_array_size)
            .collect()
    }

    /// Returns the job phase recorded for an execution index.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range index or an unknown code.
    pub fn sub_task_phase(&self, index: usize) -> Result<JobPhase> {
        JobPhase::from_code(self.detailed_phases.get(index)?)
    }

    /// Records the job phase for an execution index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] for an out-of-range index.
    pub fn set_sub_task_phase(&mut self, index: usize, phase: JobPhase) -> Result<()> {
        self.detailed_phases.set(index, phase.as_code())?;
        Ok(())
    }

    /// Moves to `target`, rejecting any regression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the move is not allowed.
    pub fn transition_to(&mut self, target: Phase) -> Result<()> {
        if !self.current_phase.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.current_phase.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid targets: {:?}",
                    self.current_phase.valid_transitions()
                ),
            });
        }
        self.current_phase = target;
        Ok(())
    }

    /// Moves to [`Phase::Failure`] with an explanation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] from a terminal phase.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition_to(Phase::Failure)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// Checks the structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptedPluginState`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let n = self.execution_array_size;
        if self.detailed_phases.len() != n
            || self.indexes_to_cache.len() != n
            || self.retry_attempts.len() != n
        {
            return Err(Error::corrupted(format!(
                "per-index arrays do not match execution size {n}: phases={}, cache={}, retries={}",
                self.detailed_phases.len(),
                self.indexes_to_cache.len(),
                self.retry_attempts.len()
            )));
        }
        if self.detailed_phases.bit_width() != JobPhase::BIT_WIDTH {
            return Err(Error::corrupted(format!(
                "phase array width {} is not {}",
                self.detailed_phases.bit_width(),
                JobPhase::BIT_WIDTH
            )));
        }
        if self.original_min_successes > self.original_array_size {
            return Err(Error::corrupted(format!(
                "min successes {} exceeds array size {}",
                self.original_min_successes, self.original_array_size
            )));
        }
        if self.cached_upstream.len() != self.original_array_size {
            return Err(Error::corrupted(format!(
                "upstream cache width {} does not match array size {}",
                self.cached_upstream.len(),
                self.original_array_size
            )));
        }
        if n + self.cached_upstream.count_ones() != self.original_array_size {
            return Err(Error::corrupted(format!(
                "execution size {n} plus {} cached upstream does not cover array size {}",
                self.cached_upstream.count_ones(),
                self.original_array_size
            )));
        }
        for code in self.detailed_phases.iter() {
            JobPhase::from_code(code)?;
        }
        Ok(())
    }
}
