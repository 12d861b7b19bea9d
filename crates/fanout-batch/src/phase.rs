//! Phases for array tasks, remote jobs and the host-facing task status.
//!
//! Three separate enums are in play:
//!
//! - [`Phase`]: where the reconciliation state machine is for one array task
//! - [`JobPhase`]: the lifecycle of one remote job or sub-job, stored per index
//!   in the compact phase array
//! - [`TaskPhase`]: the coarse status reported back to the host
//!
//! ```text
//! START ──► PRE_LAUNCH ──► LAUNCH ──► CHECKING_SUBTASK_EXECUTIONS ──► WRITE_TO_DISCOVERY
//!   │                                         │                             │
//!   │ every index cached upstream             │ threshold unreachable       │
//!   ▼                                         ▼                             ▼
//! SUCCESS                                  FAILURE                  SUCCESS | FAILURE
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reconciliation phase of an array task.
///
/// Codes are persisted; never renumber an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// First pass: determine which indexes are already cached upstream.
    Start,
    /// Resolve or register the remote job definition.
    PreLaunch,
    /// Submit the umbrella job.
    Launch,
    /// Fold remote sub-job status into the compact arrays.
    CheckingSubTaskExecutions,
    /// Write cache-eligible outputs.
    WriteToDiscovery,
    /// The array task met its success threshold.
    Success,
    /// The array task cannot meet its success threshold.
    Failure,
}

impl Phase {
    /// Returns the persisted code for this phase.
    #[must_use]
    pub const fn as_code(&self) -> u8 {
        match self {
            Self::Start => 0,
            Self::PreLaunch => 1,
            Self::Launch => 2,
            Self::CheckingSubTaskExecutions => 3,
            Self::WriteToDiscovery => 4,
            Self::Success => 5,
            Self::Failure => 6,
        }
    }

    /// Parses a persisted phase code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptedPluginState`] for an unknown code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Start),
            1 => Ok(Self::PreLaunch),
            2 => Ok(Self::Launch),
            3 => Ok(Self::CheckingSubTaskExecutions),
            4 => Ok(Self::WriteToDiscovery),
            5 => Ok(Self::Success),
            6 => Ok(Self::Failure),
            other => Err(Error::corrupted(format!("unknown phase code {other}"))),
        }
    }

    /// Returns true if this is a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Phases only move forward. Success may be reached from Start when every
    /// index is already cached, and Failure from any non-terminal phase.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Start => matches!(target, Self::PreLaunch | Self::Success | Self::Failure),
            Self::PreLaunch => matches!(target, Self::Launch | Self::Failure),
            Self::Launch => matches!(target, Self::CheckingSubTaskExecutions | Self::Failure),
            Self::CheckingSubTaskExecutions => {
                matches!(target, Self::WriteToDiscovery | Self::Failure)
            }
            Self::WriteToDiscovery => matches!(target, Self::Success | Self::Failure),
            Self::Success | Self::Failure => false,
        }
    }

    /// Returns all valid target phases from the current phase.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Start => vec![Self::PreLaunch, Self::Success, Self::Failure],
            Self::PreLaunch => vec![Self::Launch, Self::Failure],
            Self::Launch => vec![Self::CheckingSubTaskExecutions, Self::Failure],
            Self::CheckingSubTaskExecutions => vec![Self::WriteToDiscovery, Self::Failure],
            Self::WriteToDiscovery => vec![Self::Success, Self::Failure],
            Self::Success | Self::Failure => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PreLaunch => "pre_launch",
            Self::Launch => "launch",
            Self::CheckingSubTaskExecutions => "checking_subtask_executions",
            Self::WriteToDiscovery => "write_to_discovery",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self::Start
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Lifecycle phase of a remote job or a single sub-task index.
///
/// Stored per index in a [`fanout_core::CompactArray`] of
/// [`JobPhase::BIT_WIDTH`] bits; codes are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    /// No status is known yet.
    Undefined,
    /// Waiting on dependencies inside the backend.
    NotReady,
    /// Waiting for compute capacity.
    WaitingForResources,
    /// Accepted by the backend, waiting to be scheduled.
    Queued,
    /// Scheduled and starting up.
    Initializing,
    /// Executing.
    Running,
    /// Completed successfully.
    Success,
    /// Failed; a retry may still succeed.
    RetryableFailure,
    /// Failed with no further retries.
    PermanentFailure,
}

impl JobPhase {
    /// Bits needed to store any job phase code.
    pub const BIT_WIDTH: u8 = fanout_core::required_bit_width(Self::MAX_CODE);

    /// The largest phase code.
    pub const MAX_CODE: u64 = 8;

    /// All phases in code order.
    pub const ALL: [Self; 9] = [
        Self::Undefined,
        Self::NotReady,
        Self::WaitingForResources,
        Self::Queued,
        Self::Initializing,
        Self::Running,
        Self::Success,
        Self::RetryableFailure,
        Self::PermanentFailure,
    ];

    /// Returns the compact code for this phase.
    #[must_use]
    pub const fn as_code(&self) -> u64 {
        match self {
            Self::Undefined => 0,
            Self::NotReady => 1,
            Self::WaitingForResources => 2,
            Self::Queued => 3,
            Self::Initializing => 4,
            Self::Running => 5,
            Self::Success => 6,
            Self::RetryableFailure => 7,
            Self::PermanentFailure => 8,
        }
    }

    /// Parses a compact phase code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptedPluginState`] for an unknown code.
    pub fn from_code(code: u64) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| Error::corrupted(format!("unknown job phase code {code}")))
    }

    /// Returns true if no further status change is expected.
    ///
    /// A retryable failure is not terminal: the backend may still retry it.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::PermanentFailure)
    }

    /// Returns true for a successful terminal phase.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true for any failure phase.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::RetryableFailure | Self::PermanentFailure)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::NotReady => "not_ready",
            Self::WaitingForResources => "waiting_for_resources",
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl Default for JobPhase {
    fn default() -> Self {
        Self::Undefined
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Task-level phase reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    /// Preparing to launch.
    Initializing,
    /// Submitted, no sub-task has reported progress yet.
    Queued,
    /// Sub-tasks are executing.
    Running,
    /// The task completed successfully.
    Success,
    /// The task failed and will not be retried by this core.
    PermanentFailure,
}

impl TaskPhase {
    /// Returns true if this is a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::PermanentFailure)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Task-level phase plus the detail the host displays with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPhaseInfo {
    /// The reported phase.
    pub phase: TaskPhase,
    /// Monotonic progress counter within the phase.
    ///
    /// The host treats a higher version in the same phase as new information.
    pub version: u32,
    /// Human-readable explanation, set on failure.
    pub reason: Option<String>,
    /// When this status was computed.
    pub occurred_at: DateTime<Utc>,
}

impl TaskPhaseInfo {
    /// Creates phase info stamped with the current time.
    #[must_use]
    pub fn new(phase: TaskPhase, version: u32) -> Self {
        Self {
            phase,
            version,
            reason: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attaches a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Task-level status to report.
    pub info: TaskPhaseInfo,
    /// Hint that the host should invoke the driver again soon, set when the
    /// pass advanced the reconciliation phase.
    pub retry_sooner: bool,
}
