//! Cached snapshots of remote umbrella jobs.
//!
//! A [`Job`] is an immutable snapshot: the job store replaces the whole
//! snapshot on every update and readers hold an `Arc` to whichever version
//! they fetched. Sub-jobs are stored by index in a plain vector; nothing
//! points back at its parent.

use serde::{Deserialize, Serialize};

use crate::backend::{JobDetail, RemoteJobStatus};
use crate::phase::JobPhase;

/// Identifies the task instance that owns a job.
///
/// Passed back to the host when the job changes so it can re-enqueue the
/// owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Namespace of the owning task instance.
    pub namespace: String,
    /// Name of the owning task instance.
    pub name: String,
}

impl OwnerReference {
    /// Creates an owner reference.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for OwnerReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Status of a job or sub-job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Current phase.
    pub phase: JobPhase,
    /// Backend explanation, if any.
    pub message: Option<String>,
    /// Failed attempts so far.
    pub attempts: u32,
}

impl JobStatus {
    /// Creates a status with no message and no attempts.
    #[must_use]
    pub const fn new(phase: JobPhase) -> Self {
        Self {
            phase,
            message: None,
            attempts: 0,
        }
    }

    /// Converts a backend status report.
    #[must_use]
    pub fn from_detail(detail: &JobDetail) -> Self {
        Self {
            phase: job_phase_from_remote(detail.status),
            message: detail.status_reason.clone(),
            attempts: detail.attempts,
        }
    }
}

/// Maps the backend status vocabulary onto [`JobPhase`].
///
/// A failed attempt is reported as retryable; the monitor decides when it
/// becomes permanent.
#[must_use]
pub const fn job_phase_from_remote(status: RemoteJobStatus) -> JobPhase {
    match status {
        RemoteJobStatus::Submitted => JobPhase::Queued,
        RemoteJobStatus::Pending => JobPhase::NotReady,
        RemoteJobStatus::Runnable => JobPhase::WaitingForResources,
        RemoteJobStatus::Starting => JobPhase::Initializing,
        RemoteJobStatus::Running => JobPhase::Running,
        RemoteJobStatus::Succeeded => JobPhase::Success,
        RemoteJobStatus::Failed => JobPhase::RetryableFailure,
    }
}

/// One child of an umbrella job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubJob {
    /// Remote id, once the backend has assigned one.
    pub id: Option<String>,
    /// Latest known status.
    pub status: JobStatus,
}

/// Snapshot of a remote umbrella job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Remote job id.
    pub id: String,
    /// Task instance that owns the job.
    pub owner: Option<OwnerReference>,
    /// Latest known umbrella status.
    pub status: JobStatus,
    /// Children indexed by execution index. Empty for non-array jobs or
    /// before the first describe.
    pub sub_jobs: Vec<SubJob>,
}

impl Job {
    /// Creates a snapshot with no sub-jobs.
    #[must_use]
    pub fn new(id: impl Into<String>, phase: JobPhase) -> Self {
        Self {
            id: id.into(),
            owner: None,
            status: JobStatus::new(phase),
            sub_jobs: Vec::new(),
        }
    }

    /// Creates a freshly submitted array job with `size` queued children.
    #[must_use]
    pub fn submitted(id: impl Into<String>, owner: OwnerReference, size: usize) -> Self {
        let id = id.into();
        let sub_jobs = (0..size)
            .map(|i| SubJob {
                id: Some(crate::backend::child_job_id(&id, i)),
                status: JobStatus::new(JobPhase::Queued),
            })
            .collect();
        Self {
            id,
            owner: Some(owner),
            status: JobStatus::new(JobPhase::Queued),
            sub_jobs,
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Sets the children.
    #[must_use]
    pub fn with_sub_jobs(mut self, sub_jobs: Vec<SubJob>) -> Self {
        self.sub_jobs = sub_jobs;
        self
    }

    /// Returns true if neither the umbrella nor any child can still change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
            && self.sub_jobs.iter().all(|s| s.status.phase.is_terminal())
    }

    /// Returns true if the umbrella job has finished on the backend.
    ///
    /// Unlike [`Job::is_terminal`], a failed umbrella counts as finished: the
    /// backend will not retry it.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        finished(self.status.phase)
    }

    /// Returns true once the umbrella and every child have finished, so no
    /// later describe can change the snapshot.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.is_finished() && self.sub_jobs.iter().all(|s| finished(s.status.phase))
    }
}

const fn finished(phase: JobPhase) -> bool {
    matches!(
        phase,
        JobPhase::Success | JobPhase::RetryableFailure | JobPhase::PermanentFailure
    )
}
