//! Remote batch backend abstraction.
//!
//! This module provides:
//!
//! - [`BatchBackend`]: Trait for the remote service that runs array jobs
//! - [`SubmitJobRequest`] / [`JobDetail`]: Request and status payloads
//! - [`BackendError`]: Failures reported by a backend
//! - [`memory::InMemoryBatchBackend`]: Deterministic backend for testing
//!
//! Backends are called through [`crate::client::BatchClient`], which adds
//! rate limiting, deadlines and error mapping. Implementations do not need to
//! do any of that themselves.
//!
//! ## Array Jobs
//!
//! A submission with `array_size = n` creates one umbrella job and `n` child
//! jobs. Child `i` of job `J` has the id `"J:i"` (see [`child_job_id`]) and can
//! be described like any other job.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::definition::JobDefinitionSpec;

/// Remote backend operations, used for metrics and scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    /// Register a job definition.
    RegisterJobDefinition,
    /// Submit a job.
    SubmitJob,
    /// Describe jobs.
    DescribeJobs,
    /// Cancel a job.
    CancelJob,
}

impl BackendOperation {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::RegisterJobDefinition => "register_job_definition",
            Self::SubmitJob => "submit_job",
            Self::DescribeJobs => "describe_jobs",
            Self::CancelJob => "cancel_job",
        }
    }

    /// Returns true for read-only operations, which use the `get` limiter.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        matches!(self, Self::DescribeJobs)
    }
}

impl std::fmt::Display for BackendOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Errors reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend asked the caller to slow down.
    #[error("throttled: {message}")]
    Throttled {
        /// Backend message.
        message: String,
    },

    /// A referenced job does not exist.
    #[error("job not found: {job_id}")]
    NotFound {
        /// The missing job.
        job_id: String,
    },

    /// A job definition handle is unknown or inactive.
    #[error("invalid job definition {handle}: {message}")]
    InvalidDefinition {
        /// The rejected handle.
        handle: String,
        /// Backend message.
        message: String,
    },

    /// The backend could not be reached or failed internally.
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Backend message.
        message: String,
    },

    /// The backend refused the request as malformed.
    #[error("request rejected: {message}")]
    Rejected {
        /// Backend message.
        message: String,
    },
}

/// Status vocabulary of the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteJobStatus {
    /// Accepted, not yet evaluated.
    Submitted,
    /// Waiting on dependencies.
    Pending,
    /// Ready to run, waiting for capacity.
    Runnable,
    /// Placed on compute, starting.
    Starting,
    /// Executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed on its latest attempt.
    Failed,
}

impl RemoteJobStatus {
    /// Returns true once the backend will not change the status again.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A submission of one umbrella job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Locally generated job name, unique per task instance.
    pub name: String,
    /// Registered job definition handle.
    pub definition_handle: String,
    /// Number of child jobs; zero submits a single non-array job.
    pub array_size: usize,
    /// Queue that receives the job.
    pub queue: String,
    /// Role attached to the job.
    pub role: String,
    /// Attempts the backend may make per child before reporting failure.
    pub retry_attempts: u32,
    /// Extra environment passed to every child.
    pub environment: BTreeMap<String, String>,
}

/// Backend status of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetail {
    /// Remote job id.
    pub id: String,
    /// Job name given at submission.
    pub name: String,
    /// Current status.
    pub status: RemoteJobStatus,
    /// Backend explanation for the status, if any.
    pub status_reason: Option<String>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Number of children, for array jobs.
    pub array_size: Option<usize>,
}

/// Returns the id of child `index` of array job `parent_id`.
#[must_use]
pub fn child_job_id(parent_id: &str, index: usize) -> String {
    format!("{parent_id}:{index}")
}

/// Remote service that runs array jobs.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so one backend can serve every task
/// instance and the background resync loop concurrently.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Registers a job definition and returns its handle.
    async fn register_job_definition(
        &self,
        name: &str,
        spec: &JobDefinitionSpec,
    ) -> Result<String, BackendError>;

    /// Submits an umbrella job and returns its id.
    async fn submit_job(&self, request: &SubmitJobRequest) -> Result<String, BackendError>;

    /// Describes the given jobs.
    ///
    /// Unknown ids are omitted from the result rather than reported as errors.
    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDetail>, BackendError>;

    /// Cancels a job and all of its children.
    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<(), BackendError>;

    /// Returns a short name for logs.
    fn backend_name(&self) -> &str;
}
