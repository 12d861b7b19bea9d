//! In-memory batch backend implementation for testing.
//!
//! This module provides [`InMemoryBatchBackend`], a deterministic
//! implementation of the [`BatchBackend`] trait.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: Nothing runs; statuses only change when
//!   a test sets them
//! - **Single-process only**: Jobs are not visible across process boundaries
//!
//! Tests drive it through [`InMemoryBatchBackend::set_child_status`] and
//! friends, script failures with [`InMemoryBatchBackend::fail_next`], and
//! assert on [`InMemoryBatchBackend::call_count`].

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use super::{
    BackendError, BackendOperation, BatchBackend, JobDetail, RemoteJobStatus, SubmitJobRequest,
    child_job_id,
};
use crate::definition::JobDefinitionSpec;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct MemoryChild {
    status: RemoteJobStatus,
    status_reason: Option<String>,
    attempts: u32,
}

#[derive(Debug, Clone)]
struct MemoryJob {
    name: String,
    status: RemoteJobStatus,
    status_reason: Option<String>,
    attempts: u32,
    children: Vec<MemoryChild>,
}

impl MemoryJob {
    fn detail(&self, id: &str) -> JobDetail {
        JobDetail {
            id: id.to_string(),
            name: self.name.clone(),
            status: self.status,
            status_reason: self.status_reason.clone(),
            attempts: self.attempts,
            array_size: (!self.children.is_empty()).then_some(self.children.len()),
        }
    }

    /// Derives the umbrella status from the children, as an array job does.
    fn recompute_status(&mut self) {
        if self.children.is_empty() {
            return;
        }
        let all_done = self.children.iter().all(|c| c.status.is_done());
        let all_succeeded = self
            .children
            .iter()
            .all(|c| c.status == RemoteJobStatus::Succeeded);
        let any_started = self.children.iter().any(|c| {
            matches!(
                c.status,
                RemoteJobStatus::Starting
                    | RemoteJobStatus::Running
                    | RemoteJobStatus::Succeeded
                    | RemoteJobStatus::Failed
            )
        });

        self.status = if all_succeeded {
            RemoteJobStatus::Succeeded
        } else if all_done {
            RemoteJobStatus::Failed
        } else if any_started {
            RemoteJobStatus::Running
        } else {
            self.status
        };
    }
}

#[derive(Debug, Default)]
struct BackendState {
    definitions: HashMap<String, (JobDefinitionSpec, bool)>,
    revisions: HashMap<String, u32>,
    jobs: HashMap<String, MemoryJob>,
    submissions: Vec<SubmitJobRequest>,
    cancelled: Vec<String>,
    failures: HashMap<BackendOperation, VecDeque<BackendError>>,
    calls: HashMap<BackendOperation, usize>,
}

impl BackendState {
    /// Counts the call and pops a scripted failure, if any.
    fn begin(&mut self, op: BackendOperation) -> std::result::Result<(), BackendError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("batch backend lock poisoned")
}

fn poison_backend<T>(_: PoisonError<T>) -> BackendError {
    BackendError::Unavailable {
        message: "batch backend lock poisoned".into(),
    }
}

/// In-memory batch backend for testing.
#[derive(Debug, Default)]
pub struct InMemoryBatchBackend {
    state: RwLock<BackendState>,
    latency: Option<Duration>,
}

impl InMemoryBatchBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that sleeps for `latency` before serving each call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: RwLock::new(BackendState::default()),
            latency: Some(latency),
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Returns how many times `op` was called, including failed calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn call_count(&self, op: BackendOperation) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.calls.get(&op).copied().unwrap_or_default())
    }

    /// Makes the next call to `op` fail with `err`.
    ///
    /// Repeated calls queue further failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next(&self, op: BackendOperation, err: BackendError) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.failures.entry(op).or_default().push_back(err);
        Ok(())
    }

    /// Returns every accepted submission in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn submissions(&self) -> Result<Vec<SubmitJobRequest>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.submissions.clone())
    }

    /// Returns the ids of cancelled jobs in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn cancelled(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.cancelled.clone())
    }

    /// Returns the id of the most recently submitted job with `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_id_by_name(&self, name: &str) -> Result<Option<String>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut matches: Vec<&String> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.name == name)
            .map(|(id, _)| id)
            .collect();
        matches.sort();
        Ok(matches.last().map(|id| (*id).clone()))
    }

    /// Overrides the status of a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist or the lock is poisoned.
    pub fn set_job_status(&self, job_id: &str, status: RemoteJobStatus) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::RemoteJobNotFound {
                job_id: job_id.to_string(),
            })?;
        job.status = status;
        Ok(())
    }

    /// Sets the status and failed attempts of child `index` of `job_id`.
    ///
    /// The umbrella status is recomputed from the children.
    ///
    /// # Errors
    ///
    /// Returns an error if the job or child does not exist or the lock is
    /// poisoned.
    pub fn set_child_status(
        &self,
        job_id: &str,
        index: usize,
        status: RemoteJobStatus,
        attempts: u32,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::RemoteJobNotFound {
                job_id: job_id.to_string(),
            })?;
        let child = job
            .children
            .get_mut(index)
            .ok_or_else(|| Error::RemoteJobNotFound {
                job_id: child_job_id(job_id, index),
            })?;
        child.status = status;
        child.attempts = attempts;
        job.recompute_status();
        Ok(())
    }

    /// Marks a registered definition inactive so submissions using it fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn deactivate_definition(&self, handle: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some((_, active)) = state.definitions.get_mut(handle) {
            *active = false;
        }
        Ok(())
    }

    /// Forgets a job entirely, as if the backend had expired it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn forget_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.jobs.remove(job_id);
        Ok(())
    }
}

#[async_trait]
impl BatchBackend for InMemoryBatchBackend {
    async fn register_job_definition(
        &self,
        name: &str,
        spec: &JobDefinitionSpec,
    ) -> std::result::Result<String, BackendError> {
        self.simulate_latency().await;
        let mut state = self.state.write().map_err(poison_backend)?;
        state.begin(BackendOperation::RegisterJobDefinition)?;

        let revision = state.revisions.entry(name.to_string()).or_default();
        *revision += 1;
        let handle = format!("{name}:{revision}");
        state
            .definitions
            .insert(handle.clone(), (spec.clone(), true));
        drop(state);
        Ok(handle)
    }

    async fn submit_job(
        &self,
        request: &SubmitJobRequest,
    ) -> std::result::Result<String, BackendError> {
        self.simulate_latency().await;
        let mut state = self.state.write().map_err(poison_backend)?;
        state.begin(BackendOperation::SubmitJob)?;

        match state.definitions.get(&request.definition_handle) {
            Some((_, true)) => {}
            _ => {
                return Err(BackendError::InvalidDefinition {
                    handle: request.definition_handle.clone(),
                    message: "job definition is not active".into(),
                });
            }
        }

        let job_id = Ulid::new().to_string();
        let children = (0..request.array_size)
            .map(|_| MemoryChild {
                status: RemoteJobStatus::Submitted,
                status_reason: None,
                attempts: 0,
            })
            .collect();
        state.jobs.insert(
            job_id.clone(),
            MemoryJob {
                name: request.name.clone(),
                status: RemoteJobStatus::Submitted,
                status_reason: None,
                attempts: 0,
                children,
            },
        );
        state.submissions.push(request.clone());
        drop(state);
        Ok(job_id)
    }

    async fn describe_jobs(
        &self,
        job_ids: &[String],
    ) -> std::result::Result<Vec<JobDetail>, BackendError> {
        self.simulate_latency().await;
        let mut state = self.state.write().map_err(poison_backend)?;
        state.begin(BackendOperation::DescribeJobs)?;

        let mut details = Vec::with_capacity(job_ids.len());
        for id in job_ids {
            if let Some(job) = state.jobs.get(id) {
                details.push(job.detail(id));
                continue;
            }
            let Some((parent_id, index)) = id.rsplit_once(':') else {
                continue;
            };
            let Ok(index) = index.parse::<usize>() else {
                continue;
            };
            if let Some((parent, child)) = state
                .jobs
                .get(parent_id)
                .and_then(|p| p.children.get(index).map(|c| (p, c)))
            {
                details.push(JobDetail {
                    id: id.clone(),
                    name: format!("{}:{index}", parent.name),
                    status: child.status,
                    status_reason: child.status_reason.clone(),
                    attempts: child.attempts,
                    array_size: None,
                });
            }
        }
        drop(state);
        Ok(details)
    }

    async fn cancel_job(
        &self,
        job_id: &str,
        reason: &str,
    ) -> std::result::Result<(), BackendError> {
        self.simulate_latency().await;
        let mut state = self.state.write().map_err(poison_backend)?;
        state.begin(BackendOperation::CancelJob)?;

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound {
                job_id: job_id.to_string(),
            })?;
        for child in job.children.iter_mut().filter(|c| !c.status.is_done()) {
            child.status = RemoteJobStatus::Failed;
            child.status_reason = Some(reason.to_string());
        }
        if !job.status.is_done() {
            job.status = RemoteJobStatus::Failed;
            job.status_reason = Some(reason.to_string());
        }
        state.cancelled.push(job_id.to_string());
        drop(state);
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> JobDefinitionSpec {
        JobDefinitionSpec {
            image: "registry.example.com/worker:1.2".into(),
            vcpus: 2,
            memory_mib: 4096,
            command: vec!["run".into()],
            environment: BTreeMap::new(),
        }
    }

    fn request(handle: &str, array_size: usize) -> SubmitJobRequest {
        SubmitJobRequest {
            name: "task-a".into(),
            definition_handle: handle.into(),
            array_size,
            queue: "default".into(),
            role: String::new(),
            retry_attempts: 3,
            environment: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn submit_creates_children() -> Result<()> {
        let backend = InMemoryBatchBackend::new();
        let handle = backend
            .register_job_definition("def", &spec())
            .await
            .expect("register");
        assert_eq!(handle, "def:1");

        let job_id = backend
            .submit_job(&request(&handle, 3))
            .await
            .expect("submit");
        let details = backend
            .describe_jobs(&[job_id.clone(), child_job_id(&job_id, 2), "nope".into()])
            .await
            .expect("describe");

        assert_eq!(details.len(), 2);
        assert_eq!(details[0].array_size, Some(3));
        assert_eq!(details[1].id, child_job_id(&job_id, 2));
        assert_eq!(backend.call_count(BackendOperation::DescribeJobs)?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn umbrella_status_follows_children() -> Result<()> {
        let backend = InMemoryBatchBackend::new();
        let handle = backend
            .register_job_definition("def", &spec())
            .await
            .expect("register");
        let job_id = backend
            .submit_job(&request(&handle, 2))
            .await
            .expect("submit");

        backend.set_child_status(&job_id, 0, RemoteJobStatus::Running, 0)?;
        let details = backend.describe_jobs(&[job_id.clone()]).await.expect("describe");
        assert_eq!(details[0].status, RemoteJobStatus::Running);

        backend.set_child_status(&job_id, 0, RemoteJobStatus::Succeeded, 0)?;
        backend.set_child_status(&job_id, 1, RemoteJobStatus::Failed, 3)?;
        let details = backend.describe_jobs(&[job_id]).await.expect("describe");
        assert_eq!(details[0].status, RemoteJobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn inactive_definition_is_rejected() -> Result<()> {
        let backend = InMemoryBatchBackend::new();
        let handle = backend
            .register_job_definition("def", &spec())
            .await
            .expect("register");
        backend.deactivate_definition(&handle)?;

        let err = backend
            .submit_job(&request(&handle, 1))
            .await
            .expect_err("inactive definition");
        assert!(matches!(err, BackendError::InvalidDefinition { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() -> Result<()> {
        let backend = InMemoryBatchBackend::new();
        backend.fail_next(
            BackendOperation::DescribeJobs,
            BackendError::Throttled {
                message: "slow down".into(),
            },
        )?;

        assert!(backend.describe_jobs(&[]).await.is_err());
        assert!(backend.describe_jobs(&[]).await.is_ok());
        assert_eq!(backend.call_count(BackendOperation::DescribeJobs)?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_fails_unfinished_children() -> Result<()> {
        let backend = InMemoryBatchBackend::new();
        let handle = backend
            .register_job_definition("def", &spec())
            .await
            .expect("register");
        let job_id = backend
            .submit_job(&request(&handle, 2))
            .await
            .expect("submit");
        backend.set_child_status(&job_id, 0, RemoteJobStatus::Succeeded, 0)?;

        backend.cancel_job(&job_id, "aborted").await.expect("cancel");
        let details = backend
            .describe_jobs(&[child_job_id(&job_id, 0), child_job_id(&job_id, 1)])
            .await
            .expect("describe");
        assert_eq!(details[0].status, RemoteJobStatus::Succeeded);
        assert_eq!(details[1].status, RemoteJobStatus::Failed);
        assert_eq!(backend.cancelled()?, vec![job_id]);

        let missing = backend.cancel_job("missing", "aborted").await;
        assert!(matches!(missing, Err(BackendError::NotFound { .. })));
        Ok(())
    }
}
