//! The reconciliation driver for array tasks.
//!
//! The host calls [`ArrayTaskExecutor::handle`] repeatedly for every array
//! task instance. Each call:
//!
//! 1. Reads the persisted state (a fresh state on the first pass)
//! 2. Runs exactly one phase handler
//! 3. Persists the resulting state, even when the handler failed
//! 4. Reports the task-level phase derived from the persisted state
//!
//! Nothing survives between calls except the persisted blob and the shared
//! caches, so a pass that fails halfway is simply retried by the host.
//!
//! ```text
//! Start ─► PreLaunch ─► Launch ─► CheckingSubTaskExecutions ─► WriteToDiscovery ─► Success
//!   │                                                                          └─► Failure
//!   └─► Success (everything cached upstream)
//! ```

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

use fanout_core::observability::array_task_span;

use crate::aggregate::map_state_to_phase_info;
use crate::backend::BatchBackend;
use crate::client::BatchClient;
use crate::codec::{PersistedPluginState, decode_state, encode_state};
use crate::config::BatchConfig;
use crate::definition::{JobDefinitionCache, JobDefinitionSpec};
use crate::discovery::{Catalog, determine_discoverability, write_to_discovery};
use crate::error::{Error, Result};
use crate::job::OwnerReference;
use crate::job_store::{EnqueueOwner, JobStore, ResyncHandle, spawn_event_forwarder};
use crate::launch::{ensure_job_definition, launch_sub_tasks};
use crate::metrics::BatchMetrics;
use crate::monitor::check_sub_tasks_state;
use crate::phase::{Phase, Transition};
use crate::registry::TaskExecutor;
use crate::state::ArrayTaskState;

/// Identifier under which the array executor registers.
pub const EXECUTOR_ID: &str = "batch_array";

/// Task type handled by the array executor.
pub const ARRAY_TASK_TYPE: &str = "container_array";

const ABORT_REASON: &str = "task aborted";

/// Requested fan-out and success threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayJobSpec {
    /// Number of sub-tasks.
    pub size: usize,
    /// Absolute success threshold. Takes precedence over the ratio.
    pub min_successes: Option<usize>,
    /// Fraction of `size` that must succeed, in `0.0..=1.0`.
    pub min_success_ratio: Option<f64>,
}

impl ArrayJobSpec {
    /// Creates a spec requiring every sub-task to succeed.
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            min_successes: None,
            min_success_ratio: None,
        }
    }

    /// Sets an absolute success threshold.
    #[must_use]
    pub const fn with_min_successes(mut self, min_successes: usize) -> Self {
        self.min_successes = Some(min_successes);
        self
    }

    /// Sets a success ratio.
    #[must_use]
    pub fn with_min_success_ratio(mut self, ratio: f64) -> Self {
        self.min_success_ratio = Some(ratio);
        self
    }

    /// Returns the number of successes required.
    ///
    /// A ratio rounds up, so `0.5` of 3 requires 2.
    ///
    /// # Errors
    ///
    /// Returns an error if the threshold exceeds the size or the ratio is
    /// outside `0.0..=1.0`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn resolve_min_successes(&self) -> Result<usize> {
        match (self.min_successes, self.min_success_ratio) {
            (Some(min), _) if min > self.size => Err(fanout_core::Error::InvalidInput(format!(
                "min successes {min} exceeds array size {}",
                self.size
            ))
            .into()),
            (Some(min), _) => Ok(min),
            (None, Some(ratio)) if !(0.0..=1.0).contains(&ratio) => Err(
                fanout_core::Error::InvalidInput(format!(
                    "min success ratio {ratio} is outside 0..=1"
                ))
                    .into(),
            ),
            // Non-negative and at most `size` after the range check.
            (None, Some(ratio)) => Ok(((ratio * self.size as f64).ceil() as usize).min(self.size)),
            (None, None) => Ok(self.size),
        }
    }
}

/// Everything the host knows about one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionMetadata {
    /// Task instance to re-enqueue when its job changes.
    pub owner: OwnerReference,
    /// Unique, stable name for this task instance's remote job.
    pub generated_name: String,
    /// Fan-out and threshold.
    pub array_spec: ArrayJobSpec,
    /// Container shape of every sub-task.
    pub definition: JobDefinitionSpec,
    /// Where sub-task outputs are written; index `i` writes to
    /// `{output_prefix}/{i}`.
    pub output_prefix: String,
    /// Catalog key for reusable outputs. `None` disables caching.
    pub cache_key: Option<String>,
}

/// Reads the persisted state blob for a task instance.
#[async_trait]
pub trait PluginStateReader: Send + Sync {
    /// Returns the stored blob, or `None` on the first pass.
    async fn get(&self) -> Result<Option<PersistedPluginState>>;
}

/// Persists the state blob for a task instance.
#[async_trait]
pub trait PluginStateWriter: Send + Sync {
    /// Replaces the stored blob.
    async fn put(&self, state: PersistedPluginState) -> Result<()>;
}

/// Host-provided view of one task instance.
pub trait TaskExecutionContext: Send + Sync {
    /// Task metadata.
    fn metadata(&self) -> &TaskExecutionMetadata;
    /// Reader for the persisted state.
    fn state_reader(&self) -> &dyn PluginStateReader;
    /// Writer for the persisted state.
    fn state_writer(&self) -> &dyn PluginStateWriter;
}

/// Background work started by [`ArrayTaskExecutor::build`].
#[derive(Debug)]
pub struct BackgroundTasks {
    resync: ResyncHandle,
    forwarder: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Stops the resync loop and the event forwarder.
    pub async fn shutdown(self) {
        self.resync.shutdown().await;
        self.forwarder.abort();
        if let Err(err) = self.forwarder.await {
            if !err.is_cancelled() {
                warn!(error = %err, "event forwarder ended abnormally");
            }
        }
    }
}

/// Drives array tasks through their phases against a remote batch backend.
pub struct ArrayTaskExecutor {
    config: BatchConfig,
    job_store: Arc<JobStore>,
    definitions: Arc<JobDefinitionCache>,
    catalog: Arc<dyn Catalog>,
    metrics: BatchMetrics,
}

impl std::fmt::Debug for ArrayTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayTaskExecutor")
            .field("config", &self.config)
            .field("job_store", &self.job_store)
            .field("definitions", &self.definitions)
            .field("catalog", &"<Catalog>")
            .finish_non_exhaustive()
    }
}

impl ArrayTaskExecutor {
    /// Creates an executor from already constructed collaborators.
    #[must_use]
    pub fn new(
        config: BatchConfig,
        job_store: Arc<JobStore>,
        definitions: Arc<JobDefinitionCache>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            config,
            job_store,
            definitions,
            catalog,
            metrics: BatchMetrics::new(),
        }
    }

    /// Wires an executor and starts its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn build(
        config: BatchConfig,
        backend: Arc<dyn BatchBackend>,
        catalog: Arc<dyn Catalog>,
        enqueue: Arc<dyn EnqueueOwner>,
    ) -> Result<(Self, BackgroundTasks)> {
        config.validate()?;
        let client = Arc::new(BatchClient::new(backend, &config)?);
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let job_store = Arc::new(JobStore::new(client, &config, events_tx));

        let resync = job_store.spawn_resync(config.resync_period);
        let forwarder = spawn_event_forwarder(events_rx, enqueue);
        info!(
            resync_period_ms = config.resync_period.as_millis(),
            "array task executor started"
        );

        let executor = Self::new(
            config,
            job_store,
            Arc::new(JobDefinitionCache::new()),
            catalog,
        );
        Ok((executor, BackgroundTasks { resync, forwarder }))
    }

    /// Returns the shared job store.
    #[must_use]
    pub fn job_store(&self) -> &Arc<JobStore> {
        &self.job_store
    }

    /// Returns the shared job definition cache.
    #[must_use]
    pub fn definitions(&self) -> &Arc<JobDefinitionCache> {
        &self.definitions
    }

    async fn read_state(&self, ctx: &dyn TaskExecutionContext) -> Result<Option<ArrayTaskState>> {
        let persisted = ctx.state_reader().get().await.map_err(|e| match e {
            e @ Error::CorruptedPluginState { .. } => e,
            e => Error::corrupted(format!("failed to read plugin state: {e}")),
        })?;
        persisted.as_ref().map(decode_state).transpose()
    }

    async fn load_state(&self, ctx: &dyn TaskExecutionContext) -> Result<ArrayTaskState> {
        if let Some(state) = self.read_state(ctx).await? {
            return Ok(state);
        }
        let spec = &ctx.metadata().array_spec;
        ArrayTaskState::new(spec.size, spec.resolve_min_successes()?)
    }

    async fn dispatch(
        &self,
        state: &mut ArrayTaskState,
        metadata: &TaskExecutionMetadata,
        deadline: Instant,
    ) -> Result<()> {
        match state.current_phase {
            Phase::Start => {
                determine_discoverability(
                    state,
                    self.catalog.as_ref(),
                    metadata.cache_key.as_deref(),
                    self.config.max_retries,
                )
                .await
            }
            Phase::PreLaunch => {
                ensure_job_definition(
                    state,
                    &self.definitions,
                    self.job_store.client(),
                    &metadata.definition,
                    deadline,
                )
                .await
            }
            Phase::Launch => {
                launch_sub_tasks(
                    state,
                    &self.job_store,
                    &self.definitions,
                    metadata,
                    &self.config,
                    deadline,
                )
                .await
            }
            Phase::CheckingSubTaskExecutions => {
                check_sub_tasks_state(state, &self.job_store, metadata, &self.config, deadline)
                    .await
            }
            Phase::WriteToDiscovery => {
                write_to_discovery(
                    state,
                    self.catalog.as_ref(),
                    metadata.cache_key.as_deref(),
                    &metadata.output_prefix,
                )
                .await
            }
            Phase::Success | Phase::Failure => Ok(()),
        }
    }

    async fn persist(&self, ctx: &dyn TaskExecutionContext, state: &ArrayTaskState) -> Result<()> {
        ctx.state_writer().put(encode_state(state)?).await
    }

    /// Runs one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptedPluginState`] if the stored state cannot be
    /// decoded, otherwise the phase handler's error after the partial state
    /// has been persisted.
    pub async fn handle(&self, ctx: &dyn TaskExecutionContext) -> Result<Transition> {
        let metadata = ctx.metadata();
        let mut state = self.load_state(ctx).await?;
        let from = state.current_phase;
        let span = array_task_span("handle", &metadata.generated_name, from.as_label());

        async {
            self.metrics.record_pass(from.as_label());
            let deadline = Instant::now() + self.config.call_timeout;
            let outcome = self.dispatch(&mut state, metadata, deadline).await;

            let persisted = self.persist(ctx, &state).await;
            if let Err(err) = outcome {
                if let Err(persist_err) = persisted {
                    warn!(error = %persist_err, "failed to persist partial progress");
                }
                warn!(error = %err, retryable = err.is_retryable(), "phase handler failed");
                return Err(err);
            }
            persisted?;

            let to = state.current_phase;
            if to != from {
                self.metrics.record_phase_transition(from.as_label(), to.as_label());
                debug!(from = %from, to = %to, "phase advanced");
            }
            Ok::<_, Error>(Transition {
                info: map_state_to_phase_info(&state)?,
                retry_sooner: to != from,
            })
        }
        .instrument(span)
        .await
    }

    /// Cancels the remote job on a best-effort basis and forgets it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job store lock is poisoned.
    pub async fn abort(&self, ctx: &dyn TaskExecutionContext) -> Result<()> {
        let metadata = ctx.metadata();
        let state = match self.read_state(ctx).await {
            Ok(state) => state,
            Err(err) => {
                warn!(task = %metadata.generated_name, error = %err, "abort could not read state");
                None
            }
        };
        if state.as_ref().is_some_and(|s| s.current_phase.is_terminal()) {
            return self.finalize(ctx).await;
        }

        let job_id = match state.and_then(|s| s.external_job_id) {
            Some(id) => Some(id),
            None => self.job_store.get(&metadata.generated_name)?.map(|job| job.id.clone()),
        };
        if let Some(job_id) = job_id {
            let deadline = Instant::now() + self.config.call_timeout;
            match self.job_store.client().cancel_job(&job_id, ABORT_REASON, deadline).await {
                Ok(()) => info!(
                    task = %metadata.generated_name,
                    job_id = %job_id,
                    "cancelled array job"
                ),
                Err(err) => {
                    warn!(
                        task = %metadata.generated_name,
                        job_id = %job_id,
                        error = %err,
                        "failed to cancel array job"
                    );
                }
            }
        }
        self.finalize(ctx).await
    }

    /// Releases cached resources for a retired task instance.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job store lock is poisoned.
    pub async fn finalize(&self, ctx: &dyn TaskExecutionContext) -> Result<()> {
        self.job_store.evict(&ctx.metadata().generated_name)?;
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for ArrayTaskExecutor {
    fn id(&self) -> &str {
        EXECUTOR_ID
    }

    async fn handle(&self, ctx: &dyn TaskExecutionContext) -> Result<Transition> {
        Self::handle(self, ctx).await
    }

    async fn abort(&self, ctx: &dyn TaskExecutionContext) -> Result<()> {
        Self::abort(self, ctx).await
    }

    async fn finalize(&self, ctx: &dyn TaskExecutionContext) -> Result<()> {
        Self::finalize(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_threshold_wins() -> Result<()> {
        let spec = ArrayJobSpec::new(10)
            .with_min_successes(4)
            .with_min_success_ratio(1.0);
        assert_eq!(spec.resolve_min_successes()?, 4);
        Ok(())
    }

    #[test]
    fn ratio_rounds_up() -> Result<()> {
        assert_eq!(ArrayJobSpec::new(3).with_min_success_ratio(0.5).resolve_min_successes()?, 2);
        assert_eq!(ArrayJobSpec::new(10).with_min_success_ratio(0.0).resolve_min_successes()?, 0);
        assert_eq!(ArrayJobSpec::new(7).resolve_min_successes()?, 7);
        Ok(())
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        assert!(ArrayJobSpec::new(3).with_min_successes(4).resolve_min_successes().is_err());
        assert!(ArrayJobSpec::new(3).with_min_success_ratio(1.5).resolve_min_successes().is_err());
        assert!(
            ArrayJobSpec::new(3)
                .with_min_success_ratio(f64::NAN)
                .resolve_min_successes()
                .is_err()
        );
    }
}
