//! Handlers for [`Phase::PreLaunch`] and [`Phase::Launch`].

use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::backend::SubmitJobRequest;
use crate::client::BatchClient;
use crate::config::BatchConfig;
use crate::definition::{JobDefinitionCache, JobDefinitionSpec};
use crate::error::{Error, Result};
use crate::executor::TaskExecutionMetadata;
use crate::job::Job;
use crate::job_store::JobStore;
use crate::phase::Phase;
use crate::state::ArrayTaskState;

/// Environment variable carrying the output prefix to every sub-task.
pub const OUTPUT_PREFIX_ENV: &str = "FANOUT_OUTPUT_PREFIX";

/// Environment variable mapping execution indexes to original indexes.
///
/// Only set when some indexes were satisfied upstream. The value lists the
/// original index of each execution index, comma separated.
pub const INDEX_MAP_ENV: &str = "FANOUT_INDEX_MAP";

/// Resolves the job definition handle, registering it on first use.
///
/// # Errors
///
/// Returns [`Error::DefinitionRegistration`] if registration fails.
pub async fn ensure_job_definition(
    state: &mut ArrayTaskState,
    definitions: &JobDefinitionCache,
    client: &BatchClient,
    spec: &JobDefinitionSpec,
    deadline: Instant,
) -> Result<()> {
    let handle = definitions.get_or_register(client, spec, deadline).await?;
    state.job_definition_handle = Some(handle);
    state.transition_to(Phase::Launch)
}

fn submission_environment(
    state: &ArrayTaskState,
    metadata: &TaskExecutionMetadata,
) -> BTreeMap<String, String> {
    let mut environment = BTreeMap::from([(
        OUTPUT_PREFIX_ENV.to_string(),
        metadata.output_prefix.clone(),
    )]);
    if state.cached_upstream.count_ones() > 0 {
        let originals: Vec<String> = state
            .original_indexes()
            .iter()
            .map(ToString::to_string)
            .collect();
        environment.insert(INDEX_MAP_ENV.to_string(), originals.join(","));
    }
    environment
}

/// Submits the umbrella job, or adopts the one already cached for this task.
///
/// A stale definition handle is evicted, re-registered and the submission
/// retried once. An array wider than `max_array_job_size` fails the task.
///
/// # Errors
///
/// Returns a retryable error if registration or submission fails.
#[tracing::instrument(
    skip_all,
    fields(task = %metadata.generated_name, size = state.execution_array_size)
)]
pub async fn launch_sub_tasks(
    state: &mut ArrayTaskState,
    store: &JobStore,
    definitions: &JobDefinitionCache,
    metadata: &TaskExecutionMetadata,
    config: &BatchConfig,
    deadline: Instant,
) -> Result<()> {
    let size = state.execution_array_size;
    if size > config.max_array_job_size {
        warn!(size, limit = config.max_array_job_size, "array too large to launch");
        return state.fail(format!(
            "array size {size} exceeds the maximum of {}",
            config.max_array_job_size
        ));
    }

    if let Some(job) = store.get(&metadata.generated_name)? {
        info!(job_id = %job.id, "adopting job already submitted for this task");
        state.external_job_id = Some(job.id.clone());
        return state.transition_to(Phase::CheckingSubTaskExecutions);
    }

    let handle = state
        .job_definition_handle
        .clone()
        .ok_or_else(|| Error::corrupted("launch phase reached without a job definition"))?;
    let mut request = SubmitJobRequest {
        name: metadata.generated_name.clone(),
        definition_handle: handle,
        array_size: size,
        queue: config.job_queue.clone(),
        role: config.job_role.clone(),
        retry_attempts: config.max_retries,
        environment: submission_environment(state, metadata),
    };

    let client = store.client();
    let job_id = match client.submit_job(&request, deadline).await {
        Err(Error::StaleJobDefinition { handle }) => {
            warn!(handle = %handle, "job definition is stale, registering again");
            definitions.evict(&metadata.definition.content_key()?)?;
            let fresh = definitions
                .get_or_register(client, &metadata.definition, deadline)
                .await?;
            state.job_definition_handle = Some(fresh.clone());
            request.definition_handle = fresh;
            client.submit_job(&request, deadline).await?
        }
        other => other?,
    };

    let job = store.get_or_create(
        &metadata.generated_name,
        Job::submitted(job_id, metadata.owner.clone(), size),
    )?;
    info!(job_id = %job.id, "submitted array job");
    state.external_job_id = Some(job.id.clone());
    state.transition_to(Phase::CheckingSubTaskExecutions)
}
