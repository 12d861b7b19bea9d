//! End-to-end tests for the array task executor.
//!
//! Each test drives [`ArrayTaskExecutor`] pass by pass against the in-memory
//! backend, catalog and task context, the way a host would.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use fanout_batch::backend::memory::InMemoryBatchBackend;
use fanout_batch::backend::{BackendError, BackendOperation, RemoteJobStatus};
use fanout_batch::client::BatchClient;
use fanout_batch::codec::{PersistedPluginState, encode_state};
use fanout_batch::config::BatchConfig;
use fanout_batch::definition::{JobDefinitionCache, JobDefinitionSpec};
use fanout_batch::discovery::{Catalog, InMemoryCatalog};
use fanout_batch::executor::memory::InMemoryTaskContext;
use fanout_batch::executor::{ArrayJobSpec, ArrayTaskExecutor, TaskExecutionMetadata};
use fanout_batch::job::{Job, JobStatus, OwnerReference, SubJob};
use fanout_batch::job_store::{EnqueueOwner, JobEvent, JobStore};
use fanout_batch::launch::INDEX_MAP_ENV;
use fanout_batch::phase::{JobPhase, Phase, TaskPhase};
use fanout_batch::state::ArrayTaskState;
use fanout_batch::{Error, Result};

struct Harness {
    backend: Arc<InMemoryBatchBackend>,
    catalog: Arc<InMemoryCatalog>,
    executor: ArrayTaskExecutor,
    _events: mpsc::Receiver<JobEvent>,
}

fn harness() -> Harness {
    let config = BatchConfig::default();
    let backend = Arc::new(InMemoryBatchBackend::new());
    let catalog = Arc::new(InMemoryCatalog::new());
    let client = Arc::new(BatchClient::new(backend.clone(), &config).expect("client"));
    let (tx, rx) = mpsc::channel(64);
    let store = Arc::new(JobStore::new(client, &config, tx));
    let executor = ArrayTaskExecutor::new(
        config,
        store,
        Arc::new(JobDefinitionCache::new()),
        catalog.clone(),
    );
    Harness {
        backend,
        catalog,
        executor,
        _events: rx,
    }
}

fn definition() -> JobDefinitionSpec {
    JobDefinitionSpec {
        image: "registry.example.com/worker:3".into(),
        vcpus: 2,
        memory_mib: 2048,
        command: vec!["python".into(), "-m".into(), "worker".into()],
        environment: BTreeMap::new(),
    }
}

fn metadata(
    name: &str,
    array_spec: ArrayJobSpec,
    cache_key: Option<&str>,
) -> TaskExecutionMetadata {
    TaskExecutionMetadata {
        owner: OwnerReference::new("domain", name),
        generated_name: name.to_string(),
        array_spec,
        definition: definition(),
        output_prefix: format!("mem://outputs/{name}"),
        cache_key: cache_key.map(str::to_string),
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

/// Builds a context whose stored state is already checking sub-tasks.
fn checking_context(
    name: &str,
    size: usize,
    min_successes: usize,
    cached_upstream: &[usize],
) -> InMemoryTaskContext {
    let ctx = InMemoryTaskContext::new(metadata(
        name,
        ArrayJobSpec::new(size).with_min_successes(min_successes),
        Some("key"),
    ));
    let mut state = ArrayTaskState::new(size, min_successes).expect("state");
    for index in cached_upstream {
        state.cached_upstream.set(*index).expect("index");
    }
    state
        .set_execution_size(size - cached_upstream.len(), 3)
        .expect("resize");
    state.transition_to(Phase::PreLaunch).expect("pre-launch");
    state.transition_to(Phase::Launch).expect("launch");
    state
        .transition_to(Phase::CheckingSubTaskExecutions)
        .expect("checking");
    state.external_job_id = Some("job-id".into());
    state.job_definition_handle = Some("def:1".into());
    ctx.set_blob(encode_state(&state).expect("encode"))
        .expect("store blob");
    ctx
}

fn sub_jobs(phases: &[JobPhase]) -> Vec<SubJob> {
    phases
        .iter()
        .map(|phase| SubJob {
            id: None,
            status: JobStatus::new(*phase),
        })
        .collect()
}

fn current_state(ctx: &InMemoryTaskContext) -> ArrayTaskState {
    ctx.decoded().expect("decode").expect("persisted")
}

#[tokio::test]
async fn doomed_array_fails_early() -> Result<()> {
    use JobPhase::{PermanentFailure, Running, Success};
    let h = harness();
    let ctx = checking_context("doomed", 5, 5, &[]);
    h.executor.job_store().get_or_create(
        "doomed",
        Job::new("job-id", Running).with_sub_jobs(sub_jobs(&[
            Success,
            Success,
            Running,
            Running,
            PermanentFailure,
        ])),
    )?;

    let transition = h.executor.handle(&ctx).await?;
    assert!(transition.retry_sooner);
    assert_eq!(current_state(&ctx).current_phase, Phase::WriteToDiscovery);
    // Best-effort cancel of an unknown job is logged and ignored.
    assert_eq!(h.backend.call_count(BackendOperation::CancelJob)?, 1);

    let transition = h.executor.handle(&ctx).await?;
    assert_eq!(transition.info.phase, TaskPhase::PermanentFailure);
    let state = current_state(&ctx);
    assert_eq!(state.current_phase, Phase::Failure);
    assert!(state.reason.as_deref().is_some_and(|r| r.contains("2 of 5")));

    // Partial successes are still published.
    let outputs = h.catalog.outputs("key")?;
    assert_eq!(outputs.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn single_success_moves_to_discovery() -> Result<()> {
    let h = harness();
    let ctx = checking_context("single", 1, 1, &[]);
    h.executor.job_store().get_or_create(
        "single",
        Job::new("job-id", JobPhase::Running).with_sub_jobs(sub_jobs(&[JobPhase::Success])),
    )?;

    let transition = h.executor.handle(&ctx).await?;

    assert!(transition.retry_sooner);
    assert_eq!(transition.info.phase, TaskPhase::Running);
    let state = current_state(&ctx);
    assert_eq!(state.current_phase, Phase::WriteToDiscovery);
    assert!(state.indexes_to_cache.get(0)?);
    Ok(())
}

#[tokio::test]
async fn undecided_array_keeps_checking() -> Result<()> {
    let h = harness();
    let ctx = checking_context("undecided", 2, 2, &[]);
    h.executor.job_store().get_or_create(
        "undecided",
        Job::new("job-id", JobPhase::Running)
            .with_sub_jobs(sub_jobs(&[JobPhase::Running, JobPhase::Success])),
    )?;

    let transition = h.executor.handle(&ctx).await?;

    assert!(!transition.retry_sooner);
    assert_eq!(transition.info.phase, TaskPhase::Running);
    assert_eq!(transition.info.version, 1);
    let state = current_state(&ctx);
    assert_eq!(state.current_phase, Phase::CheckingSubTaskExecutions);
    assert!(!state.indexes_to_cache.get(0)?);
    assert!(state.indexes_to_cache.get(1)?);
    Ok(())
}

#[tokio::test]
async fn cache_miss_seeds_placeholder_and_waits() -> Result<()> {
    let h = harness();
    let ctx = checking_context("restarted", 10, 10, &[0, 2, 4, 6, 8]);

    let transition = h.executor.handle(&ctx).await?;

    assert!(!transition.retry_sooner);
    assert_eq!(transition.info.phase, TaskPhase::Queued);
    assert_eq!(current_state(&ctx).current_phase, Phase::CheckingSubTaskExecutions);
    let seeded = h.executor.job_store().get("restarted")?.expect("placeholder");
    assert_eq!(seeded.id, "job-id");
    assert_eq!(seeded.owner, Some(OwnerReference::new("domain", "restarted")));
    Ok(())
}

#[tokio::test]
async fn parent_status_applies_without_sub_jobs() -> Result<()> {
    let h = harness();
    let ctx = checking_context("flat", 5, 5, &[]);
    h.executor
        .job_store()
        .get_or_create("flat", Job::new("job-id", JobPhase::Success))?;

    h.executor.handle(&ctx).await?;
    let state = current_state(&ctx);
    assert_eq!(state.current_phase, Phase::WriteToDiscovery);
    assert_eq!(state.indexes_to_cache.count_ones(), 5);
    Ok(())
}

#[tokio::test]
async fn full_lifecycle_reaches_success() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata(
        "lifecycle",
        ArrayJobSpec::new(3).with_min_successes(2),
        Some("key"),
    ));

    let mut phases = Vec::new();
    for _ in 0..3 {
        let transition = h.executor.handle(&ctx).await?;
        assert!(transition.retry_sooner);
        phases.push(current_state(&ctx).current_phase);
    }
    assert_eq!(
        phases,
        vec![Phase::PreLaunch, Phase::Launch, Phase::CheckingSubTaskExecutions]
    );

    let job_id = h.backend.job_id_by_name("lifecycle")?.expect("submitted");
    assert_eq!(current_state(&ctx).external_job_id.as_deref(), Some(job_id.as_str()));
    h.backend.set_child_status(&job_id, 0, RemoteJobStatus::Succeeded, 0)?;
    h.backend.set_child_status(&job_id, 1, RemoteJobStatus::Succeeded, 1)?;
    h.backend.set_child_status(&job_id, 2, RemoteJobStatus::Failed, 3)?;
    h.executor.job_store().resync_once(deadline()).await?;

    h.executor.handle(&ctx).await?;
    let state = current_state(&ctx);
    assert_eq!(state.current_phase, Phase::WriteToDiscovery);
    assert_eq!(state.sub_task_phase(2)?, JobPhase::PermanentFailure);
    assert_eq!(state.retry_attempts.get(2)?, 3);

    let transition = h.executor.handle(&ctx).await?;
    assert_eq!(transition.info.phase, TaskPhase::Success);
    assert_eq!(h.catalog.outputs("key")?.len(), 2);

    let transition = h.executor.handle(&ctx).await?;
    assert!(!transition.retry_sooner);
    assert_eq!(transition.info.phase, TaskPhase::Success);
    assert_eq!(h.backend.call_count(BackendOperation::SubmitJob)?, 1);
    Ok(())
}

#[tokio::test]
async fn upstream_outputs_are_skipped() -> Result<()> {
    let h = harness();
    h.catalog.put("key", 1, "mem://old/1").await?;
    let ctx = InMemoryTaskContext::new(metadata("skip", ArrayJobSpec::new(3), Some("key")));

    for _ in 0..3 {
        h.executor.handle(&ctx).await?;
    }
    let submissions = h.backend.submissions()?;
    assert_eq!(submissions[0].array_size, 2);
    assert_eq!(
        submissions[0].environment.get(INDEX_MAP_ENV).map(String::as_str),
        Some("0,2")
    );

    let job_id = h.backend.job_id_by_name("skip")?.expect("submitted");
    h.backend.set_child_status(&job_id, 0, RemoteJobStatus::Succeeded, 0)?;
    h.backend.set_child_status(&job_id, 1, RemoteJobStatus::Succeeded, 0)?;
    h.executor.job_store().resync_once(deadline()).await?;

    h.executor.handle(&ctx).await?;
    let transition = h.executor.handle(&ctx).await?;
    assert_eq!(transition.info.phase, TaskPhase::Success);

    let outputs = h.catalog.outputs("key")?;
    assert_eq!(outputs.get(&2).map(String::as_str), Some("mem://outputs/skip/2"));
    assert_eq!(outputs.get(&1).map(String::as_str), Some("mem://old/1"));
    Ok(())
}

#[tokio::test]
async fn unreachable_threshold_cancels_remote_job() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata("cancel", ArrayJobSpec::new(3), None));
    for _ in 0..3 {
        h.executor.handle(&ctx).await?;
    }
    let job_id = h.backend.job_id_by_name("cancel")?.expect("submitted");
    h.backend.set_child_status(&job_id, 0, RemoteJobStatus::Failed, 3)?;
    h.executor.job_store().resync_once(deadline()).await?;

    h.executor.handle(&ctx).await?;
    assert_eq!(current_state(&ctx).current_phase, Phase::WriteToDiscovery);
    assert_eq!(h.backend.cancelled()?, vec![job_id]);

    let transition = h.executor.handle(&ctx).await?;
    assert_eq!(transition.info.phase, TaskPhase::PermanentFailure);
    Ok(())
}

#[tokio::test]
async fn lost_remote_job_fails_the_task() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata("lost", ArrayJobSpec::new(2), None));
    for _ in 0..3 {
        h.executor.handle(&ctx).await?;
    }
    let job_id = h.backend.job_id_by_name("lost")?.expect("submitted");
    h.backend.forget_job(&job_id)?;

    for _ in 0..BatchConfig::default().max_missing_resyncs {
        h.executor.job_store().resync_once(deadline()).await?;
    }
    h.executor.handle(&ctx).await?;
    assert_eq!(current_state(&ctx).current_phase, Phase::WriteToDiscovery);

    let transition = h.executor.handle(&ctx).await?;
    assert_eq!(transition.info.phase, TaskPhase::PermanentFailure);
    assert_eq!(current_state(&ctx).current_phase, Phase::Failure);
    Ok(())
}

#[tokio::test]
async fn corrupted_state_is_fatal() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata("corrupt", ArrayJobSpec::new(2), None));

    ctx.set_blob(PersistedPluginState {
        version: 7,
        payload: Bytes::new(),
    })?;
    let err = h.executor.handle(&ctx).await.expect_err("unknown version");
    assert!(matches!(err, Error::CorruptedPluginState { .. }));
    assert!(!err.is_retryable());

    ctx.set_blob(PersistedPluginState {
        version: 0,
        payload: Bytes::from_static(&[0xff, 0x01]),
    })?;
    let err = h.executor.handle(&ctx).await.expect_err("garbage payload");
    assert!(matches!(err, Error::CorruptedPluginState { .. }));
    assert_eq!(ctx.writes()?, 0);
    Ok(())
}

#[tokio::test]
async fn handler_error_persists_progress_and_retries() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata("flaky", ArrayJobSpec::new(2), None));
    h.executor.handle(&ctx).await?;

    h.backend.fail_next(
        BackendOperation::RegisterJobDefinition,
        BackendError::Unavailable {
            message: "503".into(),
        },
    )?;
    let err = h.executor.handle(&ctx).await.expect_err("registration fails");
    assert!(matches!(err, Error::DefinitionRegistration { .. }));
    assert!(err.is_retryable());
    assert_eq!(ctx.writes()?, 2);
    assert_eq!(current_state(&ctx).current_phase, Phase::PreLaunch);

    h.executor.handle(&ctx).await?;
    assert_eq!(current_state(&ctx).current_phase, Phase::Launch);
    Ok(())
}

#[tokio::test]
async fn concurrent_tasks_share_one_definition() -> Result<()> {
    let h = harness();
    let contexts: Vec<InMemoryTaskContext> = (0..8)
        .map(|i| {
            InMemoryTaskContext::new(metadata(&format!("task-{i}"), ArrayJobSpec::new(2), None))
        })
        .collect();
    for ctx in &contexts {
        h.executor.handle(ctx).await?;
    }

    let results =
        futures::future::join_all(contexts.iter().map(|ctx| h.executor.handle(ctx))).await;
    for result in results {
        result?;
    }

    assert_eq!(h.backend.call_count(BackendOperation::RegisterJobDefinition)?, 1);
    let handles: Vec<_> = contexts
        .iter()
        .map(|ctx| current_state(ctx).job_definition_handle)
        .collect();
    assert!(handles.windows(2).all(|w| w[0] == w[1]));
    Ok(())
}

#[tokio::test]
async fn abort_cancels_and_evicts() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata("aborted", ArrayJobSpec::new(2), None));
    for _ in 0..3 {
        h.executor.handle(&ctx).await?;
    }
    let job_id = h.backend.job_id_by_name("aborted")?.expect("submitted");

    h.executor.abort(&ctx).await?;

    assert_eq!(h.backend.cancelled()?, vec![job_id]);
    assert!(h.executor.job_store().get("aborted")?.is_none());
    Ok(())
}

#[tokio::test]
async fn abort_before_launch_is_a_no_op() -> Result<()> {
    let h = harness();
    let ctx = InMemoryTaskContext::new(metadata("early", ArrayJobSpec::new(2), None));
    h.executor.handle(&ctx).await?;

    h.executor.abort(&ctx).await?;
    assert_eq!(h.backend.call_count(BackendOperation::CancelJob)?, 0);
    Ok(())
}

#[derive(Default)]
struct RecordingEnqueue {
    owners: Mutex<Vec<OwnerReference>>,
}

#[async_trait]
impl EnqueueOwner for RecordingEnqueue {
    async fn enqueue(&self, owner: &OwnerReference) -> Result<()> {
        self.owners
            .lock()
            .map_err(|_| Error::storage("poisoned"))?
            .push(owner.clone());
        Ok(())
    }
}

#[tokio::test]
async fn background_resync_enqueues_owner() -> Result<()> {
    let backend = Arc::new(InMemoryBatchBackend::new());
    let enqueue = Arc::new(RecordingEnqueue::default());
    let config = BatchConfig {
        resync_period: Duration::from_millis(20),
        ..BatchConfig::default()
    };
    let (executor, background) = ArrayTaskExecutor::build(
        config,
        backend.clone(),
        Arc::new(InMemoryCatalog::new()),
        enqueue.clone(),
    )?;

    let ctx = InMemoryTaskContext::new(metadata("watched", ArrayJobSpec::new(1), None));
    for _ in 0..3 {
        executor.handle(&ctx).await?;
    }
    let job_id = backend.job_id_by_name("watched")?.expect("submitted");
    backend.set_child_status(&job_id, 0, RemoteJobStatus::Succeeded, 0)?;

    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let synced = executor
                .job_store()
                .get("watched")
                .expect("store")
                .is_some_and(|job| job.is_finished());
            if synced && !enqueue.owners.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "owner was never enqueued");
    assert_eq!(
        enqueue.owners.lock().expect("lock")[0],
        OwnerReference::new("domain", "watched")
    );

    executor.handle(&ctx).await?;
    assert_eq!(current_state(&ctx).current_phase, Phase::WriteToDiscovery);

    background.shutdown().await;
    Ok(())
}
