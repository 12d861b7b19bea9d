//! Process-wide cache of remote umbrella jobs.
//!
//! The [`JobStore`] holds one [`Job`] snapshot per locally generated job
//! name. Reconciliation passes read snapshots; a background resync loop
//! refreshes every unsettled job with batched, rate-limited describe calls
//! and publishes a [`JobEvent`] whenever a snapshot changes.
//!
//! ## Concurrency
//!
//! Each entry has its own mutex, so updates to one job never wait on another.
//! No lock is held across a remote call: resync collects candidates, talks to
//! the backend, then applies results entry by entry.
//!
//! ## Failure Handling
//!
//! A failed describe keeps the previous snapshot and is logged. When only the
//! children of a job could not be described, the umbrella status is held back
//! too, so the job stays a resync candidate. A job that the backend stops
//! reporting is given `max_missing_resyncs` cycles before it and every
//! unfinished child are marked permanently failed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{JobDetail, child_job_id};
use crate::client::BatchClient;
use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus, OwnerReference, SubJob};
use crate::metrics::{BatchMetrics, time_resync};
use crate::phase::JobPhase;

const MISSING_JOB_MESSAGE: &str = "remote job not found";

/// Notification that a cached job changed.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A resync replaced the snapshot for `name`.
    Updated {
        /// Job name in the store.
        name: String,
        /// Snapshot before the resync.
        old: Arc<Job>,
        /// Snapshot after the resync.
        new: Arc<Job>,
    },
}

#[derive(Debug)]
struct JobEntry {
    job: Arc<Job>,
    missing_resyncs: u32,
}

/// Summary of one resync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Unfinished jobs considered.
    pub candidates: usize,
    /// Snapshots that changed.
    pub updated: usize,
    /// Jobs whose describe failed and kept a stale snapshot.
    pub stale: usize,
    /// Jobs the backend did not report.
    pub missing: usize,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("job store lock poisoned")
}

/// Cache of remote jobs keyed by job name.
#[derive(Debug)]
pub struct JobStore {
    client: Arc<BatchClient>,
    entries: RwLock<HashMap<String, Arc<Mutex<JobEntry>>>>,
    events: mpsc::Sender<JobEvent>,
    max_describe_batch: usize,
    max_missing_resyncs: u32,
    metrics: BatchMetrics,
}

impl JobStore {
    /// Creates an empty store that publishes updates on `events`.
    #[must_use]
    pub fn new(
        client: Arc<BatchClient>,
        config: &BatchConfig,
        events: mpsc::Sender<JobEvent>,
    ) -> Self {
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
            events,
            max_describe_batch: config.max_describe_batch.max(1),
            max_missing_resyncs: config.max_missing_resyncs.max(1),
            metrics: BatchMetrics::new(),
        }
    }

    /// Returns the client used for remote calls.
    #[must_use]
    pub fn client(&self) -> &Arc<BatchClient> {
        &self.client
    }

    /// Returns the cached job for `name`, inserting `seed` if there is none.
    ///
    /// Never calls the backend. Every caller for the same name receives the
    /// same snapshot until a resync replaces it.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn get_or_create(&self, name: &str, seed: Job) -> Result<Arc<Job>> {
        {
            let entries = self.entries.read().map_err(poison_err)?;
            if let Some(entry) = entries.get(name) {
                let entry = entry.lock().map_err(poison_err)?;
                return Ok(Arc::clone(&entry.job));
            }
        }

        let mut entries = self.entries.write().map_err(poison_err)?;
        let entry = Arc::clone(entries.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(JobEntry {
                job: Arc::new(seed),
                missing_resyncs: 0,
            }))
        }));
        let count = entries.len();
        drop(entries);
        self.metrics.set_cached_jobs(count);

        let entry = entry.lock().map_err(poison_err)?;
        Ok(Arc::clone(&entry.job))
    }

    /// Returns the cached job for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn get(&self, name: &str) -> Result<Option<Arc<Job>>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(name) {
            Some(entry) => {
                let entry = entry.lock().map_err(poison_err)?;
                Ok(Some(Arc::clone(&entry.job)))
            }
            None => Ok(None),
        }
    }

    /// Removes the job for `name`. Returns true if it was cached.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn evict(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let removed = entries.remove(name).is_some();
        let count = entries.len();
        drop(entries);
        self.metrics.set_cached_jobs(count);
        Ok(removed)
    }

    /// Returns the number of cached jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poison_err)?.len())
    }

    /// Returns true if no job is cached.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn candidates(&self) -> Result<Vec<(String, Arc<Mutex<JobEntry>>, Arc<Job>)>> {
        let entries = self.entries.read().map_err(poison_err)?;
        let mut candidates = Vec::new();
        for (name, entry) in entries.iter() {
            let job = Arc::clone(&entry.lock().map_err(poison_err)?.job);
            if !job.is_settled() {
                candidates.push((name.clone(), Arc::clone(entry), job));
            }
        }
        Ok(candidates)
    }

    /// Describes `ids` in concurrent batches. Returns the details found and the
    /// ids whose batch failed.
    ///
    /// Concurrency is bounded by the client's `get` limiter.
    async fn describe_batched(
        &self,
        ids: &[String],
        deadline: Instant,
    ) -> (HashMap<String, JobDetail>, Vec<String>) {
        let batches = join_all(ids.chunks(self.max_describe_batch).map(|chunk| async move {
            (chunk, self.client.describe_jobs(chunk, deadline).await)
        }))
        .await;

        let mut found = HashMap::new();
        let mut failed = Vec::new();
        for (chunk, result) in batches {
            match result {
                Ok(details) => {
                    found.extend(details.into_iter().map(|d| (d.id.clone(), d)));
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        batch = chunk.len(),
                        "describe failed, keeping cached snapshots"
                    );
                    failed.extend_from_slice(chunk);
                }
            }
        }
        (found, failed)
    }

    /// Refreshes every unsettled job once.
    ///
    /// Backend failures are logged and leave the affected snapshots as they
    /// were.
    ///
    /// # Errors
    ///
    /// Returns an error only if a lock is poisoned.
    #[tracing::instrument(skip(self, deadline))]
    pub async fn resync_once(&self, deadline: Instant) -> Result<ResyncReport> {
        let _timer = time_resync();
        let candidates = self.candidates()?;
        let mut report = ResyncReport {
            candidates: candidates.len(),
            ..ResyncReport::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let parent_ids: Vec<String> = candidates.iter().map(|(_, _, job)| job.id.clone()).collect();
        let (parents, failed_parents) = self.describe_batched(&parent_ids, deadline).await;

        let mut child_ids = Vec::new();
        for (_, _, job) in &candidates {
            if let Some(detail) = parents.get(&job.id) {
                let size = detail.array_size.unwrap_or(job.sub_jobs.len());
                child_ids.extend((0..size).map(|i| child_job_id(&job.id, i)));
            }
        }
        let (children, failed_children) = self.describe_batched(&child_ids, deadline).await;
        let stale_parents: HashSet<&str> = failed_children
            .iter()
            .map(String::as_str)
            .filter_map(parent_job_id)
            .collect();

        for (name, entry, _) in candidates {
            let mut entry = entry.lock().map_err(poison_err)?;
            let old = Arc::clone(&entry.job);

            let next = if let Some(detail) = parents.get(&old.id) {
                entry.missing_resyncs = 0;
                let mut next = merge_snapshot(&old, detail, &children);
                if stale_parents.contains(old.id.as_str()) {
                    // The umbrella may already be finished while its children
                    // are unknown; keep it open until they are described.
                    next.status = old.status.clone();
                    report.stale += 1;
                    self.metrics.record_resync_stale();
                }
                Some(next)
            } else if failed_parents.contains(&old.id) {
                report.stale += 1;
                self.metrics.record_resync_stale();
                None
            } else {
                report.missing += 1;
                entry.missing_resyncs += 1;
                if entry.missing_resyncs >= self.max_missing_resyncs {
                    warn!(job = %name, job_id = %old.id, "remote job missing, marking failed");
                    Some(mark_missing(&old))
                } else {
                    debug!(
                        job = %name,
                        job_id = %old.id,
                        misses = entry.missing_resyncs,
                        "remote job not reported"
                    );
                    None
                }
            };

            let Some(next) = next else { continue };
            if next == *old {
                continue;
            }
            let new = Arc::new(next);
            entry.job = Arc::clone(&new);
            drop(entry);
            report.updated += 1;
            self.publish(JobEvent::Updated { name, old, new });
        }

        Ok(report)
    }

    fn publish(&self, event: JobEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(JobEvent::Updated { name, .. })) => {
                warn!(job = %name, "job event channel full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(JobEvent::Updated { name, .. })) => {
                debug!(job = %name, "job event channel closed, dropping update");
            }
        }
    }

    /// Starts the background resync loop.
    ///
    /// Each cycle gets `period` as its deadline so a slow backend cannot make
    /// cycles pile up.
    #[must_use]
    pub fn spawn_resync(self: &Arc<Self>, period: Duration) -> ResyncHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            info!(period_ms = period.as_millis(), "starting job store resync");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = store.resync_once(Instant::now() + period).await {
                            warn!(error = %err, "job store resync failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("job store resync shutting down");
                            break;
                        }
                    }
                }
            }
        });
        ResyncHandle { shutdown_tx, task }
    }
}

/// Returns the umbrella id of a child id built by [`child_job_id`].
fn parent_job_id(child_id: &str) -> Option<&str> {
    child_id.rsplit_once(':').map(|(parent, _)| parent)
}

/// Fails the umbrella and every unfinished child of a job the backend lost.
fn mark_missing(old: &Job) -> Job {
    let missing = |attempts| JobStatus {
        phase: JobPhase::PermanentFailure,
        message: Some(MISSING_JOB_MESSAGE.to_string()),
        attempts,
    };
    let mut failed = old.clone();
    failed.status = missing(old.status.attempts);
    for sub_job in &mut failed.sub_jobs {
        if !sub_job.status.phase.is_terminal() {
            sub_job.status = missing(sub_job.status.attempts);
        }
    }
    failed
}

/// Folds a describe result into a snapshot without touching the original.
fn merge_snapshot(old: &Job, parent: &JobDetail, children: &HashMap<String, JobDetail>) -> Job {
    let mut next = old.clone();
    next.status = JobStatus::from_detail(parent);

    let size = parent.array_size.unwrap_or(old.sub_jobs.len());
    next.sub_jobs.resize_with(size, SubJob::default);
    for (index, sub_job) in next.sub_jobs.iter_mut().enumerate() {
        let id = child_job_id(&old.id, index);
        if let Some(detail) = children.get(&id) {
            sub_job.status = JobStatus::from_detail(detail);
        }
        sub_job.id.get_or_insert(id);
    }
    next
}

/// Handle to the background resync loop.
#[derive(Debug)]
pub struct ResyncHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ResyncHandle {
    /// Signals the loop to stop without waiting.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.trigger_shutdown();
        if let Err(err) = self.task.await {
            warn!(error = %err, "job store resync task ended abnormally");
        }
    }
}

/// Host hook that re-enqueues a task instance for another pass.
#[async_trait]
pub trait EnqueueOwner: Send + Sync {
    /// Asks the host to reconcile `owner` soon.
    async fn enqueue(&self, owner: &OwnerReference) -> Result<()>;
}

/// Forwards job updates to the host until every event sender is dropped.
///
/// Enqueue failures are logged; the host's regular poll still picks the
/// owner up later.
#[must_use]
pub fn spawn_event_forwarder(
    mut events: mpsc::Receiver<JobEvent>,
    enqueue: Arc<dyn EnqueueOwner>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let JobEvent::Updated { name, new, .. } = event;
            let Some(owner) = new.owner.as_ref() else {
                debug!(job = %name, "updated job has no owner");
                continue;
            };
            if let Err(err) = enqueue.enqueue(owner).await {
                warn!(
                    job = %name,
                    owner = %owner,
                    job_id = %new.id,
                    error = %err,
                    "failed to enqueue owner"
                );
            }
        }
    })
}
