//! Output catalog integration for the first and last phases.
//!
//! Before launching, [`determine_discoverability`] asks the [`Catalog`] which
//! original indexes already have reusable outputs and shrinks the execution
//! width to the rest. After the sub-tasks finish, [`write_to_discovery`]
//! publishes the outputs of every index marked cacheable and settles the
//! terminal phase.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use fanout_core::BitSet;
use tracing::{debug, info, warn};

use crate::aggregate::{ArraySummary, Outcome, decide_outcome};
use crate::error::{Error, Result};
use crate::phase::Phase;
use crate::state::ArrayTaskState;

/// Store of reusable sub-task outputs keyed by task cache key.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns a bitset of width `size` with a bit set for every original
    /// index whose output is already cached under `key`.
    async fn lookup(&self, key: &str, size: usize) -> Result<BitSet>;

    /// Records the output of original index `index` under `key`.
    async fn put(&self, key: &str, index: usize, output_location: &str) -> Result<()>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("catalog lock poisoned")
}

/// In-memory catalog for testing.
///
/// **NOT suitable for production**: entries are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<HashMap<String, BTreeMap<usize, String>>>,
    reject_puts: RwLock<bool>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every output recorded under `key`, by original index.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn outputs(&self, key: &str) -> Result<BTreeMap<usize, String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.get(key).cloned().unwrap_or_default())
    }

    /// Makes every subsequent `put` fail until called again with `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_reject_puts(&self, reject: bool) -> Result<()> {
        *self.reject_puts.write().map_err(poison_err)? = reject;
        Ok(())
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn lookup(&self, key: &str, size: usize) -> Result<BitSet> {
        let entries = self.entries.read().map_err(poison_err)?;
        let mut found = BitSet::new(size);
        if let Some(outputs) = entries.get(key) {
            for index in outputs.range(..size).map(|(i, _)| *i) {
                found.set(index)?;
            }
        }
        Ok(found)
    }

    async fn put(&self, key: &str, index: usize, output_location: &str) -> Result<()> {
        if *self.reject_puts.read().map_err(poison_err)? {
            return Err(Error::storage(format!("catalog rejected write for {key}/{index}")));
        }
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries
            .entry(key.to_string())
            .or_default()
            .insert(index, output_location.to_string());
        Ok(())
    }
}

/// Handles [`Phase::Start`]: skips indexes already cached upstream.
///
/// Without a cache key nothing is looked up and every index runs. When no
/// index is left to run the task succeeds immediately.
///
/// # Errors
///
/// Returns an error if the catalog lookup fails or returns a bitset of the
/// wrong width.
#[tracing::instrument(skip(state, catalog), fields(size = state.original_array_size))]
pub async fn determine_discoverability(
    state: &mut ArrayTaskState,
    catalog: &dyn Catalog,
    cache_key: Option<&str>,
    max_retries: u32,
) -> Result<()> {
    let size = state.original_array_size;
    let cached = match cache_key {
        Some(key) if size > 0 => {
            let found = catalog.lookup(key, size).await?;
            if found.len() != size {
                return Err(Error::storage(format!(
                    "catalog returned {} entries for an array of {size}",
                    found.len()
                )));
            }
            found
        }
        _ => BitSet::new(size),
    };

    let hits = cached.count_ones();
    state.cached_upstream = cached;
    state.set_execution_size(size - hits, max_retries)?;
    debug!(hits, remaining = state.execution_array_size, "checked catalog");

    if state.execution_array_size == 0 {
        info!(hits, "nothing left to execute");
        state.transition_to(Phase::Success)
    } else {
        state.transition_to(Phase::PreLaunch)
    }
}

/// Handles [`Phase::WriteToDiscovery`]: publishes cacheable outputs and moves
/// to the terminal phase the aggregator settles on.
///
/// Catalog write failures are logged and never change the outcome.
///
/// # Errors
///
/// Returns an error only for inconsistent state.
#[tracing::instrument(
    skip(state, catalog, output_prefix),
    fields(size = state.execution_array_size)
)]
pub async fn write_to_discovery(
    state: &mut ArrayTaskState,
    catalog: &dyn Catalog,
    cache_key: Option<&str>,
    output_prefix: &str,
) -> Result<()> {
    if let Some(key) = cache_key {
        let originals = state.original_indexes();
        let indexes: Vec<usize> = state.indexes_to_cache.iter_ones().collect();
        for index in indexes {
            let original = *originals.get(index).ok_or(fanout_core::Error::IndexOutOfRange {
                index,
                len: originals.len(),
            })?;
            let location = format!("{output_prefix}/{original}");
            if let Err(err) = catalog.put(key, original, &location).await {
                warn!(index = original, error = %err, "failed to write output to catalog");
            }
        }
    }

    let summary = ArraySummary::from_phases(&state.detailed_phases)?;
    let min_successes = state.effective_min_successes();
    match decide_outcome(&summary, min_successes) {
        Outcome::Success => state.transition_to(Phase::Success),
        Outcome::Failure | Outcome::Running => state.fail(format!(
            "{} of {} sub-tasks succeeded, {min_successes} required",
            summary.successes(),
            summary.total()
        )),
    }
}
