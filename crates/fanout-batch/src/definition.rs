//! Job definition specs and the process-wide definition cache.
//!
//! Identical specs share one remote definition. The cache is keyed by a
//! content hash of the definition and collapses concurrent registrations for the
//! same key into a single remote call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::client::BatchClient;
use crate::error::{Error, Result};
use crate::metrics::BatchMetrics;

/// The container shape every sub-task of an array task runs with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobDefinitionSpec {
    /// Container image reference.
    pub image: String,
    /// Virtual CPUs per sub-task.
    pub vcpus: u32,
    /// Memory per sub-task in MiB.
    pub memory_mib: u64,
    /// Command template.
    pub command: Vec<String>,
    /// Environment baked into the definition.
    pub environment: BTreeMap<String, String>,
}

impl JobDefinitionSpec {
    /// Returns the content key: hex SHA-256 of the canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition cannot be serialized.
    pub fn content_key(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| {
            Error::storage_with_source("failed to serialize job definition for content key", e)
        })?;
        Ok(hex::encode(Sha256::digest(&json)))
    }

    /// Returns the remote name registered for this spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the content key cannot be computed.
    pub fn definition_name(&self) -> Result<String> {
        let key = self.content_key()?;
        Ok(format!("fanout-{}", key.get(..16).unwrap_or(&key)))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("job definition cache lock poisoned")
}

/// Content-keyed cache of registered job definition handles.
#[derive(Debug, Default)]
pub struct JobDefinitionCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
    metrics: BatchMetrics,
}

impl JobDefinitionCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &str) -> Result<Arc<OnceCell<String>>> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        Ok(Arc::clone(entries.entry(key.to_string()).or_default()))
    }

    /// Returns the handle for `spec`, registering it on a miss.
    ///
    /// Concurrent callers with the same spec wait on one registration. A
    /// failed registration is not cached; the next caller tries again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionRegistration`] if registration fails.
    #[tracing::instrument(skip(self, client, spec, deadline), fields(image = %spec.image))]
    pub async fn get_or_register(
        &self,
        client: &BatchClient,
        spec: &JobDefinitionSpec,
        deadline: Instant,
    ) -> Result<String> {
        let key = spec.content_key()?;
        let cell = self.cell(&key)?;
        if let Some(handle) = cell.get() {
            self.metrics.record_definition_lookup(true);
            return Ok(handle.clone());
        }
        self.metrics.record_definition_lookup(false);

        let name = spec.definition_name()?;
        let handle = cell
            .get_or_try_init(|| async {
                let handle = client
                    .register_job_definition(&name, spec, deadline)
                    .await
                    .map_err(|e| Error::DefinitionRegistration {
                        key: key.clone(),
                        message: e.to_string(),
                    })?;
                tracing::info!(key = %key, handle = %handle, "registered job definition");
                Ok::<_, Error>(handle)
            })
            .await?;
        Ok(handle.clone())
    }

    /// Returns the cached handle for a content key, if registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(poison_err)?;
        Ok(entries.get(key).and_then(|cell| cell.get().cloned()))
    }

    /// Drops the handle for a content key so the next lookup re-registers.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn evict(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        Ok(entries.remove(key).is_some())
    }

    /// Returns the number of registered handles.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let entries = self.entries.lock().map_err(poison_err)?;
        Ok(entries.values().filter(|cell| cell.initialized()).count())
    }

    /// Returns true if no handle is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
