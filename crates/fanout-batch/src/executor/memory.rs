//! In-memory task context for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: The state blob lives only in memory
//! - **Single-process only**: Nothing is shared with a real host

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{PluginStateReader, PluginStateWriter, TaskExecutionContext, TaskExecutionMetadata};
use crate::codec::{PersistedPluginState, decode_state};
use crate::error::{Error, Result};
use crate::state::ArrayTaskState;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task context lock poisoned")
}

#[derive(Debug, Default)]
struct ContextState {
    blob: Option<PersistedPluginState>,
    writes: usize,
    reject_writes: bool,
}

/// Task context holding its persisted state in memory.
#[derive(Debug)]
pub struct InMemoryTaskContext {
    metadata: TaskExecutionMetadata,
    state: RwLock<ContextState>,
}

impl InMemoryTaskContext {
    /// Creates a context with no persisted state.
    #[must_use]
    pub fn new(metadata: TaskExecutionMetadata) -> Self {
        Self {
            metadata,
            state: RwLock::new(ContextState::default()),
        }
    }

    /// Replaces the stored blob, as a host restoring a task would.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_blob(&self, blob: PersistedPluginState) -> Result<()> {
        self.state.write().map_err(poison_err)?.blob = Some(blob);
        Ok(())
    }

    /// Returns the stored blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn blob(&self) -> Result<Option<PersistedPluginState>> {
        Ok(self.state.read().map_err(poison_err)?.blob.clone())
    }

    /// Decodes the stored blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the blob is corrupt.
    pub fn decoded(&self) -> Result<Option<ArrayTaskState>> {
        self.blob()?.as_ref().map(decode_state).transpose()
    }

    /// Returns how many times the state was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn writes(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.writes)
    }

    /// Makes every subsequent write fail until called again with `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_reject_writes(&self, reject: bool) -> Result<()> {
        self.state.write().map_err(poison_err)?.reject_writes = reject;
        Ok(())
    }
}

#[async_trait]
impl PluginStateReader for InMemoryTaskContext {
    async fn get(&self) -> Result<Option<PersistedPluginState>> {
        self.blob()
    }
}

#[async_trait]
impl PluginStateWriter for InMemoryTaskContext {
    async fn put(&self, blob: PersistedPluginState) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.reject_writes {
            return Err(Error::storage("state write rejected"));
        }
        state.blob = Some(blob);
        state.writes += 1;
        Ok(())
    }
}

impl TaskExecutionContext for InMemoryTaskContext {
    fn metadata(&self) -> &TaskExecutionMetadata {
        &self.metadata
    }

    fn state_reader(&self) -> &dyn PluginStateReader {
        self
    }

    fn state_writer(&self) -> &dyn PluginStateWriter {
        self
    }
}
