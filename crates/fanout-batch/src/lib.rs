//! # fanout-batch
//!
//! Reconciles array tasks against a remote batch backend.
//!
//! An array task fans one logical task out into many sub-tasks that run as a
//! single umbrella job on the backend. The host runtime calls the
//! [`executor::ArrayTaskExecutor`] repeatedly; each pass advances one phase,
//! persists a compact binary state blob and reports a task-level phase.
//!
//! ## Components
//!
//! - **Phases and State**: [`phase`], [`state`] and the versioned [`codec`]
//! - **Outcome Aggregation**: [`aggregate`] applies the min-successes policy
//! - **Backend Access**: [`backend`] defines the remote contract; [`client`]
//!   adds rate limiting and deadlines
//! - **Caches**: [`job_store`] keeps one job snapshot per task and resyncs it
//!   in the background; [`definition`] deduplicates job definitions
//! - **Phase Handlers**: [`discovery`], [`launch`] and [`monitor`]
//! - **Composition**: [`executor`] and [`registry`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use fanout_batch::backend::memory::InMemoryBatchBackend;
//! use fanout_batch::config::BatchConfig;
//! use fanout_batch::discovery::InMemoryCatalog;
//! use fanout_batch::executor::{ARRAY_TASK_TYPE, ArrayTaskExecutor};
//! use fanout_batch::job::OwnerReference;
//! use fanout_batch::job_store::EnqueueOwner;
//! use fanout_batch::registry::ExecutorRegistry;
//! use fanout_batch::Result;
//! use fanout_core::{LogFormat, init_logging};
//!
//! struct Requeue;
//!
//! #[async_trait]
//! impl EnqueueOwner for Requeue {
//!     async fn enqueue(&self, owner: &OwnerReference) -> Result<()> {
//!         println!("re-enqueue {owner}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! init_logging(LogFormat::from_env());
//! let (executor, background) = ArrayTaskExecutor::build(
//!     BatchConfig::from_env()?,
//!     Arc::new(InMemoryBatchBackend::new()),
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(Requeue),
//! )?;
//! let registry = ExecutorRegistry::builder()
//!     .register([ARRAY_TASK_TYPE], Arc::new(executor))
//!     .build()?;
//! assert!(registry.get(ARRAY_TASK_TYPE).is_some());
//! background.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod definition;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod job;
pub mod job_store;
pub mod launch;
pub mod metrics;
pub mod monitor;
pub mod phase;
pub mod registry;
pub mod state;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregate::{ArraySummary, Outcome, decide_outcome};
    pub use crate::backend::BatchBackend;
    pub use crate::client::BatchClient;
    pub use crate::codec::{PersistedPluginState, decode_state, encode_state};
    pub use crate::config::BatchConfig;
    pub use crate::definition::{JobDefinitionCache, JobDefinitionSpec};
    pub use crate::discovery::Catalog;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{
        ArrayJobSpec, ArrayTaskExecutor, TaskExecutionContext, TaskExecutionMetadata,
    };
    pub use crate::job::{Job, OwnerReference};
    pub use crate::job_store::{EnqueueOwner, JobStore};
    pub use crate::phase::{JobPhase, Phase, TaskPhase, Transition};
    pub use crate::registry::{ExecutorRegistry, TaskExecutor};
    pub use crate::state::ArrayTaskState;
}

pub use error::{Error, Result};
