//! Startup-time lookup of task executors by task type.
//!
//! The host adapter builds one [`ExecutorRegistry`] at startup and owns it;
//! there is no global registration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::executor::TaskExecutionContext;
use crate::phase::Transition;

/// Capabilities the host needs from a task executor.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Stable executor identifier, for logs.
    fn id(&self) -> &str;

    /// Runs one reconciliation pass.
    async fn handle(&self, ctx: &dyn TaskExecutionContext) -> Result<Transition>;

    /// Cancels remote work on a best-effort basis.
    async fn abort(&self, ctx: &dyn TaskExecutionContext) -> Result<()>;

    /// Releases resources held for a retired task instance.
    async fn finalize(&self, ctx: &dyn TaskExecutionContext) -> Result<()>;
}

/// Immutable map from task type to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    by_task_type: HashMap<String, Arc<dyn TaskExecutor>>,
    default: Option<Arc<dyn TaskExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut task_types: Vec<(&str, &str)> = self
            .by_task_type
            .iter()
            .map(|(t, e)| (t.as_str(), e.id()))
            .collect();
        task_types.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &task_types)
            .field("default", &self.default.as_ref().map(|e| e.id()))
            .finish()
    }
}

impl ExecutorRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::new()
    }

    /// Returns the executor for `task_type`, falling back to the default.
    #[must_use]
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.by_task_type
            .get(task_type)
            .or(self.default.as_ref())
            .cloned()
    }

    /// Returns the registered task types in sorted order.
    #[must_use]
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_task_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Builder for [`ExecutorRegistry`].
#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    entries: Vec<(String, Arc<dyn TaskExecutor>)>,
    default: Option<Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every task type in `task_types` to `executor`.
    #[must_use]
    pub fn register<I, S>(mut self, task_types: I, executor: Arc<dyn TaskExecutor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for task_type in task_types {
            self.entries.push((task_type.into(), Arc::clone(&executor)));
        }
        self
    }

    /// Routes unknown task types to `executor`.
    #[must_use]
    pub fn with_default(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.default = Some(executor);
        self
    }

    /// Builds the registry.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a task type is registered twice.
    pub fn build(self) -> Result<ExecutorRegistry> {
        let mut by_task_type: HashMap<String, Arc<dyn TaskExecutor>> =
            HashMap::with_capacity(self.entries.len());
        for (task_type, executor) in self.entries {
            if let Some(existing) = by_task_type.get(&task_type) {
                return Err(Error::configuration(format!(
                    "task type {task_type} registered by both {} and {}",
                    existing.id(),
                    executor.id()
                )));
            }
            by_task_type.insert(task_type, executor);
        }
        Ok(ExecutorRegistry {
            by_task_type,
            default: self.default,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{TaskPhase, TaskPhaseInfo};

    struct Named(&'static str);

    #[async_trait]
    impl TaskExecutor for Named {
        fn id(&self) -> &str {
            self.0
        }

        async fn handle(&self, _ctx: &dyn TaskExecutionContext) -> Result<Transition> {
            Ok(Transition {
                info: TaskPhaseInfo::new(TaskPhase::Success, 0),
                retry_sooner: false,
            })
        }

        async fn abort(&self, _ctx: &dyn TaskExecutionContext) -> Result<()> {
            Ok(())
        }

        async fn finalize(&self, _ctx: &dyn TaskExecutionContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_task_type_with_default() -> Result<()> {
        let registry = ExecutorRegistry::builder()
            .register(["container_array", "array"], Arc::new(Named("batch")))
            .with_default(Arc::new(Named("fallback")))
            .build()?;

        assert_eq!(registry.get("array").map(|e| e.id().to_string()).as_deref(), Some("batch"));
        assert_eq!(registry.get("python").map(|e| e.id().to_string()).as_deref(), Some("fallback"));
        assert_eq!(registry.task_types(), vec!["array", "container_array"]);
        Ok(())
    }

    #[test]
    fn unknown_type_without_default_is_none() -> Result<()> {
        let registry = ExecutorRegistry::builder()
            .register(["container_array"], Arc::new(Named("batch")))
            .build()?;
        assert!(registry.get("python").is_none());
        Ok(())
    }

    #[test]
    fn duplicate_task_type_is_rejected() {
        let result = ExecutorRegistry::builder()
            .register(["container_array"], Arc::new(Named("a")))
            .register(["container_array"], Arc::new(Named("b")))
            .build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
