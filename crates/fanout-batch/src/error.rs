//! Error types for array-task reconciliation.

/// The result type used throughout fanout-batch.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling an array task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The persisted state blob could not be decoded.
    ///
    /// Fatal to the reconciliation pass; the host decides what to do next.
    #[error("corrupted plugin state: {message}")]
    CorruptedPluginState {
        /// Description of the decode failure.
        message: String,
    },

    /// A remote backend call failed in a way that may succeed on a later pass.
    #[error("transient backend error during {operation}: {message}")]
    TransientBackend {
        /// The backend operation that failed.
        operation: String,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Registering a job definition failed.
    #[error("job definition registration failed for {key}: {message}")]
    DefinitionRegistration {
        /// Content key of the definition.
        key: String,
        /// Description of the failure.
        message: String,
    },

    /// The backend rejected a job definition handle as stale or unknown.
    #[error("stale job definition: {handle}")]
    StaleJobDefinition {
        /// The rejected handle.
        handle: String,
    },

    /// A remote job could not be found.
    #[error("remote job not found: {job_id}")]
    RemoteJobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// A rate limiter had no token available under a fail-fast wait policy.
    #[error("rate limited by {limiter} limiter")]
    RateLimited {
        /// The limiter that rejected the call.
        limiter: String,
    },

    /// A remote call did not complete before its deadline.
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded {
        /// The operation that timed out.
        operation: String,
    },

    /// An invalid phase transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current phase.
        from: String,
        /// The attempted target phase.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Configuration was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A local storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from fanout-core.
    #[error("core error: {0}")]
    Core(#[from] fanout_core::Error),
}

impl Error {
    /// Creates a new corrupted-state error.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::CorruptedPluginState {
            message: message.into(),
        }
    }

    /// Creates a new transient backend error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientBackend {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient backend error with a source.
    #[must_use]
    pub fn transient_with_source(
        operation: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientBackend {
            operation: operation.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if re-running the pass later may succeed.
    ///
    /// Corrupted state, contract violations on the compact encodings and
    /// configuration errors are never retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientBackend { .. }
                | Self::DefinitionRegistration { .. }
                | Self::StaleJobDefinition { .. }
                | Self::RemoteJobNotFound { .. }
                | Self::RateLimited { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Storage { .. }
        )
    }
}
