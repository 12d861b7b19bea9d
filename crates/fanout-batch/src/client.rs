//! Rate-limited access to the remote batch backend.
//!
//! Two independent token buckets gate backend traffic:
//!
//! - `get`: describe calls issued by resync and monitoring
//! - `default`: registration, submission and cancellation
//!
//! so heavy resync traffic never starves submissions and vice versa. Every
//! call carries a deadline that also bounds the wait for a token.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::time::Instant;
use tracing::Instrument;

use fanout_core::observability::backend_span;

use crate::backend::{BackendError, BackendOperation, BatchBackend, JobDetail, SubmitJobRequest};
use crate::config::{BatchConfig, RateLimiterConfig, WaitPolicy};
use crate::definition::JobDefinitionSpec;
use crate::error::{Error, Result};
use crate::metrics::BatchMetrics;

/// Process-wide limiter using in-memory state.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

const GET_LIMITER: &str = "get";
const DEFAULT_LIMITER: &str = "default";

fn build_limiter(name: &str, config: &RateLimiterConfig) -> Result<DirectLimiter> {
    let rate = NonZeroU32::new(config.rate)
        .ok_or_else(|| Error::configuration(format!("{name} limiter rate must be positive")))?;
    let burst = NonZeroU32::new(config.burst)
        .ok_or_else(|| Error::configuration(format!("{name} limiter burst must be positive")))?;
    Ok(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

/// Maps a backend failure onto the crate error taxonomy.
fn map_backend_error(op: BackendOperation, err: BackendError) -> Error {
    match err {
        BackendError::NotFound { job_id } => Error::RemoteJobNotFound { job_id },
        BackendError::InvalidDefinition { handle, .. } => Error::StaleJobDefinition { handle },
        err @ BackendError::Throttled { .. } => {
            Error::transient_with_source(op.as_label(), "throttled by backend", err)
        }
        err @ BackendError::Unavailable { .. } => {
            Error::transient_with_source(op.as_label(), "backend unavailable", err)
        }
        err @ BackendError::Rejected { .. } => {
            Error::transient_with_source(op.as_label(), "request rejected", err)
        }
    }
}

/// Rate-limited, deadline-bounded wrapper around a [`BatchBackend`].
///
/// Cheap to share behind an `Arc`; the limiters are shared by every caller.
pub struct BatchClient {
    backend: Arc<dyn BatchBackend>,
    get_limiter: DirectLimiter,
    default_limiter: DirectLimiter,
    wait_policy: WaitPolicy,
    metrics: BatchMetrics,
}

impl std::fmt::Debug for BatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchClient")
            .field("backend", &self.backend.backend_name())
            .field("get_limiter", &"<RateLimiter>")
            .field("default_limiter", &"<RateLimiter>")
            .field("wait_policy", &self.wait_policy)
            .finish()
    }
}

impl BatchClient {
    /// Creates a client with limiters built from `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero rate or burst.
    pub fn new(backend: Arc<dyn BatchBackend>, config: &BatchConfig) -> Result<Self> {
        Ok(Self {
            backend,
            get_limiter: build_limiter(GET_LIMITER, &config.get_rate_limiter)?,
            default_limiter: build_limiter(DEFAULT_LIMITER, &config.default_rate_limiter)?,
            wait_policy: config.wait_policy,
            metrics: BatchMetrics::new(),
        })
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn BatchBackend> {
        &self.backend
    }

    async fn acquire(&self, op: BackendOperation) -> Result<()> {
        let (limiter, name) = if op.is_read() {
            (&self.get_limiter, GET_LIMITER)
        } else {
            (&self.default_limiter, DEFAULT_LIMITER)
        };
        match self.wait_policy {
            WaitPolicy::FailFast => limiter.check().map_err(|_| {
                self.metrics.record_rate_limited(name);
                Error::RateLimited {
                    limiter: name.to_string(),
                }
            }),
            WaitPolicy::Block => {
                limiter.until_ready().await;
                Ok(())
            }
        }
    }

    async fn call<T, Fut>(&self, op: BackendOperation, deadline: Instant, call: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let bounded = tokio::time::timeout_at(deadline, async {
            self.acquire(op).await?;
            call.await.map_err(|e| map_backend_error(op, e))
        })
        .instrument(backend_span(op.as_label()));

        let result = bounded.await.unwrap_or_else(|_| {
            Err(Error::DeadlineExceeded {
                operation: op.as_label().to_string(),
            })
        });
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics.record_backend_call(op.as_label(), outcome);
        result
    }

    /// Registers a job definition.
    ///
    /// # Errors
    ///
    /// Returns a retryable error if the backend fails, the limiter rejects
    /// the call or the deadline passes.
    pub async fn register_job_definition(
        &self,
        name: &str,
        spec: &JobDefinitionSpec,
        deadline: Instant,
    ) -> Result<String> {
        self.call(
            BackendOperation::RegisterJobDefinition,
            deadline,
            self.backend.register_job_definition(name, spec),
        )
        .await
    }

    /// Submits an umbrella job and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleJobDefinition`] if the definition handle is no
    /// longer valid, otherwise as [`BatchClient::register_job_definition`].
    pub async fn submit_job(
        &self,
        request: &SubmitJobRequest,
        deadline: Instant,
    ) -> Result<String> {
        self.call(
            BackendOperation::SubmitJob,
            deadline,
            self.backend.submit_job(request),
        )
        .await
    }

    /// Describes jobs through the `get` limiter.
    ///
    /// # Errors
    ///
    /// As [`BatchClient::register_job_definition`].
    pub async fn describe_jobs(
        &self,
        job_ids: &[String],
        deadline: Instant,
    ) -> Result<Vec<JobDetail>> {
        self.call(
            BackendOperation::DescribeJobs,
            deadline,
            self.backend.describe_jobs(job_ids),
        )
        .await
    }

    /// Cancels a job and its children.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemoteJobNotFound`] for an unknown job, otherwise as
    /// [`BatchClient::register_job_definition`].
    pub async fn cancel_job(&self, job_id: &str, reason: &str, deadline: Instant) -> Result<()> {
        self.call(
            BackendOperation::CancelJob,
            deadline,
            self.backend.cancel_job(job_id, reason),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBatchBackend;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn spec() -> JobDefinitionSpec {
        JobDefinitionSpec {
            image: "worker:1".into(),
            vcpus: 1,
            memory_mib: 256,
            command: vec![],
            environment: BTreeMap::new(),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn fail_fast(get_burst: u32, default_burst: u32) -> BatchConfig {
        BatchConfig {
            get_rate_limiter: RateLimiterConfig {
                rate: 1,
                burst: get_burst,
            },
            default_rate_limiter: RateLimiterConfig {
                rate: 1,
                burst: default_burst,
            },
            wait_policy: WaitPolicy::FailFast,
            ..BatchConfig::default()
        }
    }

    #[tokio::test]
    async fn fail_fast_rejects_when_bucket_empty() -> Result<()> {
        let backend = Arc::new(InMemoryBatchBackend::new());
        let client = BatchClient::new(backend.clone(), &fail_fast(2, 5))?;

        client.describe_jobs(&[], deadline()).await?;
        client.describe_jobs(&[], deadline()).await?;
        let err = client
            .describe_jobs(&[], deadline())
            .await
            .expect_err("bucket empty");
        assert!(matches!(err, Error::RateLimited { ref limiter } if limiter == "get"));
        assert!(err.is_retryable());
        assert_eq!(backend.call_count(BackendOperation::DescribeJobs)?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn limiters_are_independent() -> Result<()> {
        let backend = Arc::new(InMemoryBatchBackend::new());
        let client = BatchClient::new(backend, &fail_fast(1, 1))?;

        client.describe_jobs(&[], deadline()).await?;
        assert!(client.describe_jobs(&[], deadline()).await.is_err());
        client
            .register_job_definition("def", &spec(), deadline())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn slow_backend_hits_deadline() -> Result<()> {
        let backend = Arc::new(InMemoryBatchBackend::with_latency(Duration::from_millis(200)));
        let client = BatchClient::new(backend, &BatchConfig::default())?;

        let err = client
            .describe_jobs(&[], Instant::now() + Duration::from_millis(10))
            .await
            .expect_err("deadline");
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert!(err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn backend_errors_are_mapped() -> Result<()> {
        let backend = Arc::new(InMemoryBatchBackend::new());
        let client = BatchClient::new(backend.clone(), &BatchConfig::default())?;

        let missing = client.cancel_job("nope", "test", deadline()).await;
        assert!(matches!(missing, Err(Error::RemoteJobNotFound { .. })));

        backend.fail_next(
            BackendOperation::DescribeJobs,
            BackendError::Unavailable {
                message: "503".into(),
            },
        )?;
        let transient = client.describe_jobs(&[], deadline()).await;
        assert!(matches!(transient, Err(Error::TransientBackend { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn stale_definition_is_reported() -> Result<()> {
        let backend = Arc::new(InMemoryBatchBackend::new());
        let client = BatchClient::new(backend.clone(), &BatchConfig::default())?;
        let handle = client
            .register_job_definition("def", &spec(), deadline())
            .await?;
        backend.deactivate_definition(&handle)?;

        let request = SubmitJobRequest {
            name: "task".into(),
            definition_handle: handle.clone(),
            array_size: 1,
            queue: "default".into(),
            role: String::new(),
            retry_attempts: 1,
            environment: BTreeMap::new(),
        };
        let err = client
            .submit_job(&request, deadline())
            .await
            .expect_err("stale");
        assert!(matches!(err, Error::StaleJobDefinition { handle: ref h } if *h == handle));
        Ok(())
    }
}
