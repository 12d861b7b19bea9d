//! Configuration for the batch array executor.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Individual fields can then be overridden from `FANOUT_BATCH_*` environment
//! variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_RESYNC_PERIOD_SECS: &str = "FANOUT_BATCH_RESYNC_PERIOD_SECS";
const ENV_CALL_TIMEOUT_SECS: &str = "FANOUT_BATCH_CALL_TIMEOUT_SECS";
const ENV_GET_RATE: &str = "FANOUT_BATCH_GET_RATE";
const ENV_GET_BURST: &str = "FANOUT_BATCH_GET_BURST";
const ENV_DEFAULT_RATE: &str = "FANOUT_BATCH_DEFAULT_RATE";
const ENV_DEFAULT_BURST: &str = "FANOUT_BATCH_DEFAULT_BURST";
const ENV_WAIT_POLICY: &str = "FANOUT_BATCH_WAIT_POLICY";
const ENV_MAX_ARRAY_JOB_SIZE: &str = "FANOUT_BATCH_MAX_ARRAY_JOB_SIZE";
const ENV_MAX_RETRIES: &str = "FANOUT_BATCH_MAX_RETRIES";
const ENV_JOB_QUEUE: &str = "FANOUT_BATCH_JOB_QUEUE";
const ENV_JOB_ROLE: &str = "FANOUT_BATCH_JOB_ROLE";

const DEFAULT_RESYNC_PERIOD_SECS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RATE: u32 = 15;
const DEFAULT_BURST: u32 = 20;
const DEFAULT_MAX_ARRAY_JOB_SIZE: usize = 5000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_DESCRIBE_BATCH: usize = 100;
const DEFAULT_MAX_MISSING_RESYNCS: u32 = 3;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Tokens replenished per second.
    pub rate: u32,
    /// Maximum tokens available at once.
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            burst: DEFAULT_BURST,
        }
    }
}

/// What a caller does when its rate limiter has no token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Fail immediately with [`Error::RateLimited`].
    FailFast,
    /// Wait for a token, bounded by the call deadline.
    #[default]
    Block,
}

impl std::str::FromStr for WaitPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail_fast" => Ok(Self::FailFast),
            "block" => Ok(Self::Block),
            other => Err(Error::configuration(format!(
                "unknown wait policy '{other}', expected 'fail_fast' or 'block'"
            ))),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// How often the job store refreshes cached jobs.
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,
    /// Deadline applied to each remote call, including the wait for a token.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Limiter for describe calls.
    pub get_rate_limiter: RateLimiterConfig,
    /// Limiter for every other call.
    pub default_rate_limiter: RateLimiterConfig,
    /// Behaviour when a limiter is empty.
    pub wait_policy: WaitPolicy,
    /// Largest array the backend accepts in one umbrella job.
    pub max_array_job_size: usize,
    /// Attempts allowed per sub-task before its failure is permanent.
    pub max_retries: u32,
    /// Job ids per describe call.
    pub max_describe_batch: usize,
    /// Consecutive resyncs a job may be missing before it is failed.
    pub max_missing_resyncs: u32,
    /// Capacity of the job update channel.
    pub event_channel_capacity: usize,
    /// Backend queue that receives submissions.
    pub job_queue: String,
    /// Role attached to submitted jobs.
    pub job_role: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(DEFAULT_RESYNC_PERIOD_SECS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            get_rate_limiter: RateLimiterConfig::default(),
            default_rate_limiter: RateLimiterConfig::default(),
            wait_policy: WaitPolicy::default(),
            max_array_job_size: DEFAULT_MAX_ARRAY_JOB_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            max_describe_batch: DEFAULT_MAX_DESCRIBE_BATCH,
            max_missing_resyncs: DEFAULT_MAX_MISSING_RESYNCS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            job_queue: "default".to_string(),
            job_role: String::new(),
        }
    }
}

impl BatchConfig {
    /// Loads config from process environment with strict validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is malformed or the
    /// resulting config is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom environment source.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is malformed or the
    /// resulting config is invalid.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            resync_period: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_RESYNC_PERIOD_SECS,
                DEFAULT_RESYNC_PERIOD_SECS,
            )?),
            call_timeout: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_CALL_TIMEOUT_SECS,
                DEFAULT_CALL_TIMEOUT_SECS,
            )?),
            get_rate_limiter: RateLimiterConfig {
                rate: parse_positive_u32_env(&get_env, ENV_GET_RATE, DEFAULT_RATE)?,
                burst: parse_positive_u32_env(&get_env, ENV_GET_BURST, DEFAULT_BURST)?,
            },
            default_rate_limiter: RateLimiterConfig {
                rate: parse_positive_u32_env(&get_env, ENV_DEFAULT_RATE, DEFAULT_RATE)?,
                burst: parse_positive_u32_env(&get_env, ENV_DEFAULT_BURST, DEFAULT_BURST)?,
            },
            wait_policy: match get_env(ENV_WAIT_POLICY) {
                Some(raw) => raw.parse()?,
                None => defaults.wait_policy,
            },
            max_array_job_size: usize::try_from(parse_positive_u64_env(
                &get_env,
                ENV_MAX_ARRAY_JOB_SIZE,
                DEFAULT_MAX_ARRAY_JOB_SIZE as u64,
            )?)
            .map_err(|_| {
                Error::configuration(format!("{ENV_MAX_ARRAY_JOB_SIZE} exceeds supported range"))
            })?,
            max_retries: parse_positive_u32_env(&get_env, ENV_MAX_RETRIES, DEFAULT_MAX_RETRIES)?,
            job_queue: get_env(ENV_JOB_QUEUE).unwrap_or(defaults.job_queue),
            job_role: get_env(ENV_JOB_ROLE).unwrap_or(defaults.job_role),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.resync_period.is_zero(), "resync_period"),
            (self.call_timeout.is_zero(), "call_timeout"),
            (self.get_rate_limiter.rate == 0, "get_rate_limiter.rate"),
            (self.get_rate_limiter.burst == 0, "get_rate_limiter.burst"),
            (self.default_rate_limiter.rate == 0, "default_rate_limiter.rate"),
            (self.default_rate_limiter.burst == 0, "default_rate_limiter.burst"),
            (self.max_array_job_size == 0, "max_array_job_size"),
            (self.max_describe_batch == 0, "max_describe_batch"),
            (self.max_missing_resyncs == 0, "max_missing_resyncs"),
            (self.event_channel_capacity == 0, "event_channel_capacity"),
        ];
        if let Some((_, field)) = checks.iter().find(|(invalid, _)| *invalid) {
            return Err(Error::configuration(format!(
                "{field} must be greater than zero"
            )));
        }
        Ok(())
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_positive_u32_env<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_positive_u64_env(get_env, key, u64::from(default))?;
    u32::try_from(parsed)
        .map_err(|_| Error::configuration(format!("{key} value {parsed} exceeds supported range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = BatchConfig::default();
        config.validate()?;
        assert_eq!(config.resync_period, Duration::from_secs(30));
        assert_eq!(config.max_array_job_size, 5000);
        assert_eq!(config.wait_policy, WaitPolicy::Block);
        Ok(())
    }

    #[test]
    fn empty_json_uses_defaults() -> std::result::Result<(), serde_json::Error> {
        let config: BatchConfig = serde_json::from_str("{}")?;
        assert_eq!(config, BatchConfig::default());
        Ok(())
    }

    #[test]
    fn json_accepts_humantime_durations() -> std::result::Result<(), serde_json::Error> {
        let config: BatchConfig = serde_json::from_str(
            r#"{"resync_period": "5s", "call_timeout": "250ms", "wait_policy": "fail_fast"}"#,
        )?;
        assert_eq!(config.resync_period, Duration::from_secs(5));
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.wait_policy, WaitPolicy::FailFast);
        Ok(())
    }

    #[test]
    fn env_overrides_individual_fields() -> Result<()> {
        let config = BatchConfig::from_env_with(env(&[
            (ENV_RESYNC_PERIOD_SECS, "5"),
            (ENV_GET_RATE, "2"),
            (ENV_WAIT_POLICY, "fail_fast"),
            (ENV_JOB_QUEUE, "gpu"),
        ]))?;
        assert_eq!(config.resync_period, Duration::from_secs(5));
        assert_eq!(config.get_rate_limiter.rate, 2);
        assert_eq!(config.get_rate_limiter.burst, DEFAULT_BURST);
        assert_eq!(config.wait_policy, WaitPolicy::FailFast);
        assert_eq!(config.job_queue, "gpu");
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        Ok(())
    }

    #[test]
    fn env_rejects_zero_and_garbage() {
        let zero = BatchConfig::from_env_with(env(&[(ENV_CALL_TIMEOUT_SECS, "0")]));
        assert!(matches!(zero, Err(Error::Configuration { .. })));

        let garbage = BatchConfig::from_env_with(env(&[(ENV_MAX_RETRIES, "three")]));
        assert!(matches!(garbage, Err(Error::Configuration { .. })));

        let policy = BatchConfig::from_env_with(env(&[(ENV_WAIT_POLICY, "sometimes")]));
        assert!(matches!(policy, Err(Error::Configuration { .. })));
    }

    #[test]
    fn validate_rejects_zero_burst() {
        let config = BatchConfig {
            default_rate_limiter: RateLimiterConfig { rate: 1, burst: 0 },
            ..BatchConfig::default()
        };
        let err = config.validate().expect_err("zero burst");
        assert!(err.to_string().contains("default_rate_limiter.burst"));
    }
}
