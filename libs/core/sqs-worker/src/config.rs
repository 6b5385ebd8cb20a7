//! Server configuration
//!
//! `MqServerConfig` carries the defaults applied to every registered message type, plus the
//! runtime knobs of workers, buffers and the control loop. It loads from `SQS_WORKER_*`
//! environment variables through [`FromEnv`].

use crate::definition::BufferSizes;
use crate::error::MqError;
use crate::service::{validate_retry_count, validate_visibility_timeout, validate_wait_time};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for MqError {
    fn from(err: ConfigError) -> Self {
        MqError::Config(err.to_string())
    }
}

/// Application environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Milliseconds variable where `0` disables the feature.
fn env_optional_ms(key: &str, default: Option<u64>) -> Result<Option<Duration>, ConfigError> {
    let ms = env_parse(key, default.unwrap_or(0))?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::ParseError {
                key: key.to_string(),
                details: format!("expected a boolean, got '{other}'"),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration for the message queue server
#[derive(Debug, Clone)]
pub struct MqServerConfig {
    /// Times a failed message is requeued before it goes to the dead-letter queue
    pub retry_count: u32,

    /// Wait between handler passes of a worker
    pub polling_interval: Duration,

    /// Default visibility timeout in seconds
    pub visibility_timeout: u32,

    /// Default receive wait time (long polling) in seconds
    pub receive_wait_time: u32,

    /// Per-operation batch thresholds of buffered queues
    pub buffer_sizes: BufferSizes,

    /// Use pass-through buffers for every queue
    pub disable_buffering: bool,

    /// Interval of the periodic partial drain (None disables it)
    pub buffer_flush_interval: Option<Duration>,

    /// Delay before the control loop restarts the server after a failure (None disables it)
    pub auto_restart_delay: Option<Duration>,

    /// Worker backoff step after a failed pass
    pub worker_retry_step: Duration,

    /// Upper bound of the worker backoff
    pub worker_retry_cap: Duration,

    /// Wall-clock budget for returning prefetched messages on shutdown
    pub nak_drain_budget: Duration,

    /// Bounded wait for worker and control threads to exit
    pub thread_join_timeout: Duration,

    /// Prefix inserted into every queue name, e.g. `staging-`
    pub queue_name_prefix: String,

    /// Run a worker on the priority queue of every message type
    pub enable_priority_queues: bool,

    /// Publish handler responses without a reply address to the out queue
    pub publish_responses_to_out_queue: bool,
}

impl Default for MqServerConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            polling_interval: Duration::from_millis(250),
            visibility_timeout: 30,
            receive_wait_time: 0,
            buffer_sizes: BufferSizes::default(),
            disable_buffering: false,
            buffer_flush_interval: Some(Duration::from_millis(500)),
            auto_restart_delay: None,
            worker_retry_step: Duration::from_secs(1),
            worker_retry_cap: Duration::from_secs(30),
            nak_drain_budget: Duration::from_secs(5),
            thread_join_timeout: Duration::from_secs(5),
            queue_name_prefix: String::new(),
            enable_priority_queues: false,
            publish_responses_to_out_queue: false,
        }
    }
}

impl MqServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default retry count
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the worker polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the default visibility timeout in seconds
    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = seconds;
        self
    }

    /// Set the default receive wait time in seconds
    pub fn with_receive_wait_time(mut self, seconds: u32) -> Self {
        self.receive_wait_time = seconds;
        self
    }

    /// Set the per-operation buffer sizes
    pub fn with_buffer_sizes(mut self, sizes: BufferSizes) -> Self {
        self.buffer_sizes = sizes;
        self
    }

    /// Disable local buffering for every queue
    pub fn with_buffering_disabled(mut self, disabled: bool) -> Self {
        self.disable_buffering = disabled;
        self
    }

    /// Set the periodic drain interval (None disables the timer)
    pub fn with_buffer_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.buffer_flush_interval = interval;
        self
    }

    /// Set the auto-restart delay (None disables auto-restart)
    pub fn with_auto_restart_delay(mut self, delay: Option<Duration>) -> Self {
        self.auto_restart_delay = delay;
        self
    }

    /// Set the worker backoff step and cap
    pub fn with_worker_backoff(mut self, step: Duration, cap: Duration) -> Self {
        self.worker_retry_step = step;
        self.worker_retry_cap = cap;
        self
    }

    pub fn with_thread_join_timeout(mut self, timeout: Duration) -> Self {
        self.thread_join_timeout = timeout;
        self
    }

    pub fn with_nak_drain_budget(mut self, budget: Duration) -> Self {
        self.nak_drain_budget = budget;
        self
    }

    /// Set the queue name prefix
    pub fn with_queue_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_name_prefix = prefix.into();
        self
    }

    pub fn with_priority_queues(mut self, enabled: bool) -> Self {
        self.enable_priority_queues = enabled;
        self
    }

    pub fn with_out_queue_responses(mut self, enabled: bool) -> Self {
        self.publish_responses_to_out_queue = enabled;
        self
    }

    /// Check every value against the ranges the remote service accepts
    pub fn validate(&self) -> Result<(), MqError> {
        validate_retry_count(self.retry_count)?;
        validate_visibility_timeout(self.visibility_timeout)?;
        validate_wait_time(self.receive_wait_time)?;
        if self.polling_interval.is_zero() {
            return Err(ConfigError::Invalid("polling interval must be positive".into()).into());
        }
        if self.worker_retry_cap < self.worker_retry_step {
            return Err(
                ConfigError::Invalid("worker retry cap must not be below the step".into()).into(),
            );
        }
        Ok(())
    }
}

impl FromEnv for MqServerConfig {
    /// Reads `SQS_WORKER_*` variables, falling back to [`MqServerConfig::default`]:
    /// - `SQS_WORKER_RETRY_COUNT`
    /// - `SQS_WORKER_POLLING_INTERVAL_MS`
    /// - `SQS_WORKER_VISIBILITY_TIMEOUT_SECS`
    /// - `SQS_WORKER_WAIT_TIME_SECS`
    /// - `SQS_WORKER_BUFFER_SIZE` (all operations)
    /// - `SQS_WORKER_DISABLE_BUFFERING`
    /// - `SQS_WORKER_FLUSH_INTERVAL_MS` (0 disables)
    /// - `SQS_WORKER_AUTO_RESTART_DELAY_MS` (0 disables)
    /// - `SQS_WORKER_RETRY_STEP_MS`, `SQS_WORKER_RETRY_CAP_MS`
    /// - `SQS_WORKER_QUEUE_PREFIX`
    /// - `SQS_WORKER_ENABLE_PRIORITY_QUEUES`
    /// - `SQS_WORKER_PUBLISH_RESPONSES`
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let buffer_size = env_parse("SQS_WORKER_BUFFER_SIZE", defaults.buffer_sizes.send)?;

        let config = Self {
            retry_count: env_parse("SQS_WORKER_RETRY_COUNT", defaults.retry_count)?,
            polling_interval: Duration::from_millis(env_parse(
                "SQS_WORKER_POLLING_INTERVAL_MS",
                defaults.polling_interval.as_millis() as u64,
            )?),
            visibility_timeout: env_parse(
                "SQS_WORKER_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout,
            )?,
            receive_wait_time: env_parse("SQS_WORKER_WAIT_TIME_SECS", defaults.receive_wait_time)?,
            buffer_sizes: BufferSizes::uniform(buffer_size),
            disable_buffering: env_bool("SQS_WORKER_DISABLE_BUFFERING", defaults.disable_buffering)?,
            buffer_flush_interval: env_optional_ms(
                "SQS_WORKER_FLUSH_INTERVAL_MS",
                defaults.buffer_flush_interval.map(|d| d.as_millis() as u64),
            )?,
            auto_restart_delay: env_optional_ms("SQS_WORKER_AUTO_RESTART_DELAY_MS", None)?,
            worker_retry_step: Duration::from_millis(env_parse(
                "SQS_WORKER_RETRY_STEP_MS",
                defaults.worker_retry_step.as_millis() as u64,
            )?),
            worker_retry_cap: Duration::from_millis(env_parse(
                "SQS_WORKER_RETRY_CAP_MS",
                defaults.worker_retry_cap.as_millis() as u64,
            )?),
            queue_name_prefix: env_or_default("SQS_WORKER_QUEUE_PREFIX", ""),
            enable_priority_queues: env_bool(
                "SQS_WORKER_ENABLE_PRIORITY_QUEUES",
                defaults.enable_priority_queues,
            )?,
            publish_responses_to_out_queue: env_bool(
                "SQS_WORKER_PUBLISH_RESPONSES",
                defaults.publish_responses_to_out_queue,
            )?,
            ..defaults
        };

        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "SQS_WORKER_RETRY_COUNT",
        "SQS_WORKER_VISIBILITY_TIMEOUT_SECS",
        "SQS_WORKER_WAIT_TIME_SECS",
        "SQS_WORKER_FLUSH_INTERVAL_MS",
        "SQS_WORKER_DISABLE_BUFFERING",
        "SQS_WORKER_BUFFER_SIZE",
    ];

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars_unset(VARS, || {
            let config = MqServerConfig::from_env().unwrap();
            assert_eq!(config.retry_count, 2);
            assert_eq!(config.visibility_timeout, 30);
            assert_eq!(config.receive_wait_time, 0);
            assert_eq!(config.buffer_sizes, BufferSizes::uniform(10));
            assert!(!config.disable_buffering);
            assert!(config.buffer_flush_interval.is_some());
        });
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("SQS_WORKER_RETRY_COUNT", Some("5")),
                ("SQS_WORKER_VISIBILITY_TIMEOUT_SECS", Some("120")),
                ("SQS_WORKER_FLUSH_INTERVAL_MS", Some("0")),
                ("SQS_WORKER_DISABLE_BUFFERING", Some("true")),
                ("SQS_WORKER_BUFFER_SIZE", Some("4")),
            ],
            || {
                let config = MqServerConfig::from_env().unwrap();
                assert_eq!(config.retry_count, 5);
                assert_eq!(config.visibility_timeout, 120);
                assert_eq!(config.buffer_flush_interval, None);
                assert!(config.disable_buffering);
                assert_eq!(config.buffer_sizes.receive, 4);
            },
        );
    }

    #[test]
    fn test_from_env_parse_error() {
        temp_env::with_var("SQS_WORKER_RETRY_COUNT", Some("many"), || {
            let err = MqServerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "SQS_WORKER_RETRY_COUNT"));
        });
    }

    #[test]
    fn test_from_env_rejects_out_of_range() {
        temp_env::with_var("SQS_WORKER_WAIT_TIME_SECS", Some("21"), || {
            assert!(matches!(
                MqServerConfig::from_env(),
                Err(ConfigError::Invalid(_))
            ));
        });
    }

    #[test]
    fn test_validate() {
        assert!(MqServerConfig::default().validate().is_ok());
        assert!(MqServerConfig::default()
            .with_visibility_timeout(43_201)
            .validate()
            .is_err());
        assert!(MqServerConfig::default()
            .with_retry_count(1_001)
            .validate()
            .is_err());
        assert!(MqServerConfig::default()
            .with_worker_backoff(Duration::from_secs(2), Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_environment() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert!(Environment::from_env().is_production());
        });
        temp_env::with_var_unset("APP_ENV", || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }
}
