//! Configuration for the synchronizer.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Synchronizer configuration.
///
/// Built with [`SyncConfig::default`] and the `with_*` methods, or loaded
/// from `TETHER_*` environment variables with [`SyncConfig::from_env`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Identity of this instance; generated and persisted when absent
    pub instance_id: Option<String>,
    /// Time between scheduled sync passes
    pub sync_interval: Duration,
    /// Upper bound for any single remote call
    pub operation_timeout: Duration,
    /// Capacity of the buffer between stream consumers and the sync pass
    pub stream_buffer_size: usize,
    /// Pending writes pushed concurrently during one pass
    pub max_concurrent_writes: usize,
    /// Backoff applied when a change stream fails or closes
    pub stream_retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            sync_interval: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(30),
            stream_buffer_size: 1024,
            max_concurrent_writes: 8,
            stream_retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.instance_id = env::var("TETHER_INSTANCE_ID")
            .ok()
            .filter(|id| !id.is_empty());

        if let Some(ms) = parse_var::<u64>("TETHER_SYNC_INTERVAL_MS")? {
            config.sync_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("TETHER_OPERATION_TIMEOUT_MS")? {
            config.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var("TETHER_STREAM_BUFFER")? {
            config.stream_buffer_size = size;
        }
        if let Some(n) = parse_var("TETHER_MAX_CONCURRENT_WRITES")? {
            config.max_concurrent_writes = n;
        }
        if let Some(ms) = parse_var::<u64>("TETHER_STREAM_RETRY_MS")? {
            config.stream_retry.initial_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    pub fn with_max_concurrent_writes(mut self, n: usize) -> Self {
        self.max_concurrent_writes = n;
        self
    }

    pub fn with_stream_retry(mut self, retry: RetryConfig) -> Self {
        self.stream_retry = retry;
        self
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "sync_interval",
                value: "0".into(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "operation_timeout",
                value: "0".into(),
            });
        }
        if self.stream_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "stream_buffer_size",
                value: "0".into(),
            });
        }
        if self.max_concurrent_writes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_writes",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Exponential backoff for change stream reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first reconnect
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Constant delay between reconnects.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let delay_nanos = self.initial_delay.as_nanos() as f64 * factor;
        if !delay_nanos.is_finite() || delay_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(delay_nanos as u64)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
