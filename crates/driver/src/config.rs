//! Driver configuration
//!
//! Immutable for the lifetime of a [`Driver`](crate::Driver). Every component
//! reads from the same [`DriverConfig`] handed to it at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A field has a value the driver cannot run with
    #[error("invalid driver configuration: {0}")]
    Invalid(String),
}

/// Driver configuration
///
/// # Example
///
/// ```
/// use conductor_driver::DriverConfig;
/// use std::time::Duration;
///
/// let config = DriverConfig::default()
///     .with_poll_size(500)
///     .with_batch_size(10)
///     .with_expiry_threshold(Duration::from_secs(120));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    /// Maximum identifiers requested per fetch
    pub poll_size: usize,

    /// Identifiers per submitted batch
    pub batch_size: usize,

    /// Registry size at which the fetcher stops taking new work
    pub queue_threshold: usize,

    /// Delay after a partial page
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Delay after several consecutive cycles without new work
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,

    /// Delay before requesting the next page after a full one
    #[serde(with = "duration_millis")]
    pub next_page_delay: Duration,

    /// Consecutive empty cycles tolerated before switching to `cooldown`
    pub empty_cycles_before_cooldown: u32,

    /// Singleton retry attempts allowed after a call-level failure
    pub retry_count: u32,

    /// Age after which a registry entry is released for re-fetch
    #[serde(with = "duration_millis")]
    pub expiry_threshold: Duration,

    /// Worker slots per active backend node
    pub threads_per_host: usize,

    /// Upper bound on the pool size
    pub max_thread_count: usize,

    /// Fixed pool size; disables adaptive scaling when set
    pub fixed_thread_count: Option<usize>,

    /// How often the capacity controller queries the backend
    #[serde(with = "duration_millis")]
    pub capacity_interval: Duration,

    /// How often throughput is reported
    #[serde(with = "duration_millis")]
    pub metrics_interval: Duration,

    /// Upper bound on one dispatcher tick's wait for results
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Comma-separated state machine names to restrict fetching to
    pub names: Option<String>,

    /// Comma-separated execution statuses to fetch (remote default: new, working)
    pub status: Option<String>,

    /// Target seeding loop, disabled when absent
    pub seeder: Option<SeederConfig>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_size: 1000,
            batch_size: 5,
            queue_threshold: 20_000,
            poll_interval: Duration::from_millis(1000),
            cooldown: Duration::from_millis(5000),
            next_page_delay: Duration::from_millis(10),
            empty_cycles_before_cooldown: 3,
            retry_count: 3,
            expiry_threshold: Duration::from_secs(600),
            threads_per_host: 16,
            max_thread_count: 128,
            fixed_thread_count: None,
            capacity_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_millis(5000),
            tick_interval: Duration::from_millis(10),
            names: None,
            status: None,
            seeder: None,
        }
    }
}

impl DriverConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_size(mut self, size: usize) -> Self {
        self.poll_size = size;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_queue_threshold(mut self, threshold: usize) -> Self {
        self.queue_threshold = threshold;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_next_page_delay(mut self, delay: Duration) -> Self {
        self.next_page_delay = delay;
        self
    }

    pub fn with_empty_cycles_before_cooldown(mut self, cycles: u32) -> Self {
        self.empty_cycles_before_cooldown = cycles;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_expiry_threshold(mut self, threshold: Duration) -> Self {
        self.expiry_threshold = threshold;
        self
    }

    pub fn with_threads_per_host(mut self, threads: usize) -> Self {
        self.threads_per_host = threads;
        self
    }

    pub fn with_max_thread_count(mut self, max: usize) -> Self {
        self.max_thread_count = max;
        self
    }

    /// Pin the pool size. Values `<= 0` in the host's configuration map to `None`.
    pub fn with_fixed_thread_count(mut self, count: Option<usize>) -> Self {
        self.fixed_thread_count = count;
        self
    }

    pub fn with_capacity_interval(mut self, interval: Duration) -> Self {
        self.capacity_interval = interval;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_names(mut self, names: impl Into<String>) -> Self {
        self.names = Some(names.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_seeder(mut self, seeder: SeederConfig) -> Self {
        self.seeder = Some(seeder);
        self
    }

    /// Whether the pool size is pinned
    pub fn uses_fixed_thread_count(&self) -> bool {
        self.fixed_thread_count.is_some()
    }

    /// Pool size before the first capacity observation
    pub fn initial_pool_size(&self) -> usize {
        self.fixed_thread_count.unwrap_or(self.threads_per_host)
    }

    /// Status filter split into its individual values
    pub fn status_filter(&self) -> Vec<String> {
        split_list(self.status.as_deref())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("poll_size", self.poll_size),
            ("batch_size", self.batch_size),
            ("queue_threshold", self.queue_threshold),
            ("threads_per_host", self.threads_per_host),
            ("max_thread_count", self.max_thread_count),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than 0")));
            }
        }
        if self.retry_count == 0 {
            return Err(ConfigError::Invalid(
                "retry_count must be greater than 0".into(),
            ));
        }
        if self.fixed_thread_count == Some(0) {
            return Err(ConfigError::Invalid(
                "fixed_thread_count must be greater than 0 when set".into(),
            ));
        }
        let intervals = [
            ("tick_interval", self.tick_interval),
            ("metrics_interval", self.metrics_interval),
            ("capacity_interval", self.capacity_interval),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
            }
        }
        if let Some(seeder) = &self.seeder {
            seeder.validate()?;
        }
        Ok(())
    }
}

/// Target seeding configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeederConfig {
    /// State machine whose targets receive new executions
    pub state_machine: String,

    /// Targets requested per page
    pub page_size: usize,

    /// Delay after a partial page
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Delay after several consecutive cycles without new targets
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
}

impl SeederConfig {
    pub fn new(state_machine: impl Into<String>) -> Self {
        Self {
            state_machine: state_machine.into(),
            page_size: 1000,
            interval: Duration::from_millis(1000),
            cooldown: Duration::from_millis(5000),
        }
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.state_machine.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "seeder state_machine must not be empty".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid(
                "seeder page_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.poll_size, 1000);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.queue_threshold, 20_000);
        assert_eq!(config.threads_per_host, 16);
        assert_eq!(config.max_thread_count, 128);
        assert_eq!(config.retry_count, 3);
        assert!(!config.uses_fixed_thread_count());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_pool_size() {
        let adaptive = DriverConfig::default().with_threads_per_host(8);
        assert_eq!(adaptive.initial_pool_size(), 8);

        let fixed = adaptive.with_fixed_thread_count(Some(3));
        assert_eq!(fixed.initial_pool_size(), 3);
        assert!(fixed.uses_fixed_thread_count());
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        assert!(DriverConfig::default().with_batch_size(0).validate().is_err());
        assert!(DriverConfig::default().with_poll_size(0).validate().is_err());
        assert!(DriverConfig::default().with_retry_count(0).validate().is_err());
        assert!(DriverConfig::default()
            .with_fixed_thread_count(Some(0))
            .validate()
            .is_err());
        assert!(DriverConfig::default()
            .with_seeder(SeederConfig::new("  "))
            .validate()
            .is_err());
        assert!(DriverConfig::default()
            .with_metrics_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_status_filter() {
        let config = DriverConfig::default().with_status("new, working,,failed");
        assert_eq!(config.status_filter(), vec!["new", "working", "failed"]);
        assert!(DriverConfig::default().status_filter().is_empty());
    }

    #[test]
    fn test_serialization() {
        let config = DriverConfig::default()
            .with_cooldown(Duration::from_millis(250))
            .with_seeder(SeederConfig::new("orders"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"cooldown\":250"));
        let parsed: DriverConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config, parsed);
    }
}
