//! Command-line and environment configuration for the driver host

use std::time::Duration;

use clap::{Parser, ValueEnum};
use conductor_driver::{DriverConfig, HttpStoreConfig, SeederConfig};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "conductor-driverd")]
#[command(about = "Drives pending state-conductor executions through the data services")]
#[command(version)]
pub struct Cli {
    /// Data services host
    #[arg(long, env = "CONDUCTOR_HOST", default_value = "localhost")]
    pub host: String,

    /// Data services port
    #[arg(long, env = "CONDUCTOR_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Port of the app server accepting /v1/eval
    #[arg(long, env = "CONDUCTOR_APP_SERVICES_PORT", default_value_t = 8000)]
    pub app_services_port: u16,

    #[arg(long, env = "CONDUCTOR_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "CONDUCTOR_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// URL scheme for both app servers
    #[arg(long, env = "CONDUCTOR_SCHEME", default_value = "http", value_parser = ["http", "https"])]
    pub scheme: String,

    /// Database holding execution documents
    #[arg(
        long,
        env = "CONDUCTOR_EXECUTIONS_DATABASE",
        default_value = "state-conductor-executions"
    )]
    pub executions_database: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "CONDUCTOR_REQUEST_TIMEOUT", default_value_t = 60)]
    pub request_timeout: u64,

    /// Maximum identifiers requested per fetch
    #[arg(long, env = "CONDUCTOR_POLL_SIZE", default_value_t = 1000)]
    pub poll_size: usize,

    /// Identifiers per batch
    #[arg(long, env = "CONDUCTOR_BATCH_SIZE", default_value_t = 5)]
    pub batch_size: usize,

    /// In-progress count at which fetching pauses
    #[arg(long, env = "CONDUCTOR_QUEUE_THRESHOLD", default_value_t = 20_000)]
    pub queue_threshold: usize,

    /// Delay after a partial page, in milliseconds
    #[arg(long, env = "CONDUCTOR_POLL_INTERVAL", default_value_t = 1000)]
    pub poll_interval: u64,

    /// Delay after repeated cycles without new work, in milliseconds
    #[arg(long, env = "CONDUCTOR_COOLDOWN_MILLIS", default_value_t = 5000)]
    pub cooldown_millis: u64,

    /// Singleton retries after a failed batch call
    #[arg(long, env = "CONDUCTOR_RETRY_COUNT", default_value_t = 3)]
    pub retry_count: u32,

    /// Seconds before an unresolved identifier may be fetched again
    #[arg(long, env = "CONDUCTOR_EXPIRY_THRESHOLD_SECONDS", default_value_t = 600)]
    pub expiry_threshold_seconds: u64,

    /// Worker slots per active backend node
    #[arg(long, env = "CONDUCTOR_THREADS_PER_HOST", default_value_t = 16)]
    pub threads_per_host: usize,

    /// Upper bound on the worker pool
    #[arg(long, env = "CONDUCTOR_MAX_THREAD_COUNT", default_value_t = 128)]
    pub max_thread_count: usize,

    /// Fixed worker pool size; zero or negative keeps adaptive sizing
    #[arg(
        long,
        env = "CONDUCTOR_FIXED_THREAD_COUNT",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub fixed_thread_count: i64,

    /// Seconds between active node checks
    #[arg(long, env = "CONDUCTOR_CAPACITY_INTERVAL", default_value_t = 60)]
    pub capacity_interval: u64,

    /// Metrics report interval in milliseconds
    #[arg(long, env = "CONDUCTOR_METRICS_INTERVAL", default_value_t = 5000)]
    pub metrics_interval: u64,

    /// Comma-separated state machine names to process
    #[arg(long, env = "CONDUCTOR_NAMES")]
    pub names: Option<String>,

    /// Comma-separated execution statuses to process
    #[arg(long, env = "CONDUCTOR_STATUS")]
    pub status: Option<String>,

    /// State machine whose targets get executions created automatically
    #[arg(long, env = "CONDUCTOR_SEED_STATE_MACHINE")]
    pub seed_state_machine: Option<String>,

    /// Targets requested per seeding page
    #[arg(long, env = "CONDUCTOR_SEED_PAGE_SIZE", default_value_t = 1000)]
    pub seed_page_size: usize,

    /// Delay between seeding cycles in milliseconds
    #[arg(long, env = "CONDUCTOR_SEED_INTERVAL", default_value_t = 1000)]
    pub seed_interval: u64,

    /// Log output format
    #[arg(long, env = "CONDUCTOR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Driver settings described by the flags
    pub fn driver_config(&self) -> DriverConfig {
        let fixed = usize::try_from(self.fixed_thread_count)
            .ok()
            .filter(|count| *count > 0);

        let mut config = DriverConfig::default()
            .with_poll_size(self.poll_size)
            .with_batch_size(self.batch_size)
            .with_queue_threshold(self.queue_threshold)
            .with_poll_interval(Duration::from_millis(self.poll_interval))
            .with_cooldown(Duration::from_millis(self.cooldown_millis))
            .with_retry_count(self.retry_count)
            .with_expiry_threshold(Duration::from_secs(self.expiry_threshold_seconds))
            .with_threads_per_host(self.threads_per_host)
            .with_max_thread_count(self.max_thread_count)
            .with_fixed_thread_count(fixed)
            .with_capacity_interval(Duration::from_secs(self.capacity_interval))
            .with_metrics_interval(Duration::from_millis(self.metrics_interval));

        if let Some(names) = &self.names {
            config = config.with_names(names.clone());
        }
        if let Some(status) = &self.status {
            config = config.with_status(status.clone());
        }
        if let Some(state_machine) = &self.seed_state_machine {
            config = config.with_seeder(
                SeederConfig::new(state_machine.clone())
                    .with_page_size(self.seed_page_size)
                    .with_interval(Duration::from_millis(self.seed_interval))
                    .with_cooldown(Duration::from_millis(self.cooldown_millis)),
            );
        }
        config
    }

    /// Connection settings for the HTTP store
    pub fn store_config(&self) -> HttpStoreConfig {
        let mut config = HttpStoreConfig::new(format!("{}://{}:{}", self.scheme, self.host, self.port))
            .with_app_services_url(format!(
                "{}://{}:{}",
                self.scheme, self.host, self.app_services_port
            ))
            .with_database(self.executions_database.clone())
            .with_timeout(Duration::from_secs(self.request_timeout));

        if let Some(username) = &self.username {
            config = config.with_credentials(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }
        config
    }
}
