//! Configuration types for courierq.
//!
//! The queue core reads a map shaped like
//!
//! ```toml
//! [queue]
//! default = "database"
//!
//! [queue.connections.database]
//! driver = "database"
//! url = "sqlite://jobs.db"
//!
//! [queue.connections.sqs]
//! driver = "sqs"
//! prefix = "https://sqs.eu-west-1.amazonaws.com/123456789012"
//! region = "eu-west-1"
//! ```
//!
//! Each connection entry is handed untouched to the adapter factory named by
//! its `driver` key (or, without one, by the connection name), which
//! deserializes it into one of the backend structs below.

use crate::error::{CourierError, CourierResult};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a courierq process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Backend connections
    #[serde(default)]
    pub queue: QueueSettings,

    /// Worker loop settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Where failed payloads are quarantined
    #[serde(default)]
    pub cache: Option<CacheConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CourierConfig {
    /// Load configuration from a TOML file and `COURIERQ_*` environment variables.
    ///
    /// Nested keys are separated by a double underscore, so
    /// `COURIERQ_QUEUE__DEFAULT=sync` overrides `queue.default`.
    pub fn load(path: impl AsRef<Path>) -> CourierResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("COURIERQ_").split("__")),
        )
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> CourierResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> CourierResult<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| CourierError::config(format!("failed to load configuration: {e}")))?;
        config
            .validate()
            .map_err(|errors| CourierError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.queue.default.trim().is_empty() {
            errors.push("queue.default must name a connection".to_string());
        }

        if self.worker.queue.trim().is_empty() {
            errors.push("worker.queue must not be empty".to_string());
        }

        if self.worker.error_backoff_max_ms == 0 {
            errors.push("worker.error_backoff_max_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Connection map: which backend is the default and how each one is set up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Name of the connection used when none is selected explicitly
    #[serde(default = "default_connection")]
    pub default: String,

    /// Backend parameters keyed by connection name
    #[serde(default)]
    pub connections: HashMap<String, serde_json::Value>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default: default_connection(),
            connections: HashMap::new(),
        }
    }
}

impl QueueSettings {
    /// Settings whose default connection is `name`.
    pub fn with_default(name: impl Into<String>) -> Self {
        Self {
            default: name.into(),
            ..Default::default()
        }
    }

    /// Add or replace a connection entry.
    pub fn with_connection(mut self, name: impl Into<String>, config: serde_json::Value) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    /// Look up the raw entry for a connection.
    pub fn connection(&self, name: &str) -> CourierResult<&serde_json::Value> {
        self.connections.get(name).ok_or_else(|| {
            CourierError::config(format!(
                "missing configuration key `connections.{name}`"
            ))
        })
    }

    /// Driver registered for a connection: its `driver` key, or its name.
    pub fn driver_of(&self, name: &str) -> CourierResult<String> {
        let entry = self.connection(name)?;
        match entry.get("driver") {
            None => Ok(name.to_string()),
            Some(serde_json::Value::String(driver)) => Ok(driver.clone()),
            Some(other) => Err(CourierError::config(format!(
                "`connections.{name}.driver` must be a string, got {other}"
            ))),
        }
    }
}

fn default_connection() -> String {
    "sync".to_string()
}

/// Deserialize a backend sub-config, naming the connection on failure.
pub fn parse_backend_config<T: DeserializeOwned>(
    connection: &str,
    config: &serde_json::Value,
) -> CourierResult<T> {
    serde_json::from_value(config.clone()).map_err(|e| {
        CourierError::config(format!("invalid `connections.{connection}` settings: {e}"))
    })
}

/// Database backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection string, e.g. `sqlite://jobs.db?mode=rwc`
    pub url: String,

    /// Jobs table name
    #[serde(default = "default_table")]
    pub table: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Seconds a worker sleeps after an empty poll
    #[serde(default = "default_database_sleep")]
    pub sleep_secs: u64,

    /// Seconds after which a reserved row is handed to another worker
    #[serde(default = "default_reservation_timeout")]
    pub reservation_timeout_secs: u64,

    /// Create the jobs table on first use
    #[serde(default)]
    pub auto_install: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: default_table(),
            pool_size: default_pool_size(),
            sleep_secs: default_database_sleep(),
            reservation_timeout_secs: default_reservation_timeout(),
            auto_install: false,
        }
    }

    /// Create the jobs table on first use.
    pub fn with_auto_install(mut self) -> Self {
        self.auto_install = true;
        self
    }

    /// Set the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the reservation timeout.
    pub fn with_reservation_timeout(mut self, timeout_secs: u64) -> Self {
        self.reservation_timeout_secs = timeout_secs;
        self
    }

    pub(crate) fn validate(&self) -> CourierResult<()> {
        if self.url.trim().is_empty() {
            return Err(CourierError::config("database url must not be empty"));
        }
        let valid_table = !self.table.is_empty()
            && self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_table {
            return Err(CourierError::config(format!(
                "invalid table name '{}': only ASCII letters, digits and '_' are allowed",
                self.table
            )));
        }
        if self.pool_size == 0 {
            return Err(CourierError::config("database pool_size must be greater than 0"));
        }
        if self.reservation_timeout_secs == 0 {
            return Err(CourierError::config(
                "reservation_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn default_table() -> String {
    "queue_jobs".to_string()
}

const fn default_pool_size() -> u32 {
    5
}

const fn default_database_sleep() -> u64 {
    3
}

const fn default_reservation_timeout() -> u64 {
    90
}

/// Cloud queue (SQS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqsConfig {
    /// Queue URL prefix; the queue name is appended, e.g.
    /// `https://sqs.us-east-1.amazonaws.com/123456789012`
    pub prefix: String,

    /// AWS region
    pub region: String,

    /// Access key id. Falls back to the default credential chain when unset.
    #[serde(default)]
    pub key: Option<String>,

    /// Secret access key
    #[serde(default)]
    pub secret: Option<String>,

    /// Custom endpoint, for LocalStack and similar
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Long-poll wait in seconds (0-20)
    #[serde(default = "default_wait_time")]
    pub wait_time_secs: u64,

    /// Visibility timeout for received messages, in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

impl SqsConfig {
    pub(crate) fn validate(&self) -> CourierResult<()> {
        if self.prefix.trim().is_empty() {
            return Err(CourierError::config("sqs prefix must not be empty"));
        }
        if self.region.trim().is_empty() {
            return Err(CourierError::config("sqs region must not be empty"));
        }
        match (&self.key, &self.secret) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(CourierError::config(
                    "sqs credentials need both `key` and `secret`",
                ));
            }
            _ => {}
        }
        if self.wait_time_secs > 20 {
            return Err(CourierError::config("sqs wait_time_secs must be at most 20"));
        }
        if self.visibility_timeout_secs == 0 || self.visibility_timeout_secs > 43_200 {
            return Err(CourierError::config(
                "sqs visibility_timeout_secs must be between 1 and 43200",
            ));
        }
        Ok(())
    }
}

const fn default_wait_time() -> u64 {
    20
}

const fn default_visibility_timeout() -> u64 {
    30
}

/// In-process cloud-queue emulation, for development and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQueueConfig {
    /// Long-poll wait in milliseconds
    #[serde(default = "default_memory_wait")]
    pub wait_time_ms: u64,

    /// Visibility timeout for received messages, in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Maximum number of stored messages (0 = unlimited)
    #[serde(default)]
    pub max_queue_size: usize,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            wait_time_ms: default_memory_wait(),
            visibility_timeout_secs: default_visibility_timeout(),
            max_queue_size: 0,
        }
    }
}

const fn default_memory_wait() -> u64 {
    250
}

/// Beanstalk daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeanstalkConfig {
    /// Daemon host
    #[serde(default = "default_beanstalk_host")]
    pub host: String,

    /// Daemon port
    #[serde(default = "default_beanstalk_port")]
    pub port: u16,

    /// Time-to-run in seconds; the daemon releases a reservation after it
    #[serde(default = "default_ttr")]
    pub ttr_secs: u32,

    /// How long `reserve-with-timeout` blocks, in seconds
    #[serde(default = "default_reserve_timeout")]
    pub reserve_timeout_secs: u32,

    /// Seconds allowed for connecting
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for BeanstalkConfig {
    fn default() -> Self {
        Self {
            host: default_beanstalk_host(),
            port: default_beanstalk_port(),
            ttr_secs: default_ttr(),
            reserve_timeout_secs: default_reserve_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl BeanstalkConfig {
    /// `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn validate(&self) -> CourierResult<()> {
        if self.host.trim().is_empty() {
            return Err(CourierError::config("beanstalk host must not be empty"));
        }
        if self.ttr_secs == 0 {
            return Err(CourierError::config("beanstalk ttr_secs must be greater than 0"));
        }
        Ok(())
    }
}

fn default_beanstalk_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_beanstalk_port() -> u16 {
    11300
}

const fn default_ttr() -> u32 {
    60
}

const fn default_reserve_timeout() -> u32 {
    5
}

const fn default_connect_timeout() -> u64 {
    5
}

/// Failed-job cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Keep failed payloads in process memory
    Memory,

    /// Store failed payloads in Redis
    #[cfg(feature = "redis-cache")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-cache")))]
    Redis(RedisCacheConfig),
}

/// Redis cache configuration.
#[cfg(feature = "redis-cache")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-cache")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub url: String,

    /// Key prefix
    #[serde(default)]
    pub prefix: String,

    /// Expiry for quarantined payloads, in seconds
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue the worker watches
    #[serde(default = "default_worker_queue")]
    pub queue: String,

    /// Retry ceiling applied to every job; `None` keeps each job's own budget
    #[serde(default)]
    pub retry: Option<u32>,

    /// Override the adapter's sleep between empty polls (milliseconds)
    #[serde(default)]
    pub idle_sleep_ms: Option<u64>,

    /// Upper bound for the backoff after backend errors (milliseconds)
    #[serde(default = "default_error_backoff_max")]
    pub error_backoff_max_ms: u64,

    /// Stop after this many jobs have been handled
    #[serde(default)]
    pub max_jobs: Option<u64>,

    /// Stop at the first empty poll
    #[serde(default)]
    pub stop_when_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: default_worker_queue(),
            retry: None,
            idle_sleep_ms: None,
            error_backoff_max_ms: default_error_backoff_max(),
            max_jobs: None,
            stop_when_empty: false,
        }
    }
}

impl WorkerConfig {
    /// Worker configuration for a given queue.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// Set the retry ceiling.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the idle sleep.
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep_ms = Some(sleep.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    /// Stop after `max_jobs` jobs.
    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    /// Stop at the first empty poll.
    pub fn stop_when_empty(mut self) -> Self {
        self.stop_when_empty = true;
        self
    }
}

fn default_worker_queue() -> String {
    crate::job::DEFAULT_QUEUE.to_string()
}

const fn default_error_backoff_max() -> u64 {
    30_000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default)]
    pub level: LogLevel,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    #[serde(default = "default_true")]
    pub colored: bool,

    /// Include target module in logs
    #[serde(default)]
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(CourierError::config(format!("unknown log level '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert_eq!(config.queue.default, "sync");
        assert_eq!(config.worker.queue, "default");
        assert!(config.cache.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = CourierConfig::from_toml_str(
            r#"
            [queue]
            default = "jobs"

            [queue.connections.jobs]
            driver = "database"
            url = "sqlite::memory:"
            table = "my_jobs"

            [worker]
            queue = "emails"
            retry = 2

            [cache]
            driver = "memory"

            [logging]
            level = "debug"
            json_format = true
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.default, "jobs");
        assert_eq!(config.queue.driver_of("jobs").unwrap(), "database");
        assert_eq!(config.worker.queue, "emails");
        assert_eq!(config.worker.retry, Some(2));
        assert!(matches!(config.cache, Some(CacheConfig::Memory)));
        assert_eq!(config.logging.level, LogLevel::Debug);

        let db: DatabaseConfig =
            parse_backend_config("jobs", config.queue.connection("jobs").unwrap()).unwrap();
        assert_eq!(db.table, "my_jobs");
        assert_eq!(db.reservation_timeout_secs, 90);
        assert_eq!(db.sleep_secs, 3);
    }

    #[test]
    fn test_missing_connection_names_key() {
        let settings = QueueSettings::with_default("sync");
        let err = settings.connection("sync").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("connections.sync"));
    }

    #[test]
    fn test_driver_defaults_to_connection_name() {
        let settings = QueueSettings::default()
            .with_connection("sync", json!({}))
            .with_connection("bulk", json!({"driver": "database", "url": "sqlite::memory:"}))
            .with_connection("broken", json!({"driver": 7}));

        assert_eq!(settings.driver_of("sync").unwrap(), "sync");
        assert_eq!(settings.driver_of("bulk").unwrap(), "database");
        assert!(settings.driver_of("broken").is_err());
    }

    #[test]
    fn test_database_config_validation() {
        assert!(DatabaseConfig::new("sqlite::memory:").validate().is_ok());
        assert!(DatabaseConfig::new("").validate().is_err());
        assert!(
            DatabaseConfig::new("sqlite::memory:")
                .with_table("jobs; DROP TABLE users")
                .validate()
                .is_err()
        );
        assert!(
            DatabaseConfig::new("sqlite::memory:")
                .with_reservation_timeout(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_sqs_config_requires_both_credentials() {
        let config: SqsConfig = parse_backend_config(
            "sqs",
            &json!({"prefix": "https://sqs.local/000", "region": "us-east-1", "key": "AKIA"}),
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("secret"));

        let missing_region = parse_backend_config::<SqsConfig>(
            "sqs",
            &json!({"prefix": "https://sqs.local/000"}),
        );
        assert!(missing_region.is_err());
    }

    #[test]
    fn test_worker_config_builders() {
        let config = WorkerConfig::for_queue("emails")
            .with_retry(4)
            .with_idle_sleep(Duration::from_millis(250))
            .with_max_jobs(10)
            .stop_when_empty();

        assert_eq!(config.queue, "emails");
        assert_eq!(config.retry, Some(4));
        assert_eq!(config.idle_sleep_ms, Some(250));
        assert_eq!(config.max_jobs, Some(10));
        assert!(config.stop_when_empty);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = CourierConfig::from_toml_str("[queue]\ndefault = \"\"\n").unwrap_err();
        assert!(err.is_configuration());
    }
}
