//! Broker configuration.
//!
//! Configuration is consumed at construction time. It can be built in code,
//! deserialized by the host application, or loaded from environment
//! variables with defaults suitable for local development.

use crate::error::{BrokerError, BrokerResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which provider backs the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process, best-effort
    #[default]
    Memory,
    /// Redis Streams, durable at-least-once
    #[serde(alias = "networked-stream")]
    Redis,
    /// PostgreSQL polling
    #[serde(alias = "sql-polling")]
    Postgres,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Memory => "memory",
            ProviderKind::Redis => "redis",
            ProviderKind::Postgres => "postgres",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(ProviderKind::Memory),
            "redis" | "networked-stream" => Ok(ProviderKind::Redis),
            "postgres" | "sql-polling" => Ok(ProviderKind::Postgres),
            other => Err(BrokerError::ConfigError(format!("unknown provider: {other}"))),
        }
    }
}

/// How published events are dispatched to handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Handlers run on the publishing caller
    Sync,
    /// Handlers run on the worker pool
    #[default]
    Async,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeliveryMode::Sync => "sync",
            DeliveryMode::Async => "async",
        })
    }
}

impl FromStr for DeliveryMode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(DeliveryMode::Sync),
            "async" => Ok(DeliveryMode::Async),
            other => Err(BrokerError::ConfigError(format!("unknown mode: {other}"))),
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Storage/transport backend
    pub provider: ProviderKind,

    /// Dispatch mode
    pub mode: DeliveryMode,

    /// Concurrent workers in async mode
    pub worker_count: usize,

    /// Worker pool queue capacity
    pub buffer_size: usize,

    /// Identifier of this process, stamped on produced events
    pub instance_id: String,

    /// Per-handler retry policy
    pub retry_policy: RetryPolicy,

    /// Deadline for draining the worker pool on stop
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// In-memory provider settings
    pub memory: MemoryConfig,

    /// Redis provider settings
    pub redis: RedisConfig,

    /// PostgreSQL provider settings
    pub postgres: PostgresConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Memory,
            mode: DeliveryMode::Async,
            worker_count: 10,
            buffer_size: 1000,
            instance_id: default_instance_id(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
            postgres: PostgresConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EVENT_BROKER_PROVIDER`: `memory`, `redis`/`networked-stream`, `postgres`/`sql-polling`
    /// - `EVENT_BROKER_MODE`: `sync` or `async` (default: async)
    /// - `EVENT_BROKER_WORKER_COUNT`: Worker count (default: 10)
    /// - `EVENT_BROKER_BUFFER_SIZE`: Queue capacity (default: 1000)
    /// - `EVENT_BROKER_INSTANCE_ID`: Instance identifier (default: host name)
    /// - `EVENT_BROKER_MAX_RETRIES`: Retries per handler (default: 3)
    /// - `EVENT_BROKER_INITIAL_DELAY_MS`: First retry delay (default: 100)
    /// - `EVENT_BROKER_MAX_DELAY_MS`: Retry delay cap (default: 10000)
    /// - `EVENT_BROKER_BACKOFF_FACTOR`: Backoff multiplier (default: 2.0)
    /// - `EVENT_BROKER_SHUTDOWN_TIMEOUT_MS`: Stop deadline (default: 30000)
    /// - `EVENT_BROKER_MAX_EVENTS`: In-memory capacity (default: 10000)
    /// - `REDIS_URL`: Redis connection URL
    /// - `DATABASE_URL`: PostgreSQL connection URL
    pub fn from_env() -> BrokerResult<Self> {
        let default = Self::default();

        let provider = match std::env::var("EVENT_BROKER_PROVIDER") {
            Ok(v) => v.parse()?,
            Err(_) => default.provider,
        };
        let mode = match std::env::var("EVENT_BROKER_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => default.mode,
        };

        Ok(Self {
            provider,
            mode,
            worker_count: env_parse("EVENT_BROKER_WORKER_COUNT", default.worker_count),
            buffer_size: env_parse("EVENT_BROKER_BUFFER_SIZE", default.buffer_size),
            instance_id: std::env::var("EVENT_BROKER_INSTANCE_ID").unwrap_or(default.instance_id),
            retry_policy: RetryPolicy {
                max_retries: env_parse("EVENT_BROKER_MAX_RETRIES", default.retry_policy.max_retries),
                initial_delay: env_millis(
                    "EVENT_BROKER_INITIAL_DELAY_MS",
                    default.retry_policy.initial_delay,
                ),
                max_delay: env_millis("EVENT_BROKER_MAX_DELAY_MS", default.retry_policy.max_delay),
                backoff_factor: env_parse(
                    "EVENT_BROKER_BACKOFF_FACTOR",
                    default.retry_policy.backoff_factor,
                ),
            },
            shutdown_timeout: env_millis("EVENT_BROKER_SHUTDOWN_TIMEOUT_MS", default.shutdown_timeout),
            memory: MemoryConfig {
                max_events: env_parse("EVENT_BROKER_MAX_EVENTS", default.memory.max_events),
                ..default.memory
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL").unwrap_or(default.redis.url),
                ..default.redis
            },
            postgres: PostgresConfig {
                url: std::env::var("DATABASE_URL").unwrap_or(default.postgres.url),
                ..default.postgres
            },
        })
    }

    /// Validate the configuration before constructing a broker.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size", "must be at least 1"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(invalid("instance_id", "must not be empty"));
        }
        if self.retry_policy.backoff_factor < 1.0 {
            return Err(invalid("retry_policy.backoff_factor", "must be >= 1.0"));
        }
        if self.retry_policy.initial_delay > self.retry_policy.max_delay {
            return Err(invalid(
                "retry_policy.initial_delay",
                "must not exceed max_delay",
            ));
        }
        match self.provider {
            ProviderKind::Memory if self.memory.max_events == 0 => {
                Err(invalid("memory.max_events", "must be at least 1"))
            }
            ProviderKind::Redis if self.redis.url.is_empty() => {
                Err(invalid("redis.url", "is required"))
            }
            ProviderKind::Postgres if self.postgres.url.is_empty() => {
                Err(invalid("postgres.url", "is required"))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum retained events; the oldest insertion is evicted first
    pub max_events: usize,

    /// Age after which terminal events are removed by cleanup
    #[serde(with = "duration_ms")]
    pub max_age: Duration,

    /// Cleanup pass interval (zero disables the background pass)
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,

    /// Per-stream buffer; deliveries to a full buffer are dropped
    pub stream_buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            stream_buffer: 100,
        }
    }
}

/// Redis Streams provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Prefix for all Redis keys
    pub key_prefix: String,

    /// Approximate stream length cap (MAXLEN ~)
    pub stream_max_len: usize,

    /// Consumer group base name
    pub consumer_group: String,

    /// XREADGROUP block time in milliseconds
    pub block_ms: usize,

    /// Maximum entries per read
    pub read_count: usize,

    /// Buffer between the consumer loop and the stream reader
    pub stream_buffer: usize,

    /// Interval of the pass pruning side keys of trimmed entries
    /// (zero disables the background pass)
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "event_broker".to_string(),
            stream_max_len: 100_000,
            consumer_group: "event_broker".to_string(),
            block_ms: 1000,
            read_count: 100,
            stream_buffer: 100,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// PostgreSQL polling provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Connection URL (e.g., postgres://localhost/events)
    pub url: String,

    /// Prefix for table names
    pub table_prefix: String,

    /// Connection pool size
    pub max_connections: u32,

    /// Interval between polls for new events
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Maximum rows fetched per poll
    pub batch_size: i64,

    /// Age after which terminal events are deleted
    #[serde(with = "duration_ms")]
    pub max_age: Duration,

    /// Retention pass interval (zero disables the background pass)
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,

    /// Create tables on connect
    pub auto_migrate: bool,

    /// Buffer between the poll loop and the stream reader
    pub stream_buffer: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/event_broker".to_string(),
            table_prefix: "broker".to_string(),
            max_connections: 5,
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            auto_migrate: true,
            stream_buffer: 100,
        }
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Host name, falling back to a random ID.
pub fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn invalid(key: &str, message: &str) -> BrokerError {
    BrokerError::ConfigError(format!("{key} {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.provider, ProviderKind::Memory);
        assert_eq!(config.mode, DeliveryMode::Async);
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.buffer_size, 1000);
        assert!(!config.instance_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_provider_kind_aliases() {
        assert_eq!("networked-stream".parse::<ProviderKind>().unwrap(), ProviderKind::Redis);
        assert_eq!("sql-polling".parse::<ProviderKind>().unwrap(), ProviderKind::Postgres);
        assert_eq!("Memory".parse::<ProviderKind>().unwrap(), ProviderKind::Memory);
        assert!("kafka".parse::<ProviderKind>().is_err());
        assert!("parallel".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = BrokerConfig::default();
        config.worker_count = 0;
        assert!(matches!(config.validate(), Err(BrokerError::ConfigError(_))));

        let mut config = BrokerConfig::default();
        config.retry_policy.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.retry_policy.initial_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.provider = ProviderKind::Redis;
        config.redis.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: BrokerConfig = serde_json::from_value(serde_json::json!({
            "provider": "sql-polling",
            "mode": "sync",
            "worker_count": 5,
            "retry_policy": {
                "max_retries": 2,
                "initial_delay": 50,
                "max_delay": 1000,
                "backoff_factor": 3.0
            },
            "redis": { "cleanup_interval": 0 }
        }))
        .unwrap();

        assert_eq!(config.provider, ProviderKind::Postgres);
        assert_eq!(config.mode, DeliveryMode::Sync);
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.retry_policy.initial_delay, Duration::from_millis(50));
        assert_eq!(config.retry_policy.max_delay, Duration::from_secs(1));
        assert!(config.redis.cleanup_interval.is_zero());
        assert_eq!(config.redis.key_prefix, "event_broker");
    }
}
