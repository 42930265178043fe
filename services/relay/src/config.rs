//! Relay service configuration loading.
//!
//! TOML is the sole config source.  Every field is optional and falls back to
//! a default, so an absent config file yields a fully usable local setup
//! (Redis on localhost, SQLite next to the binary, HTTP on 127.0.0.1:8081).
//!
//! Default config path: `./relay.toml`; override with the `RELAY_CONFIG`
//! environment variable.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tracing filter, e.g. `"info"` or `"relay=debug,info"`.
    pub log_level: String,
    pub redis: RedisConfig,
    pub consumer: ConsumerConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
    pub db: i64,
    pub dial_timeout: Duration,
    pub max_retries: usize,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream the producer appends to.
    pub stream_name: String,
    /// Consumer group identifying this deployment; replicas in the same
    /// group load-balance, distinct groups each see the full stream.
    pub group: String,
    /// Consumer name within the group; empty means generate one at startup.
    pub name: String,
    /// Max wait per XREADGROUP.
    pub block_time: Duration,
    /// Idle threshold for claiming pending entries from dead consumers.
    pub claim_min_idle_time: Duration,
    /// Delay before retrying after a nacked message.
    pub nack_resend_sleep: Duration,
    /// Batch ack interval (entries per XACK).
    pub commit_offset_after: usize,
    /// Per-message processing deadline across all handlers.
    pub ack_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub listen_addr: String,
    /// Optional UI asset directory served on the router fallback.
    pub static_files_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Rehydrate in-memory state from the latest run in the DB at startup.
    pub reload_session: bool,
    /// EventManager ring capacity.
    pub max_event_history: usize,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    log_level: Option<String>,
    redis: Option<RawRedisConfig>,
    consumer: Option<RawConsumerConfig>,
    storage: Option<RawStorageConfig>,
    http: Option<RawHttpConfig>,
    state: Option<RawStateConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRedisConfig {
    url: Option<String>,
    password: Option<String>,
    db: Option<i64>,
    dial_timeout_ms: Option<u64>,
    max_retries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConsumerConfig {
    stream_name: Option<String>,
    group: Option<String>,
    name: Option<String>,
    block_time_ms: Option<u64>,
    claim_min_idle_time_ms: Option<u64>,
    nack_resend_sleep_ms: Option<u64>,
    commit_offset_after: Option<usize>,
    ack_wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageConfig {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttpConfig {
    listen_addr: Option<String>,
    static_files_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStateConfig {
    reload_session: Option<bool>,
    max_event_history: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    resolve(raw)
}

/// The all-defaults configuration (no config file present).
pub fn default_config() -> RelayConfig {
    resolve(RawConfig::default()).expect("defaults are valid")
}

fn resolve(raw: RawConfig) -> Result<RelayConfig, ConfigError> {
    let redis = raw.redis.unwrap_or_default();
    let consumer = raw.consumer.unwrap_or_default();
    let storage = raw.storage.unwrap_or_default();
    let http = raw.http.unwrap_or_default();
    let state = raw.state.unwrap_or_default();

    let commit_offset_after = consumer.commit_offset_after.unwrap_or(32);
    if commit_offset_after == 0 {
        return Err(ConfigError::InvalidValue(
            "consumer.commit_offset_after must be at least 1".to_owned(),
        ));
    }
    let max_event_history = state.max_event_history.unwrap_or(1000);
    if max_event_history == 0 {
        return Err(ConfigError::InvalidValue(
            "state.max_event_history must be at least 1".to_owned(),
        ));
    }

    Ok(RelayConfig {
        log_level: raw.log_level.unwrap_or_else(|| "info".to_owned()),
        redis: RedisConfig {
            url: redis
                .url
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned()),
            password: redis.password,
            db: redis.db.unwrap_or(0),
            dial_timeout: Duration::from_millis(redis.dial_timeout_ms.unwrap_or(5000)),
            max_retries: redis.max_retries.unwrap_or(3),
        },
        consumer: ConsumerConfig {
            stream_name: consumer
                .stream_name
                .unwrap_or_else(|| "agent_events".to_owned()),
            group: consumer.group.unwrap_or_else(|| "relay-service".to_owned()),
            name: consumer.name.unwrap_or_default(),
            block_time: Duration::from_millis(consumer.block_time_ms.unwrap_or(1000)),
            claim_min_idle_time: Duration::from_millis(
                consumer.claim_min_idle_time_ms.unwrap_or(60_000),
            ),
            nack_resend_sleep: Duration::from_millis(consumer.nack_resend_sleep_ms.unwrap_or(1000)),
            commit_offset_after,
            ack_wait: Duration::from_millis(consumer.ack_wait_ms.unwrap_or(30_000)),
        },
        storage: StorageConfig {
            db_path: storage
                .db_path
                .unwrap_or_else(|| PathBuf::from("relay.sqlite3")),
        },
        http: HttpConfig {
            listen_addr: http
                .listen_addr
                .unwrap_or_else(|| "127.0.0.1:8081".to_owned()),
            static_files_dir: http.static_files_dir,
        },
        state: StateConfig {
            reload_session: state.reload_session.unwrap_or(true),
            max_event_history,
        },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
