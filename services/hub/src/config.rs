//! Hub configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/herd/hub.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `upstream.endpoint`
//!
//! Everything else has a default; `sync.pong_timeout_secs` defaults to
//! twice the ping interval.

use herd_protocol::DEFAULT_PORT;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub schema_version: u32,
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Bind address for the peer listener.
    pub bind: String,
    /// Maximum concurrent peers; connections past the cap are dropped.
    pub max_peers: usize,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Address of the datastore watch endpoint.
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ping_interval: Duration,
    /// Window without a pong before a peer is considered dead.
    pub pong_timeout: Duration,
    /// Soft cap on one kvs frame's payload; a single update is never split.
    pub max_kvs_bytes: usize,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListenConfig>,
    upstream: Option<RawUpstreamConfig>,
    sync: Option<RawSyncConfig>,
}

#[derive(Debug, Deserialize)]
struct RawListenConfig {
    bind: Option<String>,
    max_peers: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawUpstreamConfig {
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSyncConfig {
    ping_interval_secs: Option<u64>,
    pong_timeout_secs: Option<u64>,
    max_kvs_bytes: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load hub config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<HubConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load hub config from the default path `/etc/herd/hub.toml`.
pub fn load_config() -> Result<HubConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/herd/hub.toml"))
}

/// Load hub config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<HubConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    // Listen defaults
    let listen = match raw.listen {
        Some(l) => ListenConfig {
            bind: l.bind.unwrap_or_else(default_bind),
            max_peers: l.max_peers.unwrap_or(512),
        },
        None => ListenConfig { bind: default_bind(), max_peers: 512 },
    };
    if listen.max_peers == 0 {
        return Err(ConfigError::InvalidValue("listen.max_peers must be at least 1".to_owned()));
    }

    // Validate upstream
    let raw_upstream = raw
        .upstream
        .ok_or_else(|| ConfigError::MissingField("upstream".to_owned()))?;
    let endpoint = raw_upstream
        .endpoint
        .ok_or_else(|| ConfigError::MissingField("upstream.endpoint".to_owned()))?;

    // Sync defaults; pong timeout follows the ping interval unless set.
    let (ping_interval_secs, pong_timeout_secs, max_kvs_bytes) = match raw.sync {
        Some(s) => {
            let ping = s.ping_interval_secs.unwrap_or(10);
            (ping, s.pong_timeout_secs.unwrap_or(ping * 2), s.max_kvs_bytes.unwrap_or(262_144))
        }
        None => (10, 20, 262_144),
    };
    if ping_interval_secs == 0 {
        return Err(ConfigError::InvalidValue("sync.ping_interval_secs must be at least 1".to_owned()));
    }
    if pong_timeout_secs < ping_interval_secs {
        return Err(ConfigError::InvalidValue(format!(
            "sync.pong_timeout_secs ({pong_timeout_secs}) must not be below the ping interval ({ping_interval_secs})"
        )));
    }
    if max_kvs_bytes == 0 {
        return Err(ConfigError::InvalidValue("sync.max_kvs_bytes must be at least 1".to_owned()));
    }

    Ok(HubConfig {
        schema_version,
        listen,
        upstream: UpstreamConfig { endpoint },
        sync: SyncConfig {
            ping_interval: Duration::from_secs(ping_interval_secs),
            pong_timeout: Duration::from_secs(pong_timeout_secs),
            max_kvs_bytes,
        },
    })
}

fn default_bind() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
