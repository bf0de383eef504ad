//! Configuration for nzb-dl
//!
//! The library does not load configuration from disk; collaborators construct
//! a [`Config`] (directly or via serde) and pass it to the coordinator. Every
//! field carries a serde default so partial documents deserialize cleanly.

use crate::error::{Error, QueueError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of server pools (bounded by the failed-pool bitmask width)
pub const MAX_POOLS: usize = 32;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server profiles, one per pool, in fill-order priority
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Reconnect/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Validate the configuration before the coordinator starts.
    ///
    /// Checks that at least one server is configured, the pool count fits the
    /// failed-pool mask, every server has at least one connection, and server
    /// names are unique (they key retry bookkeeping and status output).
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config {
                message: "at least one NNTP server must be configured".to_string(),
                key: Some("servers".to_string()),
            });
        }
        if self.servers.len() > MAX_POOLS {
            return Err(Error::Queue(QueueError::TooManyPools {
                count: self.servers.len(),
            }));
        }
        for server in &self.servers {
            if server.connections == 0 {
                return Err(Error::Config {
                    message: format!("server {} has zero connections", server.name),
                    key: Some("servers.connections".to_string()),
                });
            }
            if server.host.is_empty() {
                return Err(Error::Config {
                    message: format!("server {} has an empty host", server.name),
                    key: Some("servers.host".to_string()),
                });
            }
        }
        let mut names: Vec<&str> = self.servers.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.servers.len() {
            return Err(Error::Config {
                message: "server names must be unique".to_string(),
                key: Some("servers.name".to_string()),
            });
        }
        Ok(())
    }
}

/// One NNTP server profile (one pool)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable pool name used in logs and status output
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for AUTHINFO (None = no authentication)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default)]
    pub password: Option<String>,

    /// Number of concurrent connections to this server
    #[serde(default = "default_connections")]
    pub connections: u32,

    /// Fill-order priority relative to other pools (lower = preferred).
    /// Currently informational; all pools pull from the shared queue.
    #[serde(default)]
    pub priority: i32,

    /// Skip the GROUP exchange before BODY (some servers accept BODY by
    /// message-id without a selected group)
    #[serde(default)]
    pub skip_group_command: bool,

    /// Seconds of idleness before an anti-idle command is sent
    #[serde(default = "default_anti_idle_secs")]
    pub anti_idle_secs: u64,

    /// Optional per-server read-rate cap in bytes per second
    #[serde(default)]
    pub speed_limit_bps: Option<u64>,

    /// Optional local address to bind outgoing connections to
    #[serde(default)]
    pub bind_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: default_port(),
            username: None,
            password: None,
            connections: default_connections(),
            priority: 0,
            skip_group_command: false,
            anti_idle_secs: default_anti_idle_secs(),
            speed_limit_bps: None,
            bind_address: None,
        }
    }
}

/// Download behavior settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory for in-flight segment files and temp names
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Directory where assembled files land
    #[serde(default = "default_dest_dir")]
    pub dest_dir: PathBuf,

    /// Global read-rate cap in bytes per second (None = unlimited)
    #[serde(default)]
    pub speed_limit_bps: Option<u64>,

    /// Abort an in-flight fetch if no data arrives for this many seconds
    #[serde(default = "default_active_timeout_secs")]
    pub active_timeout_secs: u64,

    /// Minimum free disk space; writes below this trigger the disk-full pause
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,

    /// Number of decode worker tasks
    #[serde(default = "default_decode_workers")]
    pub decode_workers: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            dest_dir: default_dest_dir(),
            speed_limit_bps: None,
            active_timeout_secs: default_active_timeout_secs(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
            decode_workers: default_decode_workers(),
        }
    }
}

/// Reconnect/backoff policy
///
/// Delays grow by `backoff_multiplier` per consecutive failure (the default is
/// the golden ratio), capped at `max_delay_ms`, with optional jitter to avoid
/// reconnect stampedes across connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first reconnect attempt, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on the reconnect delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after each consecutive failure
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add up to ±25% random jitter to each delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_port() -> u16 {
    119
}

fn default_connections() -> u32 {
    4
}

fn default_anti_idle_secs() -> u64 {
    // Under the common 5-minute server-side idle cutoff
    270
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("working")
}

fn default_dest_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_active_timeout_secs() -> u64 {
    30
}

fn default_min_free_disk_bytes() -> u64 {
    // 100 MiB
    100 * 1024 * 1024
}

fn default_decode_workers() -> usize {
    2
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    // Golden ratio: grows noticeably slower than doubling
    1.618
}

fn default_jitter() -> bool {
    true
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn one_server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: "news.example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_deserializes_from_empty_document() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.download.active_timeout_secs, 30);
        assert_eq!(config.retry.initial_delay_ms, 2_000);
    }

    #[test]
    fn partial_server_document_fills_in_defaults() {
        let json = r#"{"name": "primary", "host": "news.example.com"}"#;
        let server: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(server.port, 119);
        assert_eq!(server.connections, 4);
        assert_eq!(server.anti_idle_secs, 270);
        assert!(!server.skip_group_command);
        assert!(server.username.is_none());
    }

    #[test]
    fn retry_defaults_use_golden_ratio_multiplier() {
        let retry = RetryConfig::default();
        assert!(
            (retry.backoff_multiplier - 1.618).abs() < f64::EPSILON,
            "default multiplier should be the golden ratio"
        );
        assert!(retry.jitter);
        assert_eq!(retry.max_delay_ms, 60_000);
    }

    #[test]
    fn validate_rejects_empty_server_list() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, Error::Config { ref key, .. } if key.as_deref() == Some("servers")),
            "empty server list should fail validation on the servers key"
        );
    }

    #[test]
    fn validate_rejects_more_than_32_pools() {
        let config = Config {
            servers: (0..33).map(|i| one_server(&format!("pool{i}"))).collect(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::Queue(QueueError::TooManyPools { count: 33 })
        ));
    }

    #[test]
    fn validate_rejects_zero_connection_server() {
        let mut server = one_server("primary");
        server.connections = 0;
        let config = Config {
            servers: vec![server],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_server_names() {
        let config = Config {
            servers: vec![one_server("primary"), one_server("primary")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains("unique"),
            "duplicate pool names must be rejected, got: {err}"
        );
    }

    #[test]
    fn validate_accepts_a_reasonable_two_pool_config() {
        let config = Config {
            servers: vec![one_server("primary"), one_server("backup")],
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
