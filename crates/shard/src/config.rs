//! Configuration management for the shard server.
//!
//! This module handles loading, validation, and conversion of the server
//! configuration from a TOML file. Every field carries a serde default so a
//! partial file only needs the settings it changes.

use anyhow::{anyhow, Context, Result};
use game_server::{AncillaryLimits, PoolConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use shard_protocol::CompressionLevel;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
///
/// Encompasses the listener, connection timing, queue caps, buffer pools,
/// per-connection UI limits, logging and the stats monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listener and connection settings
    pub server: ServerSettings,
    /// Timing, queue and protocol settings
    pub network: NetworkSettings,
    /// Buffer pool sizes
    pub pools: PoolSettings,
    /// Per-connection caps on open UI state
    pub limits: LimitSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
    /// Periodic statistics output
    pub monitoring: MonitoringSettings,
}

/// Listener and connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Endpoints to listen on (e.g., "0.0.0.0:2593")
    pub listen: Vec<String>,
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// Maximum concurrent connections from one IP, 0 for no limit
    pub max_connections_per_ip: usize,
    /// Whether to use SO_REUSEPORT for one accept loop per core (Unix only)
    pub use_reuse_port: bool,
    /// Listen backlog of every bound socket
    pub listen_backlog: i32,
    /// Server tick interval in milliseconds (0 to disable)
    pub tick_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:2593".to_string()],
            max_connections: 1000,
            max_connections_per_ip: 0,
            use_reuse_port: false,
            listen_backlog: 128,
            tick_interval_ms: 50,
        }
    }
}

/// Timing, queue and protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Seconds without traffic before a connection is dropped
    pub inactivity_timeout_secs: u64,
    /// Seconds before the first liveness sweep
    pub sweep_delay_secs: u64,
    /// Seconds between liveness sweeps
    pub sweep_interval_secs: u64,
    /// Upper bound in milliseconds on flushing a closing connection
    pub flush_timeout_ms: u64,
    /// Whether clients must open with a seed
    pub expect_seed: bool,
    /// Bytes allowed to wait in a connection's send queue
    pub pending_cap: usize,
    /// Initial capacity of each inbound queue
    pub byte_queue_capacity: usize,
    /// Deflate level for compressed connections (0-9)
    pub compression_level: u32,
    /// Hex-dump unknown packets on the `packet_trace` target
    pub trace_unknown_packets: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            inactivity_timeout_secs: defaults.inactivity_timeout.as_secs(),
            sweep_delay_secs: defaults.sweep_delay.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            flush_timeout_ms: defaults.flush_timeout.as_millis() as u64,
            expect_seed: defaults.expect_seed,
            pending_cap: defaults.pending_cap,
            byte_queue_capacity: defaults.byte_queue_capacity,
            compression_level: defaults.compression_level.level(),
            trace_unknown_packets: defaults.trace_unknown_packets,
        }
    }
}

/// Buffer pool sizes, one count and buffer size per pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub receive_count: usize,
    pub receive_size: usize,
    pub coalesce_count: usize,
    pub coalesce_size: usize,
    pub compiled_count: usize,
    pub compiled_size: usize,
    pub processor_count: usize,
    pub processor_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolConfig::default().into()
    }
}

impl From<PoolConfig> for PoolSettings {
    fn from(pools: PoolConfig) -> Self {
        Self {
            receive_count: pools.receive_count,
            receive_size: pools.receive_size,
            coalesce_count: pools.coalesce_count,
            coalesce_size: pools.coalesce_size,
            compiled_count: pools.compiled_count,
            compiled_size: pools.compiled_size,
            processor_count: pools.processor_count,
            processor_size: pools.processor_size,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(pools: &PoolSettings) -> Self {
        Self {
            receive_count: pools.receive_count,
            receive_size: pools.receive_size,
            coalesce_count: pools.coalesce_count,
            coalesce_size: pools.coalesce_size,
            compiled_count: pools.compiled_count,
            compiled_size: pools.compiled_size,
            processor_count: pools.processor_count,
            processor_size: pools.processor_size,
        }
    }
}

/// Per-connection caps on open gumps, menus, hue pickers and trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub gumps: usize,
    pub menus: usize,
    pub hue_pickers: usize,
    pub trades: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        let limits = AncillaryLimits::default();
        Self {
            gumps: limits.gumps,
            menus: limits.menus,
            hue_pickers: limits.hue_pickers,
            trades: limits.trades,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Periodic statistics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Seconds between stats lines, 0 to disable
    pub stats_interval_secs: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!("📝 Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Parses the configured listen endpoints.
    pub fn listen_addresses(&self) -> Result<Vec<SocketAddr>> {
        self.server
            .listen
            .iter()
            .map(|address| {
                address
                    .parse::<SocketAddr>()
                    .map_err(|e| anyhow!("Invalid listen address {address}: {e}"))
            })
            .collect()
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing
    /// the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.listen.is_empty() {
            return Err("At least one listen address is required".to_string());
        }
        for address in &self.server.listen {
            if address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid listen address: {address}"));
            }
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.server.listen_backlog <= 0 {
            return Err("listen_backlog must be greater than 0".to_string());
        }

        if self.network.inactivity_timeout_secs == 0 {
            return Err("inactivity_timeout_secs must be greater than 0".to_string());
        }
        if self.network.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than 0".to_string());
        }
        if self.network.compression_level > 9 {
            return Err(format!(
                "Invalid compression level: {}. Must be between 0 and 9",
                self.network.compression_level
            ));
        }

        if self.pools.coalesce_size == 0 || self.pools.receive_size == 0 {
            return Err("Pool buffer sizes must be greater than 0".to_string());
        }
        if self.network.pending_cap < self.pools.coalesce_size {
            return Err(format!(
                "pending_cap ({}) must hold at least one coalesce buffer ({})",
                self.network.pending_cap, self.pools.coalesce_size
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts the application configuration to a network core
    /// configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            listen: self.listen_addresses()?,
            max_connections: self.server.max_connections,
            max_connections_per_ip: self.server.max_connections_per_ip,
            use_reuse_port: self.server.use_reuse_port,
            listen_backlog: self.server.listen_backlog,
            tick_interval_ms: self.server.tick_interval_ms,
            inactivity_timeout: Duration::from_secs(self.network.inactivity_timeout_secs),
            sweep_delay: Duration::from_secs(self.network.sweep_delay_secs),
            sweep_interval: Duration::from_secs(self.network.sweep_interval_secs),
            flush_timeout: Duration::from_millis(self.network.flush_timeout_ms),
            expect_seed: self.network.expect_seed,
            pending_cap: self.network.pending_cap,
            byte_queue_capacity: self.network.byte_queue_capacity,
            compression_level: CompressionLevel::new(self.network.compression_level),
            trace_unknown_packets: self.network.trace_unknown_packets,
            pools: PoolConfig::from(&self.pools),
            limits: AncillaryLimits {
                gumps: self.limits.gumps,
                menus: self.limits.menus,
                hue_pickers: self.limits.hue_pickers,
                trades: self.limits.trades,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::fs;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.listen, vec!["0.0.0.0:2593"]);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.server.tick_interval_ms, 50);
        assert_eq!(config.network.inactivity_timeout_secs, 90);
        assert!(config.network.expect_seed);
        assert_eq!(config.limits.gumps, 512);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert_eq!(config.monitoring.stats_interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_round_trips_to_server_defaults() {
        let server = AppConfig::default().to_server_config().unwrap();
        let defaults = ServerConfig::default();

        assert_eq!(server.listen, defaults.listen);
        assert_eq!(server.inactivity_timeout, defaults.inactivity_timeout);
        assert_eq!(server.pending_cap, defaults.pending_cap);
        assert_eq!(server.pools, defaults.pools);
        assert_eq!(server.limits, defaults.limits);
        assert_eq!(server.compression_level, defaults.compression_level);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.listen = vec!["not-an-address".to_string()];
        assert!(config.validate().unwrap_err().contains("not-an-address"));

        let mut config = AppConfig::default();
        config.server.listen.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.compression_level = 12;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.pending_cap = config.pools.coalesce_size - 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let toml_content = r#"
[server]
listen = ["127.0.0.1:2593", "[::1]:2593"]
max_connections_per_ip = 4

[network]
inactivity_timeout_secs = 30
compression_level = 6

[limits]
gumps = 16

[logging]
level = "debug"
"#;

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.server.listen.len(), 2);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.limits.gumps, 16);
        assert_eq!(config.limits.menus, 512);

        let server = config.to_server_config().unwrap();
        assert_eq!(server.max_connections_per_ip, 4);
        assert_eq!(server.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(server.compression_level.level(), 6);
        assert_eq!(server.listen[1], "[::1]:2593".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[server\nlisten = 5").await.unwrap();
        assert!(AppConfig::load_from_file(temp_file.path()).await.is_err());
    }
}
