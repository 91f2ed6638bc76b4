//! Configuration for the tcp-conn-core demo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tcp_conn_core::protocol::DEFAULT_MAX_PACKET_SIZE;

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "tcp-conn-core")]
#[command(version)]
#[command(about = "Length-prefixed TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Largest accepted frame in bytes (0 = unbounded)
    #[arg(short = 'm', long)]
    pub max_packet_size: Option<u32>,

    /// Per-read deadline in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Per-write deadline in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Also connect to this address and send a greeting periodically
    #[arg(long)]
    pub connect: Option<String>,

    /// Interval between client greetings in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Demo client configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub connect: Option<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: None,
            interval_ms: default_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_packet_size: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect: Option<String>,
    pub interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let interval_ms = cli.interval_ms.unwrap_or(toml_config.client.interval_ms);
        if interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be at least 1"));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_packet_size: cli
                .max_packet_size
                .unwrap_or(toml_config.protocol.max_packet_size),
            read_timeout: Duration::from_millis(
                cli.read_timeout_ms
                    .unwrap_or(toml_config.server.read_timeout_ms),
            ),
            write_timeout: Duration::from_millis(
                cli.write_timeout_ms
                    .unwrap_or(toml_config.server.write_timeout_ms),
            ),
            connect: cli.connect.or(toml_config.client.connect),
            interval: Duration::from_millis(interval_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:9001");
        assert_eq!(config.protocol.max_packet_size, 1024 * 1024);
        assert_eq!(config.server.read_timeout_ms, 0);
        assert!(config.client.connect.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9100"
            read_timeout_ms = 30000

            [protocol]
            max_packet_size = 4096

            [client]
            connect = "127.0.0.1:9100"
            interval_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9100");
        assert_eq!(config.server.read_timeout_ms, 30000);
        assert_eq!(config.server.write_timeout_ms, 0);
        assert_eq!(config.protocol.max_packet_size, 4096);
        assert_eq!(config.client.connect.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(config.client.interval_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "tcp-conn-core",
            "--listen",
            "127.0.0.1:7000",
            "--read-timeout-ms",
            "500",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9100"
            write_timeout_ms = 100

            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.read_timeout, Duration::from_millis(500));
        assert_eq!(config.write_timeout, Duration::from_millis(100));
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cli = CliArgs::parse_from(["tcp-conn-core", "--interval-ms", "0"]);
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let cli = CliArgs::parse_from(["tcp-conn-core"]);
        let toml_config: TomlConfig = toml::from_str("[client]\ninterval_ms = 0").unwrap();
        assert!(Config::merge(cli, toml_config).is_err());
    }
}
