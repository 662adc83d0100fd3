//! Configuration module for peer-reactor.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::handshake::LoaderOptions;
use crate::runtime::AcceptorOptions;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "peer-reactor")]
#[command(author = "peer-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "Peer handshake responder and client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9700)
    #[arg(short = 'l', long)]
    pub listen: Option<SocketAddr>,

    /// Protocol version advertised to connecting peers
    #[arg(long)]
    pub protocol_version: Option<String>,

    /// Ping this peer once and exit instead of serving
    #[arg(short = 'p', long)]
    pub ping: Option<SocketAddr>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

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
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Responder configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Version advertised in the ping
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Per-connection read buffer size in bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Set SO_REUSEPORT on the listener
    #[serde(default)]
    pub reuse_port: bool,
    /// Maximum events handled per loop wake
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protocol_version: default_protocol_version(),
            read_buffer_size: default_read_buffer_size(),
            backlog: default_backlog(),
            reuse_port: false,
            events_capacity: default_events_capacity(),
        }
    }
}

/// Client (and handshake) timeouts
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Bound on waiting for a socket to finish connecting
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on each read of a ping response
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Maximum accepted response size in bytes
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_response_size: default_max_response_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9700))
}

fn default_protocol_version() -> String {
    "4.0".to_string()
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_read_timeout_ms() -> u64 {
    8000
}

fn default_max_response_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub protocol_version: String,
    pub read_buffer_size: usize,
    pub backlog: i32,
    pub reuse_port: bool,
    pub events_capacity: usize,
    pub ping: Option<SocketAddr>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_response_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            client,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            protocol_version: cli.protocol_version.unwrap_or(server.protocol_version),
            read_buffer_size: server.read_buffer_size,
            backlog: server.backlog,
            reuse_port: server.reuse_port,
            events_capacity: server.events_capacity,
            ping: cli.ping,
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms.unwrap_or(client.connect_timeout_ms),
            ),
            read_timeout: Duration::from_millis(client.read_timeout_ms),
            max_response_size: client.max_response_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }

    pub fn acceptor_options(&self) -> AcceptorOptions {
        AcceptorOptions {
            protocol_version: self.protocol_version.clone(),
            handshake_timeout: self.connect_timeout,
            read_buffer_size: self.read_buffer_size,
            backlog: self.backlog,
            reuse_port: self.reuse_port,
            ..AcceptorOptions::default()
        }
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            max_response_size: self.max_response_size,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:9700".parse().unwrap());
        assert_eq!(config.server.protocol_version, "4.0");
        assert_eq!(config.server.read_buffer_size, 1024);
        assert_eq!(config.client.connect_timeout_ms, 2000);
        assert_eq!(config.client.read_timeout_ms, 8000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9800"
            protocol_version = "3.0"
            reuse_port = true

            [client]
            connect_timeout_ms = 500

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9800".parse().unwrap());
        assert_eq!(config.server.protocol_version, "3.0");
        assert!(config.server.reuse_port);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.client.connect_timeout_ms, 500);
        assert_eq!(config.client.read_timeout_ms, 8000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nlisten = \"127.0.0.1:9800\"\nprotocol_version = \"3.0\"\n\n[client]\nconnect_timeout_ms = 500\n\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let cli = CliArgs::parse_from(["peer-reactor", "-c", path, "--protocol-version", "5.0"]);
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9800".parse().unwrap());
        assert_eq!(config.protocol_version, "5.0");
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.log_level, "warn");
        assert!(config.ping.is_none());

        let cli = CliArgs::parse_from([
            "peer-reactor",
            "-c",
            path,
            "--connect-timeout-ms",
            "100",
            "--log-level",
            "trace",
            "--ping",
            "10.0.0.1:9700",
        ]);
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.ping, Some("10.0.0.1:9700".parse().unwrap()));
        assert_eq!(config.loader_options().connect_timeout, Duration::from_millis(100));
        assert_eq!(config.acceptor_options().protocol_version, "3.0");
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs::parse_from(["peer-reactor", "-c", "/nonexistent/peer-reactor.toml"]);
        assert!(matches!(Config::from_args(cli), Err(ConfigError::FileRead(..))));
    }
}
