//! Configuration module for the eof-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, MARKER};

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "eof-echo")]
#[command(version)]
#[command(about = "Replies to <EOF>-terminated messages over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// TCP port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of established connections waiting to be accepted
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Size of each receive chunk in bytes
    #[arg(long)]
    pub recv_buffer_size: Option<usize>,

    /// Maximum frame size in bytes, marker included
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Per-connection idle timeout in seconds (0 = no timeout)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// What the accept loop does when accept fails
    #[arg(long, value_enum)]
    pub accept_errors: Option<AcceptErrorPolicy>,

    /// How accepted connections are handed to their handler task
    #[arg(long, value_enum)]
    pub handoff: Option<HandoffMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Behavior of the accept loop on an accept failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AcceptErrorPolicy {
    /// Stop the server and return the error.
    Fatal,
    /// Log the error and keep accepting.
    #[default]
    Continue,
}

/// How the accept loop hands a connection to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Spawn the handler and accept the next connection right away.
    #[default]
    Immediate,
    /// Wait until the spawned handler has started before accepting again.
    Confirmed,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub accept_errors: AcceptErrorPolicy,
    #[serde(default)]
    pub handoff: HandoffMode,
    /// Seconds to wait for in-flight connections on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            accept_errors: AcceptErrorPolicy::default(),
            handoff: HandoffMode::default(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Idle timeout in seconds (0 = none)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_recv_buffer_size(),
            max_frame_size: default_max_frame_size(),
            idle_timeout: default_idle_timeout(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11000
}

fn default_backlog() -> u32 {
    2
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_recv_buffer_size() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub recv_buffer_size: usize,
    pub max_frame_size: usize,
    pub idle_timeout: Option<Duration>,
    pub accept_errors: AcceptErrorPolicy,
    pub handoff: HandoffMode,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let idle_secs = cli
            .idle_timeout
            .unwrap_or(toml_config.connection.idle_timeout);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            recv_buffer_size: cli
                .recv_buffer_size
                .unwrap_or(toml_config.connection.recv_buffer_size),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.connection.max_frame_size),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            accept_errors: cli
                .accept_errors
                .unwrap_or(toml_config.server.accept_errors),
            handoff: cli.handoff.unwrap_or(toml_config.server.handoff),
            shutdown_grace: Duration::from_secs(toml_config.server.shutdown_grace),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 || i32::try_from(self.backlog).is_err() {
            return Err(ConfigError::Invalid(format!(
                "backlog must be between 1 and {}, got {}",
                i32::MAX,
                self.backlog
            )));
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "recv_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size < MARKER.len() {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least {} bytes, got {}",
                MARKER.len(),
                self.max_frame_size
            )));
        }
        self.socket_addr()?;
        Ok(())
    }

    /// The address to bind, from `host` and `port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip = host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid host address '{}'", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
