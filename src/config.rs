//! Configuration module for the echo relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "echo-relay")]
#[command(author = "echo-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A bounded-buffer TCP echo relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Bytes of buffer held per connection
    #[arg(short = 'b', long)]
    pub buffer_capacity: Option<usize>,

    /// Maximum bytes handed to a single socket write
    #[arg(long)]
    pub write_chunk: Option<usize>,

    /// Number of event loops (mio) or runtime threads (tokio)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connection limit (0 = unbounded); per event loop with mio, for the
    /// whole runtime with tokio
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Concurrency backend
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Which concurrency model drives connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness event loop (epoll/kqueue) with explicit connection state.
    #[default]
    Mio,
    /// One tokio task per connection.
    Tokio,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of workers
    pub workers: Option<usize>,
    /// Connection limit, per event loop with mio and per runtime with tokio
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub runtime: RuntimeType,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: 0,
            runtime: RuntimeType::default(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Per-connection buffer configuration
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Bytes of buffer per connection
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    /// Maximum bytes per write, defaults to `capacity`
    pub write_chunk: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            write_chunk: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file, stderr when absent
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_buffer_capacity() -> usize {
    16
}

fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub buffer_capacity: usize,
    pub write_chunk: usize,
    pub workers: usize,
    pub max_connections: usize,
    pub runtime: RuntimeType,
    pub events_capacity: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
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
        let buffer_capacity = cli
            .buffer_capacity
            .unwrap_or(toml_config.buffer.capacity);
        let write_chunk = cli
            .write_chunk
            .or(toml_config.buffer.write_chunk)
            .unwrap_or(buffer_capacity);

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            buffer_capacity,
            write_chunk,
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(1),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            events_capacity: toml_config.server.events_capacity,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer capacity must be at least 1 byte"));
        }
        if self.write_chunk == 0 {
            return Err(ConfigError::Invalid("write chunk must be at least 1 byte"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("events capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
