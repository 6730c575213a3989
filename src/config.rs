//! Configuration module for the mcstore server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which durable backend mirrors the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// SQLite database file
    Sqlite,
    /// Process-local mirror, nothing survives a restart
    Memory,
}

/// Command-line arguments for the cache server
#[derive(Parser, Debug)]
#[command(name = "mcstore")]
#[command(author = "mcstore authors")]
#[command(version)]
#[command(about = "A memcached-compatible cache with write-through persistence", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:11211)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Durable backend kind
    #[arg(long, value_enum)]
    pub backend: Option<BackendType>,

    /// Path of the SQLite database file
    #[arg(short = 'd', long)]
    pub database: Option<PathBuf>,

    /// Maximum number of simultaneous client connections
    #[arg(short = 'C', long)]
    pub max_connections: Option<usize>,

    /// Longest command line accepted before the connection is dropped
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Largest value accepted by a storage command, in bytes
    #[arg(short = 'I', long)]
    pub max_value_size: Option<usize>,

    /// Seconds of client silence before a connection is closed (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds, 0 disables it
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            idle_timeout: 0,
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            max_value_size: default_max_value_size(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendType,
    /// SQLite database path
    #[serde(default = "default_database")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_database(),
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

fn default_listen() -> String {
    "127.0.0.1:11211".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_line_length() -> usize {
    8 * 1024
}

fn default_max_value_size() -> usize {
    1024 * 1024 // 1 MB, same as memcached's default item size
}

fn default_backend() -> BackendType {
    BackendType::Sqlite
}

fn default_database() -> PathBuf {
    PathBuf::from("mcstore.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub max_line_length: usize,
    pub max_value_size: usize,
    pub backend: BackendType,
    pub database: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_values(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let idle_secs = cli
            .idle_timeout
            .unwrap_or(toml_config.server.idle_timeout);

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.protocol.max_line_length),
            max_value_size: cli
                .max_value_size
                .unwrap_or(toml_config.protocol.max_value_size),
            backend: cli.backend.unwrap_or(toml_config.storage.backend),
            database: cli.database.unwrap_or(toml_config.storage.path),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

impl CliArgs {
    fn default_values() -> Self {
        Self {
            config: None,
            listen: None,
            backend: None,
            database: None,
            max_connections: None,
            max_line_length: None,
            max_value_size: None,
            idle_timeout: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
