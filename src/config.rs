//! Configuration module for the kestrel server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(version = "0.1.0")]
#[command(about = "A RESP-compatible key-value server with streams and replication", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding the snapshot file
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Snapshot file name inside `dir`
    #[arg(long)]
    pub dbfilename: Option<String>,

    /// Run as a replica of "<host> <port>"
    #[arg(long)]
    pub replicaof: Option<String>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on one reactor wait, in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Interval between active expiry sweeps, in milliseconds
    #[serde(default = "default_expiry_sweep_interval")]
    pub expiry_sweep_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_interval_ms: default_expiry_sweep_interval(),
        }
    }
}

/// Snapshot location
#[derive(Debug, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_dbfilename")]
    pub dbfilename: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            dbfilename: default_dbfilename(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ReplicationConfig {
    /// "<host> <port>" of the primary
    pub replicaof: Option<String>,
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_tick_interval() -> u64 {
    10
}

fn default_expiry_sweep_interval() -> u64 {
    100
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_dbfilename() -> String {
    "dump.rdb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Address of the primary this server replicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOf {
    pub host: String,
    pub port: u16,
}

impl ReplicaOf {
    /// Parse `"<host> <port>"`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidReplicaOf(s.to_string());
        let mut words = s.split_whitespace();
        let (Some(host), Some(port), None) = (words.next(), words.next(), words.next()) else {
            return Err(invalid());
        };
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dir: PathBuf,
    pub dbfilename: String,
    pub replicaof: Option<ReplicaOf>,
    pub tick_interval_ms: u64,
    pub expiry_sweep_interval_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dir: default_dir(),
            dbfilename: default_dbfilename(),
            replicaof: None,
            tick_interval_ms: default_tick_interval(),
            expiry_sweep_interval_ms: default_expiry_sweep_interval(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let replicaof = cli
            .replicaof
            .or(toml_config.replication.replicaof)
            .map(|s| ReplicaOf::parse(&s))
            .transpose()?;

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            dir: cli.dir.unwrap_or(toml_config.persistence.dir),
            dbfilename: cli.dbfilename.unwrap_or(toml_config.persistence.dbfilename),
            replicaof,
            tick_interval_ms: toml_config.server.tick_interval_ms.max(1),
            expiry_sweep_interval_ms: toml_config.storage.expiry_sweep_interval_ms.max(1),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Full path of the snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// Parameters exposed through CONFIG GET.
    pub fn parameters(&self) -> HashMap<String, String> {
        HashMap::from([
            ("dir".to_string(), self.dir.display().to_string()),
            ("dbfilename".to_string(), self.dbfilename.clone()),
            ("port".to_string(), self.port.to_string()),
        ])
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid replicaof '{0}', expected \"<host> <port>\"")]
    InvalidReplicaOf(String),
}
