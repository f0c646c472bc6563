//! Configuration for the floodgate server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Listener topology: how many listener + reactor pairs to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// One listener, one reactor.
    Single,
    /// One listener per core, each bound with SO_REUSEPORT so the kernel
    /// load-balances incoming SYNs across shards.
    Sharded,
}

/// Dispatch strategy applied to accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// Readiness-polling reactor multiplexing many connections per thread.
    Reactor,
    /// One blocking thread per connection (comparison baseline; stays
    /// protocol-compatible with the reactor path).
    Blocking,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "floodgate")]
#[command(version = "0.1.0")]
#[command(about = "A TCP edge server for very large connection counts", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listener topology
    #[arg(long, value_enum)]
    pub topology: Option<Topology>,

    /// Dispatch strategy
    #[arg(long, value_enum)]
    pub dispatch: Option<Dispatch>,

    /// Number of shards in sharded topology (defaults to CPU core count)
    #[arg(short = 's', long)]
    pub shards: Option<usize>,

    /// TLS certificate file (PEM); enables TLS together with --key
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Number of TLS handshake offload workers
    #[arg(long)]
    pub handshake_workers: Option<usize>,

    /// Maximum accepted frame body length in bytes
    #[arg(long)]
    pub max_frame_len: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listener topology
    #[serde(default = "default_topology")]
    pub topology: Topology,
    /// Dispatch strategy
    #[serde(default = "default_dispatch")]
    pub dispatch: Dispatch,
    /// Shard count; 0 means one per CPU core
    #[serde(default)]
    pub shards: usize,
    /// Readiness events fetched per poll-wait call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            topology: default_topology(),
            dispatch: default_dispatch(),
            shards: 0,
            batch_size: default_batch_size(),
        }
    }
}

/// TLS configuration. TLS is enabled when both paths are present.
#[derive(Debug, Deserialize)]
pub struct TlsSection {
    /// PEM certificate chain file
    pub cert: Option<PathBuf>,
    /// PEM private key file
    pub key: Option<PathBuf>,
    /// Handshake offload worker count
    #[serde(default = "default_handshake_workers")]
    pub handshake_workers: usize,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            handshake_workers: default_handshake_workers(),
        }
    }
}

/// Protocol hardening limits.
#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    /// Maximum accepted frame body length in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_topology() -> Topology {
    Topology::Sharded
}

fn default_dispatch() -> Dispatch {
    Dispatch::Reactor
}

fn default_batch_size() -> usize {
    1024
}

fn default_handshake_workers() -> usize {
    128
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved TLS settings.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub handshake_workers: usize,
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub topology: Topology,
    pub dispatch: Dispatch,
    /// 0 means one shard per CPU core.
    pub shards: usize,
    pub batch_size: usize,
    pub tls: Option<TlsConfig>,
    pub max_frame_len: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let cert = cli.cert.or(toml_config.tls.cert);
        let key = cli.key.or(toml_config.tls.key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert,
                key,
                handshake_workers: cli
                    .handshake_workers
                    .unwrap_or(toml_config.tls.handshake_workers),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            topology: cli.topology.unwrap_or(toml_config.server.topology),
            dispatch: cli.dispatch.unwrap_or(toml_config.server.dispatch),
            shards: cli.shards.unwrap_or(toml_config.server.shards),
            batch_size: toml_config.server.batch_size,
            tls,
            max_frame_len: cli
                .max_frame_len
                .unwrap_or(toml_config.protocol.max_frame_len),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file '{0}': {1}")]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("tls requires both a certificate and a key")]
    PartialTls,
}
