//! Configuration module for the hello-udp binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::client::ClientConfig;
use crate::server::ServerConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "hello-udp")]
#[command(author = "hello-udp authors")]
#[command(version = "0.1.0")]
#[command(about = "Retry-until-ack hello protocol over UDP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Send numbered requests and wait for matching replies
    Client(ClientArgs),
    /// Answer every request with a greeting
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Request prefix
    pub prefix: String,
    /// Number of parallel lanes
    pub lanes: Option<usize>,
    /// Requests per lane
    pub requests: Option<usize>,
    /// Concurrency model
    #[arg(short, long, value_enum)]
    pub runtime: Option<Runtime>,
    /// Global deadline in milliseconds after which unfinished lanes are abandoned
    #[arg(long)]
    pub deadline_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port to listen on
    pub port: u16,
    /// Number of reply workers
    pub workers: Option<usize>,
    /// Concurrency model
    #[arg(short, long, value_enum)]
    pub runtime: Option<Runtime>,
}

/// Engine flavour to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Thread per lane, blocking sockets with receive timeouts
    #[default]
    Blocking,
    /// Single-threaded mio event loop
    Reactor,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Client-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub lanes: Option<usize>,
    pub requests: Option<usize>,
    pub runtime: Option<Runtime>,
    pub deadline_ms: Option<u64>,
    pub receive_timeout_ms: Option<u64>,
    pub select_timeout_ms: Option<u64>,
}

/// Server-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub workers: Option<usize>,
    pub runtime: Option<Runtime>,
    pub queue_capacity: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
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

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary should run, fully resolved.
#[derive(Debug, Clone)]
pub enum Mode {
    Client {
        runtime: Runtime,
        config: ClientConfig,
    },
    Server {
        runtime: Runtime,
        config: ServerConfig,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let mode = match cli.mode {
            ModeArgs::Client(args) => {
                let mut config = ClientConfig::new(args.host, args.port, args.prefix)
                    .with_lanes(args.lanes.or(file.client.lanes).unwrap_or(1))
                    .with_requests(args.requests.or(file.client.requests).unwrap_or(1));
                config.deadline = args
                    .deadline_ms
                    .or(file.client.deadline_ms)
                    .map(Duration::from_millis);
                if let Some(ms) = file.client.receive_timeout_ms {
                    config.receive_timeout = Duration::from_millis(ms);
                }
                if let Some(ms) = file.client.select_timeout_ms {
                    config.select_timeout = Duration::from_millis(ms);
                }
                Mode::Client {
                    runtime: args.runtime.or(file.client.runtime).unwrap_or_default(),
                    config,
                }
            }
            ModeArgs::Server(args) => {
                let mut config = ServerConfig::new(args.port)
                    .with_workers(args.workers.or(file.server.workers).unwrap_or(1));
                if let Some(capacity) = file.server.queue_capacity {
                    config.queue_capacity = capacity;
                }
                Mode::Server {
                    runtime: args.runtime.or(file.server.runtime).unwrap_or_default(),
                    config,
                }
            }
        };

        Config {
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
            mode,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
