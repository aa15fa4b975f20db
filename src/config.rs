//! Configuration module for the chat relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::approval::ACK_OVERHEAD;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP chat relay with a name handshake", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What the binary should do.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server (default)
    Serve(ServeArgs),
    /// Join a relay as an interactive terminal client
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 0.0.0.0:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneous clients
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// Largest chat message accepted, in bytes
    #[arg(long)]
    pub max_message_len: Option<usize>,

    /// Largest display name accepted, in bytes
    #[arg(long)]
    pub max_name_len: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Relay address to connect to
    #[arg(short, long)]
    pub server: Option<String>,

    /// Display name; prompted for when omitted
    #[arg(short, long)]
    pub name: Option<String>,
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
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Registry capacity
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// listen(2) backlog, defaults to `max_clients`
    pub backlog: Option<u32>,
    /// Readiness events drained per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_clients: default_max_clients(),
            backlog: None,
            events_capacity: default_events_capacity(),
        }
    }
}

/// Wire limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    /// Unsent bytes a single connection may hold before it is dropped
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            max_name_len: default_max_name_len(),
            max_pending_output: default_max_pending_output(),
        }
    }
}

/// Terminal client configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_listen")]
    pub server: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen(),
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
    "127.0.0.1:12345".to_string()
}

fn default_max_clients() -> usize {
    100
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_message_len() -> usize {
    400
}

fn default_max_name_len() -> usize {
    100
}

fn default_max_pending_output() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_clients: usize,
    pub backlog: u32,
    pub events_capacity: usize,
    pub max_message_len: usize,
    pub max_name_len: usize,
    pub max_pending_output: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 12345)),
            max_clients: default_max_clients(),
            backlog: default_max_clients() as u32,
            events_capacity: default_events_capacity(),
            max_message_len: default_max_message_len(),
            max_name_len: default_max_name_len(),
            max_pending_output: default_max_pending_output(),
            log_level: default_log_level(),
        }
    }
}

/// Resolved subcommand.
#[derive(Debug, Clone)]
pub enum Mode {
    Serve,
    Connect {
        server: String,
        name: Option<String>,
    },
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<(Self, Mode), ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<(Self, Mode), ConfigError> {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let (serve, mode) = match cli.command {
            None => (ServeArgs::default(), Mode::Serve),
            Some(Command::Serve(args)) => (args, Mode::Serve),
            Some(Command::Connect(args)) => (
                ServeArgs::default(),
                Mode::Connect {
                    server: args.server.unwrap_or(toml_config.client.server),
                    name: args.name,
                },
            ),
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let listen = serve.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::BadAddress(listen.clone()))?;
        let max_clients = serve.max_clients.unwrap_or(toml_config.server.max_clients);

        let config = Config {
            listen,
            max_clients,
            backlog: toml_config
                .server
                .backlog
                .unwrap_or_else(|| max_clients.min(u32::MAX as usize) as u32),
            events_capacity: toml_config.server.events_capacity,
            max_message_len: serve
                .max_message_len
                .unwrap_or(toml_config.protocol.max_message_len),
            max_name_len: serve
                .max_name_len
                .unwrap_or(toml_config.protocol.max_name_len),
            max_pending_output: toml_config.protocol.max_pending_output,
            log_level,
        };
        config.validate()?;

        Ok((config, mode))
    }

    /// Reject limits the relay cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.max_name_len == 0 {
            return Err(ConfigError::Invalid("max_name_len must be at least 1".into()));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be at least 1".into(),
            ));
        }
        // The confirmation echoes the full acknowledgment back to us.
        let ack_len = self.max_name_len + ACK_OVERHEAD;
        if self.max_message_len < ack_len {
            return Err(ConfigError::Invalid(format!(
                "max_message_len ({}) must fit the acknowledgment of a {}-byte name ({} bytes)",
                self.max_message_len, self.max_name_len, ack_len
            )));
        }
        if self.max_pending_output < self.max_message_len {
            return Err(ConfigError::Invalid(
                "max_pending_output must hold at least one full message".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    BadAddress(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
