//! Configuration for the `collab` command-line client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/collab/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use collab_proto::DEFAULT_PORT;
use collab_proto::codec::DEFAULT_MAX_FRAME_SIZE;

use crate::client::ClientOptions;

/// Errors that can occur when loading client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    relay: RelayFileConfig,
}

/// `[relay]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayFileConfig {
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_secs: Option<u64>,
    max_frame_size: Option<usize>,
}

/// CLI arguments for the `collab` client.
#[derive(clap::Parser, Debug, Default)]
#[command(
    version,
    about = "Send and receive collaboration messages through a relay",
    long_about = "Connects to a collaboration relay, sends every line read from stdin \
                  (one JSON object per line) and prints every received message as one \
                  JSON line on stdout."
)]
pub struct CliArgs {
    /// Relay host name or address.
    #[arg(long, env = "COLLAB_HOST")]
    pub host: Option<String>,

    /// Relay port.
    #[arg(short, long, env = "COLLAB_PORT")]
    pub port: Option<u16>,

    /// Send this JSON object once, then exit.
    #[arg(long, value_name = "JSON")]
    pub send: Option<String>,

    /// Path to config file (default: `~/.config/collab/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds to wait for the connection and the key.
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COLLAB_LOG")]
    pub log_level: String,

    /// Log file path (default: `<temp dir>/collab.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay host.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Seconds allowed for connecting and for receiving the key.
    pub connect_timeout_secs: u64,
    /// Largest frame body accepted from the relay.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 10,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            host: cli
                .host
                .clone()
                .or_else(|| file.relay.host.clone())
                .unwrap_or(defaults.host),
            port: cli.port.or(file.relay.port).unwrap_or(defaults.port),
            connect_timeout_secs: cli
                .connect_timeout_secs
                .or(file.relay.connect_timeout_secs)
                .unwrap_or(defaults.connect_timeout_secs),
            max_frame_size: file
                .relay
                .max_frame_size
                .unwrap_or(defaults.max_frame_size),
        }
    }

    /// Client tunables derived from this configuration.
    #[must_use]
    pub const fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_frame_size: self.max_frame_size,
        }
    }
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("collab").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
