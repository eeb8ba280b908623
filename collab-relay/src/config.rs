//! Configuration system for the collaboration relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/collab-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

use collab_proto::DEFAULT_PORT;
use collab_proto::codec::DEFAULT_MAX_FRAME_SIZE;

use crate::session::DEFAULT_OUTBOUND_CAPACITY;

/// Errors that can occur when loading relay configuration.
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

/// On-disk layout; every field is optional so a file may override any subset.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
    handshake_timeout_secs: Option<u64>,
    outbound_queue: Option<usize>,
}

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(
    version,
    about = "Collaboration relay server",
    long_about = "Collaboration relay server.\n\nEvery connecting peer receives the \
                  session key unencrypted before any traffic is protected. Only run \
                  the relay on networks where all hosts are trusted."
)]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "COLLAB_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/collab-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Seconds allowed for writing the key to a new peer.
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Frames that may queue for a slow peer before it is disconnected.
    #[arg(long)]
    pub outbound_queue: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COLLAB_RELAY_LOG")]
    pub log_level: String,
}

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:8888`).
    pub bind_addr: String,
    /// Maximum allowed frame body size in bytes.
    pub max_frame_size: usize,
    /// Seconds allowed for writing the key to a new peer.
    pub handshake_timeout_secs: u64,
    /// Frames that may queue for one peer before it is dropped.
    pub outbound_queue: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: 5,
            outbound_queue: DEFAULT_OUTBOUND_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// An explicit `--config` path must exist; the default path may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            handshake_timeout_secs: cli
                .handshake_timeout_secs
                .or(file.server.handshake_timeout_secs)
                .unwrap_or(defaults.handshake_timeout_secs),
            outbound_queue: cli
                .outbound_queue
                .or(file.server.outbound_queue)
                .unwrap_or(defaults.outbound_queue),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("collab-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
