//! Configuration for sealpost.
//!
//! Settings live in `{data_dir}/config.toml`; every field has a default so an
//! empty or missing file is valid. Command-line arguments pick the data
//! directory and the signer backend and take precedence over environment
//! variables.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::daemon_signer::default_socket_path;

pub(crate) const DEFAULT_RELAY_LIST_TIMEOUT_MS: u64 = 3_000;
pub(crate) const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_BACKFILL_LIMIT: u32 = 500;

pub const DEFAULT_FALLBACK_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];
pub const DEFAULT_DISCOVERY_RELAYS: &[&str] =
    &["wss://purplepag.es", "wss://relay.damus.io", "wss://nos.lol"];

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {e}"),
            ConfigError::Toml(e) => write!(f, "config parse error: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn default_fallback_relays() -> Vec<String> {
    strings(DEFAULT_FALLBACK_RELAYS)
}

fn default_discovery_relays() -> Vec<String> {
    strings(DEFAULT_DISCOVERY_RELAYS)
}

fn default_relay_list_timeout_ms() -> u64 {
    DEFAULT_RELAY_LIST_TIMEOUT_MS
}

fn default_fetch_timeout_ms() -> u64 {
    DEFAULT_FETCH_TIMEOUT_MS
}

fn default_backfill_limit() -> u32 {
    DEFAULT_BACKFILL_LIMIT
}

/// Contents of `{data_dir}/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealpostConfig {
    /// Own inbox relays. When set, no relay-list lookup is done for self.
    #[serde(default)]
    pub inbox_relays: Vec<String>,
    /// Relays for legacy messages. Empty means the fallback relays.
    #[serde(default)]
    pub read_relays: Vec<String>,
    /// Where relay-list events are looked up.
    #[serde(default = "default_discovery_relays")]
    pub discovery_relays: Vec<String>,
    #[serde(default = "default_fallback_relays")]
    pub fallback_relays: Vec<String>,
    #[serde(default = "default_relay_list_timeout_ms")]
    pub relay_list_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Per-filter event limit during backfill.
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: u32,
    /// Locally muted pubkeys.
    #[serde(default)]
    pub muted: Vec<String>,
    /// Locally followed pubkeys.
    #[serde(default)]
    pub followed: Vec<String>,
}

impl Default for SealpostConfig {
    fn default() -> Self {
        Self {
            inbox_relays: Vec::new(),
            read_relays: Vec::new(),
            discovery_relays: default_discovery_relays(),
            fallback_relays: default_fallback_relays(),
            relay_list_timeout_ms: DEFAULT_RELAY_LIST_TIMEOUT_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            muted: Vec::new(),
            followed: Vec::new(),
        }
    }
}

impl SealpostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback_relays.is_empty() {
            return Err(ConfigError::Invalid(
                "fallback_relays must name at least one relay".into(),
            ));
        }
        for url in self
            .inbox_relays
            .iter()
            .chain(&self.read_relays)
            .chain(&self.discovery_relays)
            .chain(&self.fallback_relays)
        {
            if !(url.starts_with("wss://") || url.starts_with("ws://")) {
                return Err(ConfigError::Invalid(format!("not a relay url: {url}")));
            }
        }
        Ok(())
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load the config, returning defaults if it doesn't exist.
pub fn load_config(data_dir: &Path) -> Result<SealpostConfig, ConfigError> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(SealpostConfig::default());
    }
    let contents = fs::read_to_string(&path)?;
    let config: SealpostConfig =
        toml::from_str(&contents).map_err(|e| ConfigError::Toml(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(data_dir: &Path, config: &SealpostConfig) -> Result<(), ConfigError> {
    fs::create_dir_all(data_dir)?;
    let contents =
        toml::to_string_pretty(config).map_err(|e| ConfigError::Toml(e.to_string()))?;
    fs::write(config_path(data_dir), contents)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// End-to-end encrypted direct messages over public relays.
///
/// The identity is given either as a secret key or as the socket of a running
/// signer daemon. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "sealpost", version, about)]
pub struct Cli {
    /// Data directory for config and database [env: SEALPOST_HOME] [default: ~/.sealpost]
    #[arg(long, short = 'd', global = true)]
    pub data_dir: Option<PathBuf>,

    /// Hex secret key of the identity [env: SEALPOST_SECRET_KEY]
    #[arg(long, global = true)]
    pub secret_key: Option<String>,

    /// Use the signer daemon listening on this socket instead of a secret key
    #[arg(long, global = true)]
    pub signer_socket: Option<PathBuf>,

    /// Use the signer daemon at its default socket
    #[arg(long, global = true, conflicts_with = "signer_socket")]
    pub daemon: bool,

    /// Print per-event decode details
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListFilter {
    Known,
    Unknown,
    All,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a new identity and print its keys
    Keygen,
    /// Print the public key of the configured identity
    Whoami,
    /// Send a direct message
    Send {
        recipient: String,
        message: String,
        /// Id of the message being replied to
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Backfill history once and exit
    Sync,
    /// Backfill, then print incoming messages until interrupted
    Listen,
    /// List conversations
    Conversations {
        #[arg(long, value_enum, default_value_t = ListFilter::All)]
        filter: ListFilter,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show the messages exchanged with one partner
    Messages {
        partner: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Only messages sent before this unix time
        #[arg(long)]
        before: Option<u64>,
    },
    /// Mark one conversation as read
    Read { partner: String },
    /// Mark every conversation as read
    ReadAll,
    /// Flag every read conversation as unread
    UnreadAll,
    /// Print unread counts
    Unread,
    /// Delete all stored messages
    Clear,
}

/// How the identity's keys are held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerChoice {
    SecretKey(String),
    Daemon(PathBuf),
    None,
}

pub struct Config {
    pub data_dir: PathBuf,
    pub signer: SignerChoice,
    pub verbose: bool,
}

impl Config {
    pub fn from_cli_and_env(cli: &Cli) -> Self {
        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(crate::storage::resolve_data_dir);

        let secret_key = cli
            .secret_key
            .clone()
            .or_else(|| std::env::var("SEALPOST_SECRET_KEY").ok());

        let signer = match (&cli.signer_socket, secret_key) {
            (Some(socket), _) => SignerChoice::Daemon(socket.clone()),
            (None, _) if cli.daemon => SignerChoice::Daemon(default_socket_path()),
            (None, Some(secret)) => SignerChoice::SecretKey(secret),
            (None, None) => SignerChoice::None,
        };

        Self {
            data_dir,
            signer,
            verbose: cli.verbose,
        }
    }
}
