//! # Configuration
//!
//! Centralizes all settings with a clear override hierarchy:
//! defaults → config file → env vars → CLI flags.
//!
//! Config lives at `~/.chatline/config.toml`. If missing on first run, a
//! commented-out default is generated so users can discover all options.

use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Config Structs (all fields Option<T> for sparse TOML)
// ============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ChatlineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub auto_reply: AutoReplyConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub local_participant: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DeliveryConfig {
    pub upload_step: Option<u8>,
    pub upload_interval_ms: Option<u64>,
    pub ack_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AutoReplyConfig {
    pub enabled: Option<bool>,
    pub delay_ms: Option<u64>,
    pub message: Option<String>,
}

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_LOCAL_PARTICIPANT: &str = "me";
pub const DEFAULT_UPLOAD_STEP: u8 = 20;
pub const DEFAULT_UPLOAD_INTERVAL_MS: u64 = 500;
pub const DEFAULT_ACK_DELAY_MS: u64 = 1000;
pub const DEFAULT_AUTO_REPLY_DELAY_MS: u64 = 3000;
pub const DEFAULT_AUTO_REPLY_MESSAGE: &str = "Thanks for your message! I will get back to you soon.";

// ============================================================================
// Resolved Config (concrete values, no Options)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub local_participant: String,
    pub log_level: LevelFilter,
    /// Percentage points added per simulated upload tick, in `1..=100`.
    pub upload_step: u8,
    pub upload_interval: Duration,
    pub ack_delay: Duration,
    pub auto_reply_enabled: bool,
    pub auto_reply_delay: Duration,
    pub auto_reply_message: String,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        resolve(&ChatlineConfig::default(), None)
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Loading
// ============================================================================

/// Returns the path to `~/.chatline/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".chatline").join("config.toml"))
}

/// Load config from `~/.chatline/config.toml`.
///
/// If the file doesn't exist, generates a commented-out default and
/// returns `ChatlineConfig::default()`. If it exists but is malformed,
/// returns `ConfigError::Parse`.
pub fn load_config() -> Result<ChatlineConfig, ConfigError> {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => {
            warn!("Could not determine home directory, using default config");
            Ok(ChatlineConfig::default())
        }
    }
}

/// Load config from an explicit path, generating the default file if absent.
pub fn load_config_from(path: &Path) -> Result<ChatlineConfig, ConfigError> {
    if !path.exists() {
        info!("No config file found, generating default at {}", path.display());
        generate_default_config(path);
        return Ok(ChatlineConfig::default());
    }

    let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: ChatlineConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
    info!("Loaded config from {}", path.display());
    debug!("Config: {:?}", config);
    Ok(config)
}

/// Generates a commented-out default config file at the given path.
fn generate_default_config(path: &Path) {
    let default_content = r#"# Chatline Configuration
# All settings are optional. Defaults are used for anything not specified.
# Override hierarchy: defaults → this file → env vars → CLI flags.

# [general]
# local_participant = "me"          # Or set CHATLINE_LOCAL_PARTICIPANT
# log_level = "debug"               # "error", "warn", "info", "debug", "trace"

# [delivery]
# upload_step = 20                  # Percentage points per simulated upload tick
# upload_interval_ms = 500
# ack_delay_ms = 1000               # Sent -> Delivered

# [auto_reply]
# enabled = true
# delay_ms = 3000                   # Typing indicator shows for this long
# message = "Thanks for your message! I will get back to you soon."
"#;

    if let Some(parent) = path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        warn!("Failed to create config directory: {}", e);
        return;
    }
    if let Err(e) = fs::write(path, default_content) {
        warn!("Failed to write default config: {}", e);
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Reads and parses an env var. Unparseable values are ignored with a warning.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

fn millis(env_name: &str, configured: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(env_parse(env_name).or(configured).unwrap_or(default))
}

/// Resolve the final config by collapsing: defaults → config file → env vars → CLI.
///
/// `cli_auto_reply` is `Some(false)` when `--no-auto-reply` was passed.
pub fn resolve(config: &ChatlineConfig, cli_auto_reply: Option<bool>) -> ResolvedConfig {
    // Local participant: env → config → default
    let local_participant = std::env::var("CHATLINE_LOCAL_PARTICIPANT")
        .ok()
        .or_else(|| config.general.local_participant.clone())
        .unwrap_or_else(|| DEFAULT_LOCAL_PARTICIPANT.to_string());

    // Log level: env → config → debug
    let log_level = std::env::var("CHATLINE_LOG_LEVEL")
        .ok()
        .or_else(|| config.general.log_level.clone())
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Debug);

    let upload_step = env_parse("CHATLINE_UPLOAD_STEP")
        .or(config.delivery.upload_step)
        .unwrap_or(DEFAULT_UPLOAD_STEP)
        .clamp(1, 100);

    // Auto-reply toggle: CLI → env → config → on
    let auto_reply_enabled = cli_auto_reply
        .or_else(|| env_parse("CHATLINE_AUTO_REPLY"))
        .or(config.auto_reply.enabled)
        .unwrap_or(true);

    ResolvedConfig {
        local_participant,
        log_level,
        upload_step,
        upload_interval: millis(
            "CHATLINE_UPLOAD_INTERVAL_MS",
            config.delivery.upload_interval_ms,
            DEFAULT_UPLOAD_INTERVAL_MS,
        ),
        ack_delay: millis(
            "CHATLINE_ACK_DELAY_MS",
            config.delivery.ack_delay_ms,
            DEFAULT_ACK_DELAY_MS,
        ),
        auto_reply_enabled,
        auto_reply_delay: millis(
            "CHATLINE_AUTO_REPLY_DELAY_MS",
            config.auto_reply.delay_ms,
            DEFAULT_AUTO_REPLY_DELAY_MS,
        ),
        auto_reply_message: config
            .auto_reply
            .message
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTO_REPLY_MESSAGE.to_string()),
    }
}
