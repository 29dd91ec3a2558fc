//! Configuration for the convosync client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/convosync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.
//!
//! Idle-timeout settings fail closed: a value of the wrong type does not
//! abort loading, it forces auto-logout on with the shorter timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use convosync_proto::message::PrincipalId;

use crate::crypto::{ChaChaCipher, Cipher};
use crate::error::ErrorKind;
use crate::session::{Preference, SessionConfig, SessionPolicy};
use crate::sync::SyncConfig;

/// Errors that can occur when loading configuration.
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

    /// The encryption key is not 64 hex characters.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Encryption is enabled but no key was configured.
    #[error("encryption is enabled but no encryption key is configured")]
    MissingKey,
}

impl ConfigError {
    /// Maps this error onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigurationAbsent
    }
}

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    session: SessionFileConfig,
    messaging: MessagingFileConfig,
    network: NetworkFileConfig,
    storage: StorageFileConfig,
}

/// `[session]` section. The idle preferences stay untyped so a bad value
/// can be told apart from a missing one.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    auto_logout_enabled: Option<toml::Value>,
    session_timeout_minutes: Option<toml::Value>,
    warning_window_minutes: Option<toml::Value>,
    poll_interval_secs: Option<u64>,
    activity_throttle_ms: Option<u64>,
}

/// `[messaging]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MessagingFileConfig {
    encryption_enabled: Option<bool>,
    encryption_key: Option<String>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    backend_url: Option<String>,
    principal: Option<String>,
    request_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    state_file: Option<String>,
}

/// Resolved `[messaging]` settings.
#[derive(Clone)]
pub struct MessagingConfig {
    /// Whether newly opened conversations are sealed.
    pub encryption_enabled: bool,
    /// Hex-encoded 32-byte key.
    pub encryption_key: Option<String>,
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Largest reconnect delay.
    pub reconnect_max_delay: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: false,
            encryption_key: None,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for MessagingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingConfig")
            .field("encryption_enabled", &self.encryption_enabled)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("reconnect_base_delay", &self.reconnect_base_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .finish()
    }
}

impl MessagingConfig {
    /// Builds the cipher from the configured key.
    ///
    /// Returns `Ok(None)` when encryption is off and no key is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] for a malformed key and
    /// [`ConfigError::MissingKey`] when encryption is on without a key.
    pub fn cipher(&self) -> Result<Option<Arc<dyn Cipher>>, ConfigError> {
        match self.encryption_key.as_deref() {
            Some(key) => {
                let cipher = ChaChaCipher::from_hex(key)
                    .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
                Ok(Some(Arc::new(cipher)))
            }
            None if self.encryption_enabled => Err(ConfigError::MissingKey),
            None => Ok(None),
        }
    }
}

/// Resolved `[network]` settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// WebSocket URL of the backend.
    pub backend_url: Option<String>,
    /// Principal to log in as.
    pub principal: Option<PrincipalId>,
    /// Timeout for a single backend request.
    pub request_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            principal: None,
            request_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Idle policy and session driver tuning.
    pub session: SessionConfig,
    /// Encryption and reconnect settings.
    pub messaging: MessagingConfig,
    /// Backend connection settings.
    pub network: NetworkConfig,
    /// Path of the persistent key-value file.
    pub state_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            messaging: MessagingConfig::default(),
            network: NetworkConfig::default(),
            state_file: default_state_file(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let policy = SessionPolicy::from_preferences(
            bool_preference(file.session.auto_logout_enabled.as_ref()),
            int_preference(file.session.session_timeout_minutes.as_ref()),
            int_preference(file.session.warning_window_minutes.as_ref()),
        );

        Self {
            session: SessionConfig {
                policy,
                poll_interval: file
                    .session
                    .poll_interval_secs
                    .filter(|s| *s > 0)
                    .map_or(defaults.session.poll_interval, Duration::from_secs),
                activity_throttle: file
                    .session
                    .activity_throttle_ms
                    .map_or(defaults.session.activity_throttle, Duration::from_millis),
            },
            messaging: MessagingConfig {
                encryption_enabled: cli.encrypt
                    || file
                        .messaging
                        .encryption_enabled
                        .unwrap_or(defaults.messaging.encryption_enabled),
                encryption_key: cli
                    .encryption_key
                    .clone()
                    .or_else(|| file.messaging.encryption_key.clone()),
                reconnect_base_delay: file
                    .messaging
                    .reconnect_base_delay_ms
                    .map_or(defaults.messaging.reconnect_base_delay, Duration::from_millis),
                reconnect_max_delay: file
                    .messaging
                    .reconnect_max_delay_ms
                    .map_or(defaults.messaging.reconnect_max_delay, Duration::from_millis),
            },
            network: NetworkConfig {
                backend_url: cli
                    .backend_url
                    .clone()
                    .or_else(|| file.network.backend_url.clone()),
                principal: cli
                    .principal
                    .clone()
                    .or_else(|| file.network.principal.clone())
                    .filter(|p| !p.is_empty())
                    .map(PrincipalId::new),
                request_timeout: file
                    .network
                    .request_timeout_secs
                    .map_or(defaults.network.request_timeout, Duration::from_secs),
                channel_capacity: file
                    .network
                    .channel_capacity
                    .unwrap_or(defaults.network.channel_capacity),
            },
            state_file: cli
                .state_file
                .clone()
                .or_else(|| file.storage.state_file.as_deref().map(expand_home))
                .unwrap_or(defaults.state_file),
        }
    }

    /// Settings for the realtime sync task.
    #[must_use]
    pub const fn sync(&self) -> SyncConfig {
        SyncConfig {
            reconnect_base_delay: self.messaging.reconnect_base_delay,
            reconnect_max_delay: self.messaging.reconnect_max_delay,
            channel_capacity: self.network.channel_capacity,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless conversation sync client")]
pub struct CliArgs {
    /// WebSocket URL of the backend.
    #[arg(long, env = "CONVOSYNC_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Principal to log in as.
    #[arg(long, env = "CONVOSYNC_PRINCIPAL")]
    pub principal: Option<String>,

    /// Conversation to open at startup.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Keep the session alive regardless of inactivity.
    #[arg(long)]
    pub remember_me: bool,

    /// Seal messages in newly opened conversations.
    #[arg(long)]
    pub encrypt: bool,

    /// Hex-encoded 32-byte encryption key.
    #[arg(long, env = "CONVOSYNC_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Path of the persistent state file.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Path to config file (default: `~/.config/convosync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CONVOSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/convosync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

fn bool_preference(value: Option<&toml::Value>) -> Preference<bool> {
    match value {
        None => Preference::Missing,
        Some(toml::Value::Boolean(b)) => Preference::Value(*b),
        Some(_) => Preference::Invalid,
    }
}

fn int_preference(value: Option<&toml::Value>) -> Preference<i64> {
    match value {
        None => Preference::Missing,
        Some(toml::Value::Integer(i)) => Preference::Value(*i),
        Some(_) => Preference::Invalid,
    }
}

fn default_state_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("convosync")
        .join("state.json")
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
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
        config_dir.join("convosync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
