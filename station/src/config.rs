//! Station configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::TailMode;
use crate::paths::StatePaths;

/// Configuration problems that must stop the host before anything starts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("FIL_WALLET_ADDRESS is required. Set it in the environment or as wallet-address in the config file.")]
    MissingWalletAddress,

    #[error("Invalid wallet address '{0}': expected an f1/f4 address or a 0x-prefixed 40-character hex address")]
    InvalidWalletAddress(String),

    #[error("Module definition #{index} is invalid: {reason}")]
    InvalidModule { index: usize, reason: String },
}

/// Main station configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Wallet address reported to modules and used for reward lookups
    pub wallet_address: Option<String>,

    /// Passphrase protecting the identity keystore
    pub passphrase: Option<String>,

    /// Root for logs, secrets and module state
    pub state_root: Option<PathBuf>,

    /// Root for synced module sources and module caches
    pub cache_root: Option<PathBuf>,

    /// Replace an unreadable identity keystore with a fresh identity
    pub recreate_station_id_on_error: bool,

    /// Log level for the host log (TRACE, DEBUG, INFO, WARN, ERROR)
    pub log_level: Option<String>,

    pub supervisor: SupervisorConfig,

    pub tail: TailConfig,

    /// Modules to supervise
    pub modules: Vec<ModuleConfig>,
}

impl Config {
    /// Validate configuration before starting the supervisor
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = self
            .wallet_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(ConfigError::MissingWalletAddress)?;
        if !is_valid_wallet_address(address) {
            return Err(ConfigError::InvalidWalletAddress(address.to_string()));
        }

        for (index, module) in self.modules.iter().enumerate() {
            let reason = if module.name.is_empty() {
                Some("name is empty")
            } else if module.name.contains(['/', '\\']) || module.name.starts_with('.') {
                Some("name must be a plain file name")
            } else if module.executable.is_empty() {
                Some("executable is empty")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ConfigError::InvalidModule {
                    index,
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Load configuration with fallback chain, then apply environment overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file(config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: ./station.yml
        let local_config = PathBuf::from("station.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/station/station.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("station").join("station.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Environment variables take precedence over file values
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FIL_WALLET_ADDRESS") {
            self.wallet_address = Some(v);
        }
        if let Some(v) = var("PASSPHRASE").filter(|v| !v.is_empty()) {
            self.passphrase = Some(v);
        }
        if let Some(v) = var("STATE_ROOT").filter(|v| !v.is_empty()) {
            self.state_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("CACHE_ROOT").filter(|v| !v.is_empty()) {
            self.cache_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("RECREATE_STATION_ID_ON_ERROR") {
            self.recreate_station_id_on_error = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Resolved state/cache roots
    pub fn paths(&self) -> StatePaths {
        let defaults = StatePaths::default_roots();
        StatePaths::new(
            self.state_root.clone().unwrap_or_else(|| defaults.state_root().to_path_buf()),
            self.cache_root.clone().unwrap_or_else(|| defaults.cache_root().to_path_buf()),
        )
    }
}

/// `f1…`/`f4…` Filecoin addresses or `0x` + 40 hex digits
pub fn is_valid_wallet_address(address: &str) -> bool {
    if let Some(hex_part) = address.strip_prefix("0x") {
        return hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit());
    }
    (address.starts_with("f1") || address.starts_with("f4"))
        && address.len() > 3
        && address.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Module supervision timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SupervisorConfig {
    /// Seconds between source update checks
    pub update_interval_secs: u64,

    /// Milliseconds to wait after SIGTERM before SIGKILL
    pub kill_grace_ms: u64,

    /// Seconds between crash reports sent to the error sink
    pub report_window_secs: u64,

    /// Milliseconds allowed for a reward lookup attempt
    pub reward_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 600,
            kill_grace_ms: 5_000,
            report_window_secs: 4 * 60 * 60,
            reward_timeout_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_secs(self.report_window_secs)
    }

    pub fn reward_timeout(&self) -> Duration {
        Duration::from_millis(self.reward_timeout_ms)
    }
}

/// File tailing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TailConfig {
    pub mode: TailMode,

    pub poll_interval_ms: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            mode: TailMode::Auto,
            poll_interval_ms: 250,
        }
    }
}

impl TailConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One supervised module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModuleConfig {
    pub name: String,

    /// Program that runs the module (e.g. a runtime binary)
    pub executable: String,

    /// Arguments; `{source}` is replaced with the synced source directory
    #[serde(default)]
    pub args: Vec<String>,

    /// Source reference handed to the source resolver
    #[serde(default)]
    pub source: String,

    /// Extra environment for the module process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
