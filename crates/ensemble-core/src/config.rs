//! Configuration system for Ensemble.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ENSEMBLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ensemble/config.toml
//!   3. ~/.config/ensemble/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub network: NetworkConfig,
    pub clock: ClockConfig,
    pub link: LinkConfig,
    pub code: CodeConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name. Empty = auto-detect.
    pub interface: String,
    /// IPv4 multicast group for broadcast and sync traffic.
    pub multicast_addr: String,
    pub broadcast_port: u16,
    pub status_port: u16,
    pub clock_sync_port: u16,
    pub code_port: u16,
    pub control_port: u16,
}

/// Clock synchronization tuning. Every constant of the filter lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Interval between outgoing probes.
    pub probe_interval_ms: u64,
    /// EWMA smoothing constant applied to each accepted offset sample, in (0, 0.5].
    pub ewma_alpha: f64,
    /// Samples whose round trip exceeds this multiple of the recent median are dropped.
    pub outlier_rtt_multiple: f64,
    /// Lower bound on the median used for outlier rejection, so a near-zero
    /// loopback median does not reject every sample.
    pub outlier_floor_ms: i64,
    /// Number of recent samples used for the median round trip and offset variance.
    pub window: usize,
    /// Accepted round trips needed before outlier rejection starts.
    pub min_rtt_samples: usize,
    /// Offset variance (ms²) at or below which the estimate counts as settled.
    pub variance_bound_ms2: f64,
    /// Fraction of the gap to the stability target closed per accepted sample.
    pub stability_gain: f64,
    /// Stability at or above which the synchronizer may become `Stable`.
    pub stable_threshold: f64,
    /// How long stability must stay above the threshold before `Stable`.
    pub min_stable_ms: u64,
    /// Stability at or above which `stable_time_now` is meaningful.
    pub usable_threshold: f64,
    /// With no accepted sample for this long, stability decays on each tick.
    pub silence_timeout_ms: u64,
    /// Multiplicative decay applied to stability per silent tick.
    pub silence_decay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Attempts per `send` / `send_bulk` call before giving up.
    pub max_attempts: usize,
    /// Connect timeout for bulk transfers.
    pub connect_timeout_ms: u64,
    /// Write timeout for bulk transfers.
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Accept code from any controller.
    Open,
    /// Accept code only from a controller on this host.
    Local,
    /// Do not listen for code.
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeConfig {
    /// Pre-shared passphrase. Controller and devices must agree.
    pub encryption_key: String,
    pub access_mode: AccessMode,
    /// Largest sealed unit accepted on the code port.
    pub max_unit_bytes: usize,
    /// A code connection that has not reached EOF by then is dropped.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name advertised in announcements. Empty = hostname.
    pub name: String,
    /// Interval between `/device/alive` announcements.
    pub alive_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            multicast_addr: wire::MULTICAST_ADDR.to_string(),
            broadcast_port: wire::BROADCAST_PORT,
            status_port: wire::STATUS_FROM_DEVICE_PORT,
            clock_sync_port: wire::CLOCK_SYNC_PORT,
            code_port: wire::CODE_TO_DEVICE_PORT,
            control_port: wire::CONTROL_TO_DEVICE_PORT,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            ewma_alpha: 0.25,
            outlier_rtt_multiple: 3.0,
            outlier_floor_ms: 5,
            window: 16,
            min_rtt_samples: 3,
            variance_bound_ms2: 25.0,
            stability_gain: 0.2,
            stable_threshold: 0.8,
            min_stable_ms: 3000,
            usable_threshold: 0.5,
            silence_timeout_ms: 5000,
            silence_decay: 0.8,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout_ms: 2000,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            encryption_key: "ensemble-default-key".to_string(),
            access_mode: AccessMode::Open,
            max_unit_bytes: 4 * 1024 * 1024,
            read_timeout_ms: 30_000,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            alive_interval_ms: wire::ALIVE_INTERVAL_MS,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ensemble")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EnsembleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EnsembleConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ENSEMBLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EnsembleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the clock filter or link cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.clock;
        if !(c.ewma_alpha > 0.0 && c.ewma_alpha <= 0.5) {
            return Err(ConfigError::Invalid(
                "clock.ewma_alpha",
                format!("{} (must be in (0, 0.5])", c.ewma_alpha),
            ));
        }
        if c.outlier_rtt_multiple <= 1.0 {
            return Err(ConfigError::Invalid(
                "clock.outlier_rtt_multiple",
                format!("{} (must exceed 1.0)", c.outlier_rtt_multiple),
            ));
        }
        if c.window < 2 {
            return Err(ConfigError::Invalid("clock.window", c.window.to_string()));
        }
        if c.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid("clock.probe_interval_ms", "0".into()));
        }
        if self.link.max_attempts == 0 {
            return Err(ConfigError::Invalid("link.max_attempts", "0".into()));
        }
        Ok(())
    }

    /// Apply ENSEMBLE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENSEMBLE_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Ok(v) = std::env::var("ENSEMBLE_NETWORK__MULTICAST_ADDR") {
            self.network.multicast_addr = v;
        }
        if let Ok(v) = std::env::var("ENSEMBLE_NETWORK__BROADCAST_PORT") {
            if let Ok(p) = v.parse() {
                self.network.broadcast_port = p;
            }
        }
        if let Ok(v) = std::env::var("ENSEMBLE_NETWORK__CODE_PORT") {
            if let Ok(p) = v.parse() {
                self.network.code_port = p;
            }
        }
        if let Ok(v) = std::env::var("ENSEMBLE_NETWORK__CONTROL_PORT") {
            if let Ok(p) = v.parse() {
                self.network.control_port = p;
            }
        }
        if let Ok(v) = std::env::var("ENSEMBLE_CODE__ENCRYPTION_KEY") {
            self.code.encryption_key = v;
        }
        if let Ok(v) = std::env::var("ENSEMBLE_CODE__ACCESS_MODE") {
            match v.as_str() {
                "open" => self.code.access_mode = AccessMode::Open,
                "local" => self.code.access_mode = AccessMode::Local,
                "closed" => self.code.access_mode = AccessMode::Closed,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("ENSEMBLE_DEVICE__NAME") {
            self.device.name = v;
        }
    }
}
