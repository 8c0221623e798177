//! Configuration management for PrintLink
//!
//! The configuration file is TOML or JSON, picked by extension. Every
//! section and field falls back to its default, so a file only needs the
//! values it changes:
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//!
//! [watchdog]
//! timeout_secs = 30
//! ```
//!
//! [`Config::link_config`] turns the file model into the runtime
//! configuration of a printer link.

use printlink_communication::{
    LinkConfig, PlannerConfig, QueueConfig, RecoveryConfig, SerialConfig, WatchdogConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SettingsError, SettingsResult};

const APP_DIR: &str = "printlink";

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path of the printer
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Delay between reopen attempts in milliseconds
    pub reopen_interval_ms: u64,
    /// DTR reset pulse length in milliseconds
    pub dtr_pulse_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        let defaults = SerialConfig::default();
        Self {
            port: defaults.port,
            baud_rate: defaults.baud_rate,
            read_timeout_ms: millis(defaults.read_timeout),
            reopen_interval_ms: millis(defaults.reopen_interval),
            dtr_pulse_ms: millis(defaults.dtr_pulse),
        }
    }
}

/// Serial queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Checksummed lines kept for resends
    pub history_length: usize,
    /// Firmware receive buffer in bytes
    pub rx_size: usize,
    /// Line numbers restart before this value
    pub line_number_modulus: u64,
    /// G-codes sent after recovering from a communication failure
    pub failure_gcodes: Vec<String>,
    /// G-codes sent after a reboot interrupted a print
    pub interrupted_print_gcodes: Vec<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            history_length: defaults.history_length,
            rx_size: defaults.rx_size,
            line_number_modulus: defaults.line_number_modulus,
            failure_gcodes: defaults.failure_gcodes,
            interrupted_print_gcodes: defaults.interrupted_print_gcodes,
        }
    }
}

/// Planner-fed estimator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Samples in the sliding window
    pub window_size: usize,
    /// Share of samples below the threshold, between 0 and 1
    pub heap_ratio: f64,
    /// Latencies above this many seconds are ignored
    pub ignore_above_secs: f64,
    /// Threshold in seconds until the window fills
    pub default_threshold_secs: f64,
    /// Adapt and persist the threshold
    pub dynamic_threshold: bool,
    /// Threshold file; the platform data directory when unset
    pub threshold_file: Option<PathBuf>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        let defaults = PlannerConfig::default();
        Self {
            window_size: defaults.window_size,
            heap_ratio: defaults.heap_ratio,
            ignore_above_secs: defaults.ignore_above.as_secs_f64(),
            default_threshold_secs: defaults.default_threshold.as_secs_f64(),
            dynamic_threshold: defaults.dynamic_threshold,
            threshold_file: None,
        }
    }
}

/// Stall watchdog settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Silence in seconds before the in-flight instruction is re-sent
    pub timeout_secs: u64,
    /// Check period in milliseconds
    pub check_interval_ms: u64,
    /// Consecutive stalls tolerated
    pub max_stalls: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        let defaults = WatchdogConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            check_interval_ms: millis(defaults.check_interval),
            max_stalls: defaults.max_stalls,
        }
    }
}

/// Communication failure recovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Pulse the printer reset line
    pub reset_printer: bool,
    /// Seconds sending stays blocked after the reset
    pub boot_grace_period_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let defaults = RecoveryConfig::default();
        Self {
            reset_printer: defaults.reset_printer,
            boot_grace_period_secs: defaults.boot_grace_period.as_secs(),
        }
    }
}

/// Complete link configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial port
    pub serial: SerialSettings,
    /// Serial queue
    pub queue: QueueSettings,
    /// Planner-fed estimator
    pub planner: PlannerSettings,
    /// Stall watchdog
    pub watchdog: WatchdogSettings,
    /// Failure recovery
    pub recovery: RecoverySettings,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = Format::of(path)?;
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::LoadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load config from file, or the defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    ///
    /// Missing parent directories are created.
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match Format::of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        let save_error = |source| SettingsError::SaveError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(save_error)?;
        }
        std::fs::write(path, content).map_err(save_error)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        if self.serial.port.trim().is_empty() {
            return Err(SettingsError::invalid("serial.port", "must not be empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(SettingsError::invalid("serial.baud_rate", "must be > 0"));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(SettingsError::invalid("serial.read_timeout_ms", "must be > 0"));
        }

        if self.queue.history_length == 0 {
            return Err(SettingsError::invalid("queue.history_length", "must be > 0"));
        }
        if self.queue.rx_size == 0 {
            return Err(SettingsError::invalid("queue.rx_size", "must be > 0"));
        }
        if self.queue.line_number_modulus < 2 {
            return Err(SettingsError::invalid(
                "queue.line_number_modulus",
                "must be at least 2",
            ));
        }
        for gcode in self
            .queue
            .failure_gcodes
            .iter()
            .chain(&self.queue.interrupted_print_gcodes)
        {
            if gcode.contains('\n') {
                return Err(SettingsError::invalid(
                    "queue",
                    format!("G-code {:?} spans several lines", gcode),
                ));
            }
        }

        if self.planner.window_size == 0 {
            return Err(SettingsError::invalid("planner.window_size", "must be > 0"));
        }
        if !(self.planner.heap_ratio > 0.0 && self.planner.heap_ratio < 1.0) {
            return Err(SettingsError::invalid(
                "planner.heap_ratio",
                "must be between 0 and 1",
            ));
        }
        if !is_positive_secs(self.planner.ignore_above_secs) {
            return Err(SettingsError::invalid("planner.ignore_above_secs", "must be > 0"));
        }
        if !is_positive_secs(self.planner.default_threshold_secs) {
            return Err(SettingsError::invalid(
                "planner.default_threshold_secs",
                "must be > 0",
            ));
        }

        if self.watchdog.timeout_secs == 0 {
            return Err(SettingsError::invalid("watchdog.timeout_secs", "must be > 0"));
        }
        if self.watchdog.check_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "watchdog.check_interval_ms",
                "must be > 0",
            ));
        }

        Ok(())
    }

    /// Path of the persisted planner threshold
    ///
    /// `None` when the threshold is static or no data directory exists.
    pub fn threshold_path(&self) -> Option<PathBuf> {
        if !self.planner.dynamic_threshold {
            return None;
        }
        self.planner
            .threshold_file
            .clone()
            .or_else(|| default_threshold_path().ok())
    }

    /// Runtime configuration of a printer link
    pub fn link_config(&self) -> LinkConfig {
        let planner_defaults = PlannerConfig::default();
        LinkConfig {
            serial: SerialConfig {
                port: self.serial.port.clone(),
                baud_rate: self.serial.baud_rate,
                read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
                reopen_interval: Duration::from_millis(self.serial.reopen_interval_ms),
                dtr_pulse: Duration::from_millis(self.serial.dtr_pulse_ms),
            },
            queue: QueueConfig {
                history_length: self.queue.history_length,
                rx_size: self.queue.rx_size,
                line_number_modulus: self.queue.line_number_modulus,
                failure_gcodes: self.queue.failure_gcodes.clone(),
                interrupted_print_gcodes: self.queue.interrupted_print_gcodes.clone(),
                planner: PlannerConfig {
                    window_size: self.planner.window_size,
                    heap_ratio: self.planner.heap_ratio,
                    ignore_above: Duration::try_from_secs_f64(self.planner.ignore_above_secs)
                        .unwrap_or(planner_defaults.ignore_above),
                    default_threshold: Duration::try_from_secs_f64(
                        self.planner.default_threshold_secs,
                    )
                    .unwrap_or(planner_defaults.default_threshold),
                    dynamic_threshold: self.planner.dynamic_threshold,
                    threshold_path: self.threshold_path(),
                },
            },
            watchdog: WatchdogConfig {
                timeout: Duration::from_secs(self.watchdog.timeout_secs),
                check_interval: Duration::from_millis(self.watchdog.check_interval_ms),
                max_stalls: self.watchdog.max_stalls,
            },
            recovery: RecoveryConfig {
                reset_printer: self.recovery.reset_printer,
                boot_grace_period: Duration::from_secs(self.recovery.boot_grace_period_secs),
            },
        }
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> SettingsResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join("config.toml"))
        .ok_or_else(|| SettingsError::ConfigDirectory("no configuration directory".to_string()))
}

/// Default location of the persisted planner threshold
pub fn default_threshold_path() -> SettingsResult<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR).join("threshold.data"))
        .ok_or_else(|| SettingsError::ConfigDirectory("no local data directory".to_string()))
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Json,
    Toml,
}

impl Format {
    fn of(path: &Path) -> SettingsResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            other => Err(SettingsError::UnsupportedFormat(
                other.unwrap_or("none").to_string(),
            )),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn is_positive_secs(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
