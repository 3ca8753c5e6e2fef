//! Campaign configuration
//!
//! Loaded from a TOML file where every field has a default, then
//! overridden by command line flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serial settings for one link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    pub port: String,
    pub baud: u32,
}

impl PortSettings {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub port: String,
    pub baud: u32,
    /// Upper bound on a single blocking read
    pub read_timeout_ms: u64,
    /// Unmatched or out-of-sequence lines tolerated before sync is considered lost
    pub no_match_threshold: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB1".to_string(),
            baud: 115200,
            read_timeout_ms: 500,
            no_match_threshold: 50,
        }
    }
}

impl TelemetryConfig {
    pub fn settings(&self) -> PortSettings {
        PortSettings::new(&self.port, self.baud)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    pub port: String,
    pub baud: u32,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
        }
    }
}

impl ResetConfig {
    pub fn settings(&self) -> PortSettings {
        PortSettings::new(&self.port, self.baud)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Iterations that must be exceeded before the experiment counts as complete
    pub min_observations: u32,
    /// Idle time without progress after which the target is considered stalled
    pub stall_timeout_secs: u64,
    /// Polling interval shared by the watchdog and the driver loop
    pub tick_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            min_observations: 100,
            stall_timeout_secs: 60,
            tick_ms: 1000,
        }
    }
}

impl WatchdogConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// When false, the firmware build step is skipped
    pub enabled: bool,
    pub working_dir: PathBuf,
    pub make: String,
    pub m4: String,
    /// m4 template rendered into `header`
    pub template: String,
    pub header: String,
    /// Number of distinct benchmark kinds; configuration digits run 1..=N
    pub benchmark_kinds: u8,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            working_dir: PathBuf::from("../xRTOS_MMU_SEMAPHORE"),
            make: "make".to_string(),
            m4: "m4".to_string(),
            template: "benchmark_config.m4".to_string(),
            header: "benchmark_config.h".to_string(),
            benchmark_kinds: 9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("results"),
            extension: "log".to_string(),
        }
    }
}

/// Complete campaign configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub telemetry: TelemetryConfig,
    pub reset: ResetConfig,
    pub watchdog: WatchdogConfig,
    pub build: BuildConfig,
    pub output: OutputConfig,
}

impl CampaignConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.baud == 0 || self.reset.baud == 0 {
            return Err(ConfigError::Invalid("baud rate must be non-zero".into()));
        }
        if self.telemetry.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.read_timeout_ms must be non-zero".into(),
            ));
        }
        if self.watchdog.tick_ms == 0 {
            return Err(ConfigError::Invalid("watchdog.tick_ms must be non-zero".into()));
        }
        if self.watchdog.min_observations == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.min_observations must be at least 1".into(),
            ));
        }
        if !(1..=9).contains(&self.build.benchmark_kinds) {
            return Err(ConfigError::Invalid(format!(
                "build.benchmark_kinds must be within 1..=9, got {}",
                self.build.benchmark_kinds
            )));
        }
        Ok(())
    }

    /// Render the configuration back to TOML
    pub fn to_toml(&self) -> String {
        // Plain structs of strings and integers always serialize
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
