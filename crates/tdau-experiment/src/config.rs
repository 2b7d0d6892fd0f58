//! Bench configuration snapshot.
//!
//! A run is described by one immutable [`BenchConfig`], loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `TDAU_BENCH_`, nested keys split on
//!    `__` (e.g. `TDAU_BENCH_BATH__ADDRESS=COM7`)
//!
//! ```toml
//! [project]
//! name = "lot42"
//! step = "qualification"
//! user_name = "J. Operator"
//! user_email = "operator@example.com"
//!
//! [plan]
//! vcc = 3.3
//! ie1_ua = [1.0, 2.0]
//! ie2_ua = [10.0]
//! ie3_ua = [100.0]
//! temperature = { low = -40.0, high = 80.0, step = 20.0 }
//!
//! [[devices]]
//! address = "COM4"
//! family = "three_diode"
//! channels = [1, 2, 3, 4]
//! profile = "leakage_enabled"
//!
//! [bath]
//! address = "COM3"
//! baud_rate = 2400
//!
//! [storage]
//! url = "sqlite://bench.db"
//! ```
//!
//! Currents are entered in µA and converted to amperes when the plan is built.

use crate::plans::{build_temperature_sweep, SweepMode};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tdau_core::{AppResult, BenchError};
use tdau_hardware::{BathPolicy, ControlProfile};
use tracing::{debug, info};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TDAU_BENCH_";

/// Conversion from the configured µA to the A written to the boards.
pub const MICROAMPS: f64 = 1e-6;

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong types)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    pub project: ProjectConfig,
    pub plan: PlanConfig,
    /// Ordered board roster; diode ids follow this order.
    pub devices: Vec<DeviceConfig>,
    pub bath: BathConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Supply voltage recorded with every row.
    pub vcc: f64,
    pub ie1_ua: Vec<f64>,
    pub ie2_ua: Vec<f64>,
    pub ie3_ua: Vec<f64>,
    pub temperature: SweepConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub low: f64,
    pub high: f64,
    pub step: f64,
    #[serde(default)]
    pub mode: SweepMode,
}

/// Board variants that differ in populated channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    #[default]
    FourChannel,
    /// Three diodes populated; channel 4 is never driven or read.
    ThreeDiode,
}

impl DeviceFamily {
    pub fn skipped_channels(self) -> &'static [u8] {
        match self {
            DeviceFamily::FourChannel => &[],
            DeviceFamily::ThreeDiode => &[4],
        }
    }

    pub fn skips(self, channel: u8) -> bool {
        self.skipped_channels().contains(&channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub address: String,
    #[serde(default)]
    pub family: DeviceFamily,
    /// Enabled channels, 1..=4.
    #[serde(default = "default_channels")]
    pub channels: Vec<u8>,
    #[serde(default)]
    pub profile: ControlProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BathConfig {
    pub address: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub policy: BathPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_url")]
    pub url: String,
    /// Create the per-project flat view once the run has been derived.
    #[serde(default = "default_true")]
    pub create_view: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            create_view: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_channels() -> Vec<u8> {
    vec![1, 2, 3, 4]
}

fn default_baud_rate() -> u32 {
    2400
}

fn default_storage_url() -> String {
    "sqlite://tdau_bench.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl BenchConfig {
    /// Load from a TOML file with environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.display().to_string()));
        }
        debug!("Loading bench config from: {}", path.display());
        let config = Self::extract(Figment::new().merge(Toml::file(path)))?;
        info!(
            project = %config.project.name,
            devices = config.devices.len(),
            "Loaded bench config"
        );
        Ok(config)
    }

    /// Load from TOML text with environment overrides, then validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigLoadError> {
        Self::extract(Figment::new().merge(Toml::string(text)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigLoadError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigLoadError::ValidationError(e.to_string()))?;
        Ok(config)
    }

    /// Check the snapshot for missing or contradictory parameters.
    ///
    /// # Errors
    ///
    /// [`BenchError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(BenchError::Configuration(msg));

        if self.project.name.trim().is_empty() {
            return invalid("project name is empty".into());
        }
        if !self.plan.vcc.is_finite() {
            return invalid(format!("vcc {} is not a number", self.plan.vcc));
        }

        for (name, list) in [
            ("ie1_ua", &self.plan.ie1_ua),
            ("ie2_ua", &self.plan.ie2_ua),
            ("ie3_ua", &self.plan.ie3_ua),
        ] {
            if list.is_empty() {
                return invalid(format!("current list {} is empty", name));
            }
            if let Some(bad) = list.iter().find(|v| !v.is_finite() || **v <= 0.0) {
                return invalid(format!("current {} µA in {} must be positive", bad, name));
            }
        }

        let sweep = self.plan.temperature;
        build_temperature_sweep(sweep.low, sweep.high, sweep.step, sweep.mode)?;

        if self.devices.is_empty() {
            return invalid("device roster is empty".into());
        }
        let mut addresses = HashSet::new();
        for device in &self.devices {
            if device.address.trim().is_empty() {
                return invalid("device with empty address".into());
            }
            if !addresses.insert(device.address.as_str()) {
                return invalid(format!("duplicate device address: {}", device.address));
            }
            if device.channels.is_empty() {
                return invalid(format!("device {} has no enabled channels", device.address));
            }
            let mut seen = HashSet::new();
            for channel in &device.channels {
                if !(1..=4).contains(channel) {
                    return invalid(format!(
                        "device {}: channel {} is outside 1..=4",
                        device.address, channel
                    ));
                }
                if !seen.insert(*channel) {
                    return invalid(format!(
                        "device {}: channel {} listed twice",
                        device.address, channel
                    ));
                }
            }
        }

        if self.bath.address.trim().is_empty() {
            return invalid("bath address is empty".into());
        }
        if addresses.contains(self.bath.address.as_str()) {
            return invalid(format!(
                "bath address {} is also assigned to a device",
                self.bath.address
            ));
        }
        let policy = &self.bath.policy;
        if !(policy.tolerance > 0.0) {
            return invalid(format!("bath tolerance {} must be positive", policy.tolerance));
        }
        if policy.poll_interval.is_zero() {
            return invalid("bath poll interval must be positive".into());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return invalid(format!(
                "invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return invalid(format!(
                "invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }
        Ok(())
    }

    /// Configured currents in amperes.
    pub fn currents_amps(&self) -> [Vec<f64>; 3] {
        let convert = |list: &[f64]| list.iter().map(|ua| ua * MICROAMPS).collect();
        [
            convert(&self.plan.ie1_ua),
            convert(&self.plan.ie2_ua),
            convert(&self.plan.ie3_ua),
        ]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    pub(crate) const SAMPLE: &str = r#"
        [project]
        name = "lot42"
        step = "qual"
        user_name = "operator"
        user_email = "operator@example.com"

        [plan]
        vcc = 3.3
        ie1_ua = [1.0, 2.0]
        ie2_ua = [10.0]
        ie3_ua = [100.0]
        temperature = { low = -40.0, high = -20.0, step = 10.0 }

        [[devices]]
        address = "COM4"
        family = "three_diode"

        [[devices]]
        address = "COM5"
        channels = [1, 3]
        profile = "no_leak_compensation"

        [bath]
        address = "COM3"

        [bath.policy]
        settle_time = 60
    "#;

    #[test]
    #[serial]
    fn parses_sample_with_defaults() {
        let config = BenchConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.devices[0].family, DeviceFamily::ThreeDiode);
        assert_eq!(config.devices[0].channels, vec![1, 2, 3, 4]);
        assert_eq!(config.devices[0].profile, ControlProfile::LeakageEnabled);
        assert_eq!(config.devices[1].profile, ControlProfile::NoLeakCompensation);
        assert_eq!(config.bath.baud_rate, 2400);
        assert_eq!(config.bath.policy.settle_time, Duration::from_secs(60));
        assert_eq!(config.bath.policy.tolerance, 0.2);
        assert_eq!(config.plan.temperature.mode, SweepMode::Single);
        assert_eq!(config.storage.url, "sqlite://tdau_bench.db");
        assert!(config.storage.create_view);

        let [ie1, _, ie3] = config.currents_amps();
        assert_eq!(ie1, vec![1e-6, 2e-6]);
        assert_eq!(ie3, vec![100e-6]);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        std::env::set_var("TDAU_BENCH_BATH__ADDRESS", "COM9");
        std::env::set_var("TDAU_BENCH_STORAGE__URL", "sqlite::memory:");
        let result = BenchConfig::from_toml_str(SAMPLE);
        std::env::remove_var("TDAU_BENCH_BATH__ADDRESS");
        std::env::remove_var("TDAU_BENCH_STORAGE__URL");

        let config = result.unwrap();
        assert_eq!(config.bath.address, "COM9");
        assert_eq!(config.storage.url, "sqlite::memory:");
    }

    #[test]
    #[serial]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(BenchConfig::load(&path).unwrap().project.name, "lot42");

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            BenchConfig::load(&missing),
            Err(ConfigLoadError::NotFound(_))
        ));
    }

    #[test]
    #[serial]
    fn contradictions_are_rejected() {
        let base = BenchConfig::from_toml_str(SAMPLE).unwrap();

        let mut config = base.clone();
        config.plan.ie2_ua.clear();
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));

        let mut config = base.clone();
        config.plan.temperature.low = 10.0;
        config.plan.temperature.high = 0.0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.devices[1].address = "COM4".into();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.devices[1].channels = vec![0, 1];
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.bath.address = "COM5".into();
        assert!(config.validate().is_err());

        let mut config = base;
        config.plan.ie1_ua.push(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn logging_table_is_checked() {
        let mut config = BenchConfig::from_toml_str(SAMPLE).unwrap();
        config.logging.format = "json".into();
        assert!(config.validate().is_ok());

        config.logging.format = "xml".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(err.to_string().contains("xml"));

        config.logging.format = "compact".into();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn unknown_family_is_a_parse_error() {
        let text = SAMPLE.replace("three_diode", "five_diode");
        assert!(matches!(
            BenchConfig::from_toml_str(&text),
            Err(ConfigLoadError::ParseError(_))
        ));
    }
}
