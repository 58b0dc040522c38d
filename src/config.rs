//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `HOLODAQ_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! HOLODAQ_APPLICATION__LOG_LEVEL=debug
//! HOLODAQ_DEVICES__LASER__PORT=/dev/ttyUSB2
//! HOLODAQ_LASER__MAX_POWER_MW=8.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use holo_daq::config::HoloConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = HoloConfig::load_from("config/holo_daq.toml")?;
//!     println!("Film: {} x {} m", config.scan.film_width_m, config.scan.film_height_m);
//!     Ok(())
//! }
//! ```

use crate::error::{HoloError, HoloResult};
use crate::estimator::DEFAULT_UNIT_RATE;
use crate::exposure::ExposureMap;
use crate::hardware::{LaserSettings, SerialPortConfig, StageSettings};
use crate::raster::FilmGeometry;
use crate::sequencer::{SequencerSettings, DEFAULT_PAUSE_POLL};
use crate::session::SessionConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "HOLODAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoloConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial ports of the three devices
    pub devices: DeviceConfig,
    /// Stage motion parameters
    #[serde(default)]
    pub stage: StageSettings,
    /// Laser limits and timing
    #[serde(default)]
    pub laser: LaserSettings,
    /// Film size and exposure rules
    pub scan: ScanConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// One serial port per device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stage controller port
    pub stage: SerialPortConfig,
    /// Shutter port
    pub shutter: SerialPortConfig,
    /// Laser head port
    pub laser: SerialPortConfig,
}

/// Scan definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Film width in meters
    pub film_width_m: f64,
    /// Film height in meters
    pub film_height_m: f64,
    /// Exposure rules, `[start,end):seconds` or `[start,end):slope x`
    #[serde(default)]
    pub exposure_rules: Vec<String>,
    /// Intensity ranges forced to zero exposure, applied after the exposure rules
    #[serde(default)]
    pub ignore_rules: Vec<String>,
    /// Power rules in mW, same grammar as exposure rules
    #[serde(default)]
    pub power_rules: Vec<String>,
    /// Stage feed used for the runtime estimate, meters of film per second
    #[serde(default = "default_unit_rate")]
    pub unit_rate: f64,
    /// Re-check interval while paused
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub pause_poll: Duration,
}

fn default_name() -> String {
    "holo_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_unit_rate() -> f64 {
    DEFAULT_UNIT_RATE
}

fn default_pause_poll() -> Duration {
    DEFAULT_PAUSE_POLL
}

impl HoloConfig {
    /// Load configuration from a TOML file and `HOLODAQ_` environment variables,
    /// then validate it.
    ///
    /// Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HoloResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration held in a string. No environment overrides.
    pub fn from_toml_str(toml: &str) -> HoloResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks the log level, each serial port's framing, film dimensions,
    /// the laser ceiling and the estimator feed rate.
    pub fn validate(&self) -> HoloResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(HoloError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (device, port) in [
            ("stage", &self.devices.stage),
            ("shutter", &self.devices.shutter),
            ("laser", &self.devices.laser),
        ] {
            port.validate()
                .map_err(|e| HoloError::Configuration(format!("devices.{device}: {e}")))?;
        }

        let mut ports = std::collections::HashSet::new();
        for port in [&self.devices.stage, &self.devices.shutter, &self.devices.laser] {
            if !ports.insert(port.port.as_str()) {
                return Err(HoloError::Configuration(format!(
                    "Serial port '{}' is assigned to more than one device",
                    port.port
                )));
            }
        }

        self.geometry()?;

        if !self.laser.max_power_mw.is_finite() || self.laser.max_power_mw <= 0.0 {
            return Err(HoloError::Configuration(format!(
                "laser.max_power_mw must be positive, got {}",
                self.laser.max_power_mw
            )));
        }
        if !self.scan.unit_rate.is_finite() || self.scan.unit_rate <= 0.0 {
            return Err(HoloError::Configuration(format!(
                "scan.unit_rate must be positive, got {}",
                self.scan.unit_rate
            )));
        }
        if self.scan.pause_poll.is_zero() {
            return Err(HoloError::Configuration(
                "scan.pause_poll must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Film geometry from the scan section.
    pub fn geometry(&self) -> HoloResult<FilmGeometry> {
        FilmGeometry::new(self.scan.film_width_m, self.scan.film_height_m)
    }

    /// Build exposure and power tables from the configured rules.
    pub fn exposure_map(&self) -> HoloResult<ExposureMap> {
        ExposureMap::builder(self.laser.max_power_mw)
            .exposure(&self.scan.exposure_rules)
            .ignore(&self.scan.ignore_rules)
            .power(&self.scan.power_rules)
            .build()
    }

    /// Scan loop timing from the stage and scan sections.
    pub fn sequencer_settings(&self) -> SequencerSettings {
        SequencerSettings {
            settle_delay: self.stage.settle_delay,
            pause_poll: self.scan.pause_poll,
            unit_rate: self.scan.unit_rate,
        }
    }

    /// Everything a session needs from this configuration.
    pub fn session_config(&self) -> HoloResult<SessionConfig> {
        Ok(SessionConfig {
            stage_port: self.devices.stage.clone(),
            shutter_port: self.devices.shutter.clone(),
            laser_port: self.devices.laser.clone(),
            stage: self.stage.clone(),
            laser: self.laser.clone(),
            sequencer: self.sequencer_settings(),
            geometry: self.geometry()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[devices.stage]
port = "/dev/ttyUSB0"

[devices.shutter]
port = "/dev/ttyUSB1"

[devices.laser]
port = "/dev/ttyUSB2"
baud_rate = 19200

[scan]
film_width_m = 0.05
film_height_m = 0.04
exposure_rules = ["[0,255):1.5"]
ignore_rules = ["[100,150)"]
power_rules = ["[0,256):5.0"]
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = HoloConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.devices.stage.baud_rate, 9600);
        assert_eq!(config.devices.laser.baud_rate, 19200);
        assert_eq!(config.laser.max_power_mw, 10.0);
        assert_eq!(config.stage.velocity, 1.0);
        assert_eq!(config.scan.unit_rate, DEFAULT_UNIT_RATE);
        assert_eq!(config.scan.pause_poll, DEFAULT_PAUSE_POLL);
    }

    #[test]
    fn test_durations_are_humantime() {
        let toml = format!(
            "{MINIMAL}pause_poll = \"250ms\"\n\n[laser]\nmax_power_mw = 8.0\npower_change_pause = \"2s\"\n"
        );
        let config = HoloConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.scan.pause_poll, Duration::from_millis(250));
        assert_eq!(config.laser.power_change_pause, Duration::from_secs(2));
        assert_eq!(config.laser.max_power_mw, 8.0);
    }

    #[test]
    fn test_exposure_map_from_rules() {
        let config = HoloConfig::from_toml_str(MINIMAL).unwrap();
        let map = config.exposure_map().unwrap();
        assert_eq!(map.exposure_for(99), 1.5);
        assert_eq!(map.exposure_for(120), 0.0);
        assert_eq!(map.power_for(120), 5.0);
    }

    #[test]
    fn test_invalid_log_level() {
        let toml = format!("[application]\nlog_level = \"loud\"\n{MINIMAL}");
        let err = HoloConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_shared_port_is_rejected() {
        let toml = MINIMAL.replace("/dev/ttyUSB1", "/dev/ttyUSB0");
        let err = HoloConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("more than one device"));
    }

    #[test]
    fn test_non_positive_film_is_rejected() {
        let toml = MINIMAL.replace("film_height_m = 0.04", "film_height_m = 0.0");
        assert!(matches!(
            HoloConfig::from_toml_str(&toml),
            Err(HoloError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_missing_section_is_a_load_error() {
        let err = HoloConfig::from_toml_str("[scan]\nfilm_width_m = 1.0\nfilm_height_m = 1.0\n").unwrap_err();
        assert!(matches!(err, HoloError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = HoloConfig::load_from(file.path()).unwrap();
        let session = config.session_config().unwrap();
        assert_eq!(session.laser_port.port, "/dev/ttyUSB2");
        assert_eq!(session.geometry.width(), 0.05);
    }
}
