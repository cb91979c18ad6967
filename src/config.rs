//! Configuration System using Figment
//!
//! Strongly-typed configuration for the tuning core. Configuration is loaded from:
//! 1. `config/laser_tuning.toml` (base configuration)
//! 2. Environment variables (prefixed with `LASER_TUNING_`, `__` between levels)
//!
//! Every section has defaults, so an empty file yields a working configuration.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LASER_TUNING_LOGGING__LEVEL=debug
//! LASER_TUNING_COARSE__HYSTERESIS_COUNTS=8000
//! LASER_TUNING_LOCK__TIMEOUT=45s
//! ```
//!
//! # Example file
//!
//! ```toml
//! [coarse]
//! hysteresis_counts = 10000
//! poll_interval = "250ms"
//! wavelength_bounds = [756.5, 781.1]
//!
//! [lock]
//! tolerance_ghz = 0.003
//! stable_after = 10
//! volts_per_ghz = 1.5
//! damping = 0.5
//!
//! [tune]
//! tolerance_ghz = 0.01
//! stable_after = 3
//! timeout = "30s"
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/laser_tuning.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LASER_TUNING_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values loaded but inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Grating motor positioning
    pub coarse: CoarseConfig,
    /// Piezo PI lock loop
    pub lock: LockConfig,
    /// Coarse-then-fine tuning requests
    pub tune: TuneConfig,
    /// Tracing output
    pub logging: LoggingConfig,
}

/// Coarse (motor) actuator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoarseConfig {
    /// Backlash compensation overshoot in encoder counts
    pub hysteresis_counts: i32,
    /// Interval between movement-complete polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Give up on a single relative move after this long
    #[serde(with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Optional `[min, max]` nm window overriding the range stored on the motor
    pub wavelength_bounds: Option<[f64; 2]>,
}

/// Fine (piezo) lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock tolerance in GHz for a cold lock
    pub tolerance_ghz: f64,
    /// Consecutive in-tolerance samples required (strictly exceeded) before locked
    pub stable_after: u32,
    /// Proportional gain (dimensionless, scaled by the transducer constant)
    pub p: f64,
    /// Integral weight
    pub i: f64,
    /// Integration window in samples
    pub tau: usize,
    /// Loop period
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Give-up timeout while searching
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Piezo sensitivity magnitude in volts per GHz of detuning
    pub volts_per_ghz: f64,
    /// Empirical damping applied on top of the sensitivity
    pub damping: f64,
    /// Largest voltage step applied in one iteration
    pub max_step_volts: f64,
    /// Steps smaller than this are skipped
    pub min_step_volts: f64,
    /// Number of divide-by-ten attempts before giving up on an iteration
    pub scale_attempts: u32,
}

/// Tuning request configuration (fine lock after a coarse move)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    /// Tolerance in GHz once the motor has narrowed the error
    pub tolerance_ghz: f64,
    /// Stable samples required after a coarse move
    pub stable_after: u32,
    /// How long `tune_to` waits for lock by default
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            hysteresis_counts: 10_000,
            poll_interval: Duration::from_millis(250),
            move_timeout: Duration::from_secs(120),
            wavelength_bounds: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            tolerance_ghz: 3e-3,
            stable_after: 10,
            p: 1.0,
            i: 1.0,
            tau: 10,
            period: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            // ~1.5 GHz per volt from the laser head datasheet, damped by half
            volts_per_ghz: 1.5,
            damping: 0.5,
            max_step_volts: 0.1,
            min_step_volts: 0.001,
            scale_attempts: 6,
        }
    }
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            tolerance_ghz: 0.010,
            stable_after: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LockConfig {
    /// Volts of correction per GHz of detuning at unit proportional gain.
    pub fn gain_scale(&self) -> f64 {
        self.volts_per_ghz * self.damping
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl TuningConfig {
    /// Load configuration from the default file and environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Precedence (highest to lowest): environment, file, built-in defaults.
    /// A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(TuningConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Render this configuration as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Tolerances and gains are finite and positive
    /// - Integration window and loop period are non-zero
    /// - The optional wavelength window is ordered
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.coarse.hysteresis_counts < 0 {
            return Err(ConfigError::ValidationError(format!(
                "coarse.hysteresis_counts must be non-negative, got {}",
                self.coarse.hysteresis_counts
            )));
        }
        if self.coarse.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "coarse.poll_interval must be non-zero".to_string(),
            ));
        }
        if let Some([min, max]) = self.coarse.wavelength_bounds {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(ConfigError::ValidationError(format!(
                    "coarse.wavelength_bounds must be an increasing pair, got [{min}, {max}]"
                )));
            }
        }

        let lock = &self.lock;
        for (name, value) in [
            ("lock.tolerance_ghz", lock.tolerance_ghz),
            ("lock.volts_per_ghz", lock.volts_per_ghz),
            ("lock.damping", lock.damping),
            ("lock.max_step_volts", lock.max_step_volts),
            ("tune.tolerance_ghz", self.tune.tolerance_ghz),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(lock.min_step_volts >= 0.0 && lock.min_step_volts < lock.max_step_volts) {
            return Err(ConfigError::ValidationError(format!(
                "lock.min_step_volts ({}) must be in [0, max_step_volts)",
                lock.min_step_volts
            )));
        }
        if lock.tau == 0 {
            return Err(ConfigError::ValidationError(
                "lock.tau must be at least 1".to_string(),
            ));
        }
        if lock.period.is_zero() {
            return Err(ConfigError::ValidationError(
                "lock.period must be non-zero".to_string(),
            ));
        }
        if lock.scale_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "lock.scale_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TuningConfig::default();
        config.validate().unwrap();
        assert_eq!(config.coarse.hysteresis_counts, 10_000);
        assert_eq!(config.coarse.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lock.timeout, Duration::from_secs(30));
        assert!((config.lock.gain_scale() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = TuningConfig::default();
        config.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_reversed_bounds_rejected() {
        let mut config = TuningConfig::default();
        config.coarse.wavelength_bounds = Some([781.1, 756.5]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_tau_rejected() {
        let mut config = TuningConfig::default();
        config.lock.tau = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rendering_mentions_sections() {
        let rendered = TuningConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[coarse]"));
        assert!(rendered.contains("poll_interval = \"250ms\""));
    }
}
