//! Alignment Configuration using Figment
//!
//! Every tunable of the alignment procedures lives in [`AlignConfig`].
//! Configuration is layered, lowest to highest precedence:
//! 1. Built-in defaults ([`AlignConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DAQ_ALIGN_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_ALIGN_LOG_LEVEL=debug
//! DAQ_ALIGN_CENTERING__FINE_STEPS=15
//! DAQ_ALIGN_EXPOSURE__MAX_S=1.2
//! ```
//!
//! # Example
//!
//! ```toml
//! log_level = "debug"
//!
//! [centering]
//! fine_steps = 15
//!
//! [autofocus]
//! binning = 4
//! ```

use daq_core::DaqError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_ALIGN_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or merge a source
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of its allowed range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for DaqError {
    fn from(err: ConfigError) -> Self {
        DaqError::Configuration(err.to_string())
    }
}

/// Top-level alignment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    /// Centering loop settings
    pub centering: CenteringConfig,
    /// Exposure tuning settings
    pub exposure: ExposureConfig,
    /// Spot detection settings
    pub locator: LocatorConfig,
    /// Field-of-view crop settings
    pub fov: FovConfig,
    /// Autofocus escalation settings
    pub autofocus: AutofocusConfig,
    /// Task settings
    pub task: TaskConfig,
    /// E-beam centre finder settings
    pub beam_center: BeamCenterConfig,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Convergence controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CenteringConfig {
    /// Maximum corrective moves of the rough pass
    pub rough_steps: usize,
    /// Maximum corrective moves of the fine pass
    pub fine_steps: usize,
    /// Convergence margin in pixels (multiplied by the pixel size)
    pub margin_pixels: f64,
    /// Smallest meaningful actuator step, metres; lower bound of the margin
    pub min_actuator_step: f64,
    /// Fixed time per step on top of the exposure, seconds
    pub step_overhead_s: f64,
    /// Rotation of the lens-alignment axes relative to the image, degrees
    pub objective_rotation_deg: f64,
}

/// Exposure tuning settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Starting exposure, seconds
    pub initial_s: f64,
    /// Fixed exposure used with background subtraction, seconds
    pub background_s: f64,
    /// Increment while the SNR is too low, seconds
    pub increment_s: f64,
    /// Exposure above which tuning stops, seconds
    pub max_s: f64,
    /// Target signal-to-noise ratio
    pub snr_threshold: f64,
}

/// Spot locator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Minimum peak height above background, counts
    pub sensitivity: f64,
    /// More candidate regions than this is ambiguous
    pub max_spots: usize,
}

/// Field-of-view crop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FovConfig {
    /// Pixels kept around twice the spot offset
    pub margin_px: u32,
}

/// Autofocus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Search stops once the step drops below this, metres
    pub accuracy: f64,
    /// First search step, metres
    pub initial_step: f64,
    /// Maximum focus probes
    pub max_steps: usize,
    /// Camera binning used while focusing (capped by the camera)
    pub binning: u32,
    /// Best focus level must exceed the worst by this factor
    pub min_contrast: f64,
}

/// Cancellable task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Bound on how long `cancel()` waits for the worker, seconds
    pub cancel_timeout_s: f64,
}

/// E-beam centre finder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamCenterConfig {
    /// First exposure, seconds
    pub initial_exposure_s: f64,
    /// Exposure doubling stops above this, seconds
    pub max_exposure_s: f64,
    /// Locator sensitivity for the faint e-beam spot
    pub sensitivity: f64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            centering: CenteringConfig::default(),
            exposure: ExposureConfig::default(),
            locator: LocatorConfig::default(),
            fov: FovConfig::default(),
            autofocus: AutofocusConfig::default(),
            task: TaskConfig::default(),
            beam_center: BeamCenterConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for CenteringConfig {
    fn default() -> Self {
        Self {
            rough_steps: 1,
            fine_steps: 10,
            margin_pixels: 1.5,
            min_actuator_step: 1e-6,
            step_overhead_s: 2.0,
            objective_rotation_deg: -135.0,
        }
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            initial_s: 0.6,
            background_s: 1.1,
            increment_s: 0.1,
            max_s: 0.9,
            snr_threshold: 5.0,
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 100.0,
            max_spots: 10,
        }
    }
}

impl Default for FovConfig {
    fn default() -> Self {
        Self { margin_px: 250 }
    }
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            accuracy: 10e-6,
            initial_step: 40e-6,
            max_steps: 12,
            binning: 8,
            min_contrast: 1.5,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_s: 10.0,
        }
    }
}

impl Default for BeamCenterConfig {
    fn default() -> Self {
        Self {
            initial_exposure_s: 0.1,
            max_exposure_s: 2.0,
            sensitivity: 10.0,
        }
    }
}

impl CenteringConfig {
    /// Lens-alignment rotation in radians.
    pub fn objective_rotation(&self) -> f64 {
        self.objective_rotation_deg.to_radians()
    }
}

impl TaskConfig {
    /// Cancel timeout as a `Duration`.
    pub fn cancel_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.cancel_timeout_s)
            .unwrap_or(daq_core::task::DEFAULT_CANCEL_TIMEOUT)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AlignConfig {
    /// Load defaults overridden by `DAQ_ALIGN_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if an override cannot be parsed or the result
    /// fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Load defaults, then `path`, then environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Provider chain without a file: defaults then environment.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate from an arbitrary provider chain.
    pub fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let c = &self.centering;
        if c.rough_steps == 0 || c.fine_steps == 0 {
            return invalid("centering step counts must be at least 1");
        }
        if c.margin_pixels <= 0.0 || c.min_actuator_step <= 0.0 {
            return invalid("centering margins must be positive");
        }
        if c.step_overhead_s < 0.0 {
            return invalid("centering.step_overhead_s must not be negative");
        }

        let e = &self.exposure;
        if e.initial_s <= 0.0 || e.background_s <= 0.0 || e.increment_s <= 0.0 {
            return invalid("exposure times must be positive");
        }
        if e.max_s < e.initial_s {
            return Err(ConfigError::ValidationError(format!(
                "exposure.max_s ({}) is below exposure.initial_s ({})",
                e.max_s, e.initial_s
            )));
        }

        if self.locator.sensitivity <= 0.0 || self.locator.max_spots == 0 {
            return invalid("locator sensitivity and max_spots must be positive");
        }

        let af = &self.autofocus;
        if af.accuracy <= 0.0 || af.initial_step < af.accuracy {
            return invalid("autofocus.initial_step must be at least autofocus.accuracy > 0");
        }
        if af.max_steps == 0 || af.binning == 0 {
            return invalid("autofocus max_steps and binning must be at least 1");
        }
        if af.min_contrast < 1.0 {
            return invalid("autofocus.min_contrast must be at least 1");
        }

        if self.task.cancel_timeout_s <= 0.0 || !self.task.cancel_timeout_s.is_finite() {
            return invalid("task.cancel_timeout_s must be positive");
        }

        let b = &self.beam_center;
        if b.initial_exposure_s <= 0.0 || b.max_exposure_s < b.initial_exposure_s {
            return invalid("beam_center exposures must satisfy 0 < initial <= max");
        }
        if b.sensitivity <= 0.0 {
            return invalid("beam_center.sensitivity must be positive");
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(msg.to_string()))
}
