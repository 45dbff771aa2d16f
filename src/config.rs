use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::loader::LoaderConfig;
use crate::optimizer::OptimizerConfig;
use crate::smoothing::SmootherConfig;
use crate::tracking::{BeaconTrackerConfig, CameraParameters};
use crate::types::ParamVec;

/// Starting point and schedule for the noise parameter search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// [positional noise, rotational noise, beacon noise, variance scale]
    pub initial_parameters: [f64; 4],
    /// Interpolation points, defaults to 2n
    pub interpolation_points: Option<usize>,
    pub rho_begin: f64,
    pub rho_end: f64,
    pub max_evaluations: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            initial_parameters: [4.14e-6, 1e-2, 0.0, 5e-2],
            interpolation_points: None,
            rho_begin: 1e-8,
            rho_end: 1e-4,
            max_evaluations: 10,
        }
    }
}

impl CalibrationConfig {
    pub fn initial(&self) -> ParamVec {
        ParamVec::from(self.initial_parameters)
    }

    pub fn optimizer(&self) -> OptimizerConfig {
        OptimizerConfig {
            interpolation_points: self.interpolation_points,
            rho_begin: self.rho_begin,
            rho_end: self.rho_end,
            max_evaluations: self.max_evaluations,
        }
    }
}

/// Weights of the per-frame pose error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Meters of position error equivalent to one radian [m/rad]
    pub rotation_weight: f64,
    /// Cost of a frame where the tracker had no pose [m²]
    pub missing_pose_penalty: f64,
    /// Returned for invalid parameters or failed builds
    pub invalid_parameter_penalty: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            rotation_weight: 0.1,
            missing_pose_penalty: 0.01,
            invalid_parameter_penalty: 1e6,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub loader: LoaderConfig,
    pub camera: CameraParameters,
    pub tracker: BeaconTrackerConfig,
    pub smoother: SmootherConfig,
    pub calibration: CalibrationConfig,
    pub cost: CostConfig,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.loader.delimiter.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "loader.delimiter must be a single ASCII character, got {:?}",
                self.loader.delimiter
            )));
        }
        if self.loader.image_size.width == 0 || self.loader.image_size.height == 0 {
            return Err(ConfigError::Invalid(
                "loader.image_size must be non-zero".to_string(),
            ));
        }
        self.camera
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for (name, value) in [
            ("cost.rotation_weight", self.cost.rotation_weight),
            ("cost.missing_pose_penalty", self.cost.missing_pose_penalty),
            (
                "cost.invalid_parameter_penalty",
                self.cost.invalid_parameter_penalty,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}
