// THEORY:
// `RigConfig` gathers every tunable of the rig into one serde document. Each
// subsystem owns its own section type next to the code that reads it; this module
// only nests them, supplies the calibration section, and checks the combination
// before anything is spawned. Every field has a default, so a config file only
// needs to list what differs from the bench rig.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core_modules::coordinate_mapper::{AffineTransform, Point2, compute_transform};
use crate::core_modules::stage_controller::StageConfig;
use crate::core_modules::traversal::TraversalConfig;
use crate::error::{CalibrationError, ConfigError};
use crate::pipeline::DetectionConfig;

/// Largest accepted `tile_factor`; the bench rig uses 4.
pub const MAX_TILE_FACTOR: u32 = 64;

/// The three image/world point pairs the affine transform is solved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub image_points: Vec<Point2>,
    pub world_points: Vec<Point2>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            image_points: vec![
                Point2::new(1651.0, 1195.0),
                Point2::new(1878.0, 1094.0),
                Point2::new(2159.0, 1241.0),
            ],
            world_points: vec![
                Point2::new(56730.0, 27795.0),
                Point2::new(62000.0, 25602.0),
                Point2::new(68534.0, 28840.0),
            ],
        }
    }
}

impl CalibrationConfig {
    pub fn transform(&self) -> Result<AffineTransform, CalibrationError> {
        compute_transform(&self.image_points, &self.world_points)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub stage: StageConfig,
    pub detection: DetectionConfig,
    pub traversal: TraversalConfig,
    pub calibration: CalibrationConfig,
}

impl RigConfig {
    /// Loads and validates a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: RigConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scale = &self.stage.scale;
        if [scale.x, scale.y, scale.z]
            .iter()
            .any(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "axis scale must be positive, got {scale:?}"
            )));
        }

        let detection = &self.detection;
        if !(1..=MAX_TILE_FACTOR).contains(&detection.tile_factor) {
            return Err(ConfigError::Invalid(format!(
                "tile_factor must lie in [1, {MAX_TILE_FACTOR}], got {}",
                detection.tile_factor
            )));
        }
        if detection.input_width == 0 || detection.input_height == 0 {
            return Err(ConfigError::Invalid("model input size must be non-zero".into()));
        }
        for (name, value) in [
            ("confidence_threshold", detection.confidence_threshold),
            ("overlap_threshold", detection.overlap_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}
