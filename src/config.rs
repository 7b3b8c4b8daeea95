use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Default lowest accepted target age.
pub const DEFAULT_MIN_AGE: u32 = 0;
/// Default highest accepted target age.
pub const DEFAULT_MAX_AGE: u32 = 100;
/// Default JPEG quality of the returned image.
pub const DEFAULT_JPEG_QUALITY: u8 = 75;
/// Default smallest face (aligned quad side, in pixels) the aligner accepts.
pub const DEFAULT_MIN_FACE_SIZE: f32 = 32.0;
/// Default luma standard deviation below which an image is treated as faceless.
pub const DEFAULT_UNIFORM_STD_THRESHOLD: f32 = 2.0;
/// Default face confidence below which the landmark detector's result is discarded.
pub const DEFAULT_MIN_FACE_SCORE: f32 = 0.5;

/// Runtime settings of the age transformation engine.
///
/// Model geometry (input size, conditioning protocol) is not configured here: it comes
/// from the checkpoint options embedded in the model file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lowest accepted target age, inclusive.
    pub min_age: u32,
    /// Highest accepted target age, inclusive.
    pub max_age: u32,
    /// JPEG quality (1-100) of the response image.
    pub jpeg_quality: u8,
    /// Smallest aligned face, in source pixels, before alignment is considered degenerate.
    pub min_face_size: f32,
    /// Images whose luma standard deviation is below this are rejected by the aligner.
    pub uniform_std_threshold: f32,
    /// Lowest face confidence (0-1) reported by the detector that still counts as a face.
    pub min_face_score: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_age: DEFAULT_MIN_AGE,
            max_age: DEFAULT_MAX_AGE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            uniform_std_threshold: DEFAULT_UNIFORM_STD_THRESHOLD,
            min_face_score: DEFAULT_MIN_FACE_SCORE,
        }
    }
}

impl EngineConfig {
    /// Reads a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configured values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_age > self.max_age {
            return Err(ConfigError::Invalid {
                name: "min_age",
                reason: format!("{} is greater than max_age {}", self.min_age, self.max_age),
            });
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid {
                name: "jpeg_quality",
                reason: format!("{} is not in 1..=100", self.jpeg_quality),
            });
        }
        if !self.min_face_size.is_finite() || self.min_face_size < 1.0 {
            return Err(ConfigError::Invalid {
                name: "min_face_size",
                reason: format!("{} must be a finite value of at least 1", self.min_face_size),
            });
        }
        if !self.uniform_std_threshold.is_finite() || self.uniform_std_threshold < 0.0 {
            return Err(ConfigError::Invalid {
                name: "uniform_std_threshold",
                reason: format!("{} must be finite and non-negative", self.uniform_std_threshold),
            });
        }
        if !(0.0..=1.0).contains(&self.min_face_score) {
            return Err(ConfigError::Invalid {
                name: "min_face_score",
                reason: format!("{} is not in 0..=1", self.min_face_score),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "max_age": 90 }"#).unwrap();
        assert_eq!(config.max_age, 90);
        assert_eq!(config.min_age, DEFAULT_MIN_AGE);
        assert_eq!(config.jpeg_quality, DEFAULT_JPEG_QUALITY);
    }

    #[test]
    fn test_rejects_inverted_age_range() {
        let config = EngineConfig {
            min_age: 50,
            max_age: 10,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "min_age", .. })
        ));
    }

    #[test]
    fn test_rejects_zero_quality() {
        let config = EngineConfig {
            jpeg_quality: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_face_score_outside_unit_range() {
        for min_face_score in [-0.1, 1.5, f32::NAN] {
            let config = EngineConfig {
                min_face_score,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Invalid { name: "min_face_score", .. })
            ));
        }
    }
}
