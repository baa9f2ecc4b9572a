//! Run configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::detector::{DetectionFlags, SubPixConfig};
use super::pattern::ChessboardPattern;
use super::{CalibrationError, StereoPair};
use crate::optimization::mono::MIN_VIEWS;
use crate::optimization::{MonoFlags, StereoFlags, TermCriteria};

pub const DEFAULT_IMAGE_LIMIT: usize = 10;

fn default_mono_criteria() -> TermCriteria {
    TermCriteria::new(30, f64::EPSILON)
}

fn default_stereo_criteria() -> TermCriteria {
    TermCriteria::new(30, 1e-6)
}

fn default_image_limit() -> usize {
    DEFAULT_IMAGE_LIMIT
}

fn default_min_samples() -> usize {
    MIN_VIEWS
}

fn default_param_save_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_subdirs() -> StereoPair<String> {
    StereoPair::new("stereo_left".to_string(), "stereo_right".to_string())
}

fn default_true() -> bool {
    true
}

/// Settings of one calibration run.
///
/// Built with [`CalibrationConfig::builder`] or read from YAML with
/// [`CalibrationConfig::from_yaml_file`]; both validate the values. Only
/// `pattern` is required in YAML:
///
/// ```yaml
/// pattern: { rows: 4, cols: 8, square_size: 0.03 }
/// image_limit: 20
/// rectify_alpha: 0.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub pattern: ChessboardPattern,
    #[serde(default)]
    pub detection: DetectionFlags,
    #[serde(default)]
    pub subpix: SubPixConfig,
    #[serde(default)]
    pub mono_flags: MonoFlags,
    #[serde(default = "default_mono_criteria")]
    pub mono_criteria: TermCriteria,
    #[serde(default)]
    pub stereo_flags: StereoFlags,
    #[serde(default = "default_stereo_criteria")]
    pub stereo_criteria: TermCriteria,
    /// Free scaling of the rectified views, `None` for the natural scale.
    #[serde(default)]
    pub rectify_alpha: Option<f64>,
    /// Pairs used at most, the first ones by file name.
    #[serde(default = "default_image_limit")]
    pub image_limit: usize,
    /// Usable pairs required before any solver runs.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Directory receiving `stereo_calib.npz`.
    #[serde(default = "default_param_save_path")]
    pub param_save_path: PathBuf,
    /// Directory for the annotated detection images, `None` to skip them.
    #[serde(default)]
    pub render_dir: Option<PathBuf>,
    #[serde(default = "default_subdirs")]
    pub subdirs: StereoPair<String>,
    #[serde(default = "default_true")]
    pub require_matching_names: bool,
}

impl CalibrationConfig {
    pub fn builder(pattern: ChessboardPattern) -> CalibrationConfigBuilder {
        CalibrationConfigBuilder {
            config: CalibrationConfig {
                pattern,
                detection: DetectionFlags::default(),
                subpix: SubPixConfig::default(),
                mono_flags: MonoFlags::default(),
                mono_criteria: default_mono_criteria(),
                stereo_flags: StereoFlags::default(),
                stereo_criteria: default_stereo_criteria(),
                rectify_alpha: None,
                image_limit: DEFAULT_IMAGE_LIMIT,
                min_samples: MIN_VIEWS,
                param_save_path: default_param_save_path(),
                render_dir: None,
                subdirs: default_subdirs(),
                require_matching_names: true,
            },
        }
    }

    /// Loads and validates a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, CalibrationError> {
        let config: CalibrationConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String, CalibrationError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.pattern.validate()?;
        self.mono_criteria.validate("mono_criteria")?;
        self.stereo_criteria.validate("stereo_criteria")?;
        self.subpix.criteria.validate("subpix.criteria")?;
        if self.subpix.window.0 == 0 || self.subpix.window.1 == 0 {
            return Err(CalibrationError::InvalidConfig(
                "subpix window half size must be at least 1".to_string(),
            ));
        }
        let (zx, zy) = self.subpix.zero_zone;
        if zx >= self.subpix.window.0 as i32 || zy >= self.subpix.window.1 as i32 {
            return Err(CalibrationError::InvalidConfig(
                "subpix zero zone must be smaller than the window".to_string(),
            ));
        }
        if let Some(alpha) = self.rectify_alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(CalibrationError::InvalidConfig(format!(
                    "rectify_alpha must be within [0, 1], got {}",
                    alpha
                )));
            }
        }
        if self.image_limit == 0 {
            return Err(CalibrationError::InvalidConfig(
                "image_limit must be at least 1".to_string(),
            ));
        }
        if self.min_samples < MIN_VIEWS {
            return Err(CalibrationError::InvalidConfig(format!(
                "min_samples must be at least {}, got {}",
                MIN_VIEWS, self.min_samples
            )));
        }
        if self.subdirs.left.is_empty()
            || self.subdirs.right.is_empty()
            || self.subdirs.left == self.subdirs.right
        {
            return Err(CalibrationError::InvalidConfig(
                "left and right subdirectories must be distinct and non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`CalibrationConfig`].
#[derive(Debug, Clone)]
pub struct CalibrationConfigBuilder {
    config: CalibrationConfig,
}

impl CalibrationConfigBuilder {
    pub fn detection(mut self, detection: DetectionFlags) -> Self {
        self.config.detection = detection;
        self
    }

    pub fn subpix(mut self, subpix: SubPixConfig) -> Self {
        self.config.subpix = subpix;
        self
    }

    pub fn mono_flags(mut self, flags: MonoFlags) -> Self {
        self.config.mono_flags = flags;
        self
    }

    pub fn mono_criteria(mut self, criteria: TermCriteria) -> Self {
        self.config.mono_criteria = criteria;
        self
    }

    pub fn stereo_flags(mut self, flags: StereoFlags) -> Self {
        self.config.stereo_flags = flags;
        self
    }

    pub fn stereo_criteria(mut self, criteria: TermCriteria) -> Self {
        self.config.stereo_criteria = criteria;
        self
    }

    pub fn rectify_alpha(mut self, alpha: Option<f64>) -> Self {
        self.config.rectify_alpha = alpha;
        self
    }

    pub fn image_limit(mut self, limit: usize) -> Self {
        self.config.image_limit = limit;
        self
    }

    pub fn min_samples(mut self, min_samples: usize) -> Self {
        self.config.min_samples = min_samples;
        self
    }

    pub fn param_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.param_save_path = path.into();
        self
    }

    pub fn render_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.render_dir = dir;
        self
    }

    pub fn subdirs(mut self, subdirs: StereoPair<String>) -> Self {
        self.config.subdirs = subdirs;
        self
    }

    pub fn require_matching_names(mut self, require: bool) -> Self {
        self.config.require_matching_names = require;
        self
    }

    pub fn build(self) -> Result<CalibrationConfig, CalibrationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> ChessboardPattern {
        ChessboardPattern::new(4, 8, 0.03).unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let config = CalibrationConfig::builder(pattern()).build().unwrap();
        assert_eq!(config.image_limit, 10);
        assert_eq!(config.min_samples, 3);
        assert_eq!(config.subpix.window, (11, 11));
        assert_eq!(config.subpix.zero_zone, (-1, -1));
        assert_eq!(config.mono_criteria.max_iter, 30);
        assert_eq!(config.stereo_criteria.epsilon, 1e-6);
        assert!(config.mono_flags.zero_tangent_dist);
        assert!(config.stereo_flags.fix_intrinsic);
        assert_eq!(config.subdirs.left, "stereo_left");
        assert_eq!(config.param_save_path, PathBuf::from("."));
        assert!(config.require_matching_names);
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert!(CalibrationConfig::builder(pattern()).image_limit(0).build().is_err());
        assert!(CalibrationConfig::builder(pattern()).min_samples(2).build().is_err());
        assert!(CalibrationConfig::builder(pattern())
            .rectify_alpha(Some(1.5))
            .build()
            .is_err());
        assert!(CalibrationConfig::builder(pattern())
            .mono_criteria(TermCriteria::new(0, 0.1))
            .build()
            .is_err());
        assert!(CalibrationConfig::builder(pattern())
            .subdirs(StereoPair::new("same".to_string(), "same".to_string()))
            .build()
            .is_err());
        assert!(CalibrationConfig::builder(pattern())
            .rectify_alpha(Some(0.0))
            .build()
            .is_ok());
    }

    #[test]
    fn test_yaml_with_defaults() {
        let config = CalibrationConfig::from_yaml_str(
            "pattern: { rows: 4, cols: 8, square_size: 0.03 }\nimage_limit: 20\nrectify_alpha: 0.5\n",
        )
        .unwrap();
        assert_eq!(config.image_limit, 20);
        assert_eq!(config.rectify_alpha, Some(0.5));
        assert_eq!(config.mono_criteria, default_mono_criteria());
        assert!(config.detection.adaptive_threshold);

        let again = CalibrationConfig::from_yaml_str(&config.to_yaml_string().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_yaml_is_validated() {
        let err = CalibrationConfig::from_yaml_str(
            "pattern: { rows: 1, cols: 8, square_size: 0.03 }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidConfig(_)));
        let err = CalibrationConfig::from_yaml_str("image_limit: 3\n").unwrap_err();
        assert!(matches!(err, CalibrationError::Yaml(_)));
    }
}
