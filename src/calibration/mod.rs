//! Stereo calibration pipeline.
//!
//! [`stereo_calibration`] runs the whole batch: it loads the image pairs,
//! detects the chessboard in both views, calibrates each camera, solves the
//! stereo extrinsics, computes the rectification and writes the parameter
//! archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use log::{debug, info, log_enabled, warn, Level};
use nalgebra::{Matrix3, Point2, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::{CameraModelError, RadTanModel, Resolution};
use crate::optimization::{MonoCalibrator, StereoCalibrator};
use crate::rectify::{self, RectificationSet};
use crate::util;

pub mod config;
pub mod detector;
pub mod loader;
pub mod pattern;

pub use config::{CalibrationConfig, CalibrationConfigBuilder};
pub use detector::{ChessboardDetector, DetectionFlags, SubPixConfig};
pub use loader::{ImagePairPaths, LoadedPair};
pub use pattern::ChessboardPattern;

/// RMS reprojection error (pixels) below which a calibration is considered
/// good.
pub const RMS_GOOD: f64 = 0.5;
/// RMS reprojection error (pixels) above which a calibration is suspect.
pub const RMS_SUSPECT: f64 = 1.0;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Input directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("Left and right image counts differ: {left} left, {right} right")]
    PairCountMismatch { left: usize, right: usize },
    #[error("Image pair {index} does not match: {left} vs {right}")]
    PairNameMismatch {
        index: usize,
        left: String,
        right: String,
    },
    #[error("Image {} is {}, expected {}", .file.display(), format_size(.found), format_size(.expected))]
    ImageSizeMismatch {
        file: PathBuf,
        found: Resolution,
        expected: Resolution,
    },
    #[error("Not enough usable samples: found {found}, need at least {required}")]
    InsufficientSamples { found: usize, required: usize },
    #[error("Numerical error in computation: {0}")]
    Numerical(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("NumPy archive error: {0}")]
    Npz(#[from] ndarray_npy::WriteNpzError),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
}

fn format_size(size: &Resolution) -> String {
    format!("{}x{}", size.width, size.height)
}

/// A value per camera of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StereoPair<T> {
    pub left: T,
    pub right: T,
}

impl<T> StereoPair<T> {
    pub fn new(left: T, right: T) -> Self {
        StereoPair { left, right }
    }

    pub fn as_ref(&self) -> StereoPair<&T> {
        StereoPair {
            left: &self.left,
            right: &self.right,
        }
    }

    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> StereoPair<U> {
        StereoPair {
            left: f(self.left),
            right: f(self.right),
        }
    }
}

/// What happened to one input pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// Both views detected the board; `index` is the position among the
    /// retained samples.
    Accepted { index: usize },
    RejectedLeft,
    RejectedRight,
    RejectedBoth,
}

impl SampleStatus {
    pub fn from_detection(left_found: bool, right_found: bool, index: usize) -> Self {
        match (left_found, right_found) {
            (true, true) => SampleStatus::Accepted { index },
            (false, true) => SampleStatus::RejectedLeft,
            (true, false) => SampleStatus::RejectedRight,
            (false, false) => SampleStatus::RejectedBoth,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SampleStatus::Accepted { .. } => "accepted",
            SampleStatus::RejectedLeft => "rejected_left",
            SampleStatus::RejectedRight => "rejected_right",
            SampleStatus::RejectedBoth => "rejected_both",
        }
    }

    pub fn sample_index(&self) -> Option<usize> {
        match self {
            SampleStatus::Accepted { index } => Some(*index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleOutcome {
    pub files: StereoPair<String>,
    pub status: SampleStatus,
}

/// Corner observations of the retained samples, index aligned.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    pub left: Vec<Vec<Point2<f64>>>,
    pub right: Vec<Vec<Point2<f64>>>,
}

impl SampleSet {
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub cameras: StereoPair<RadTanModel>,
    /// Left-to-right rotation, `X_r = R * X_l + T`.
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    pub rectification: RectificationSet,
    /// Stereo RMS reprojection error over both cameras, in pixels.
    pub rms_error: f64,
    /// Per-camera RMS after the individual calibrations.
    pub mono_rms: StereoPair<f64>,
    pub image_size: Resolution,
    pub outcomes: Vec<SampleOutcome>,
    /// Location of the written parameter archive.
    pub archive: PathBuf,
}

impl CalibrationResult {
    pub fn sample_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.sample_index().is_some())
            .count()
    }
}

/// Detects the board in `pair` and, when `render_dir` is set, writes the
/// annotated frames of accepted pairs as `left_img<i>.png` and
/// `right_img<i>.png`.
fn detect_pair(
    detector: &ChessboardDetector,
    pair: &LoadedPair,
    next_index: usize,
    config: &CalibrationConfig,
) -> Result<(SampleStatus, Option<StereoPair<Vec<Point2<f64>>>>), CalibrationError> {
    let left = detector.detect(&pair.gray.left);
    let right = detector.detect(&pair.gray.right);
    let status = SampleStatus::from_detection(left.is_some(), right.is_some(), next_index);

    let (left, right) = match (left, right) {
        (Some(left), Some(right)) => (left, right),
        _ => {
            debug!(
                "pair {} / {}: {}",
                pair.names.left,
                pair.names.right,
                status.label()
            );
            return Ok((status, None));
        }
    };
    debug!(
        "pair {} / {}: accepted as sample {}",
        pair.names.left, pair.names.right, next_index
    );

    if let Some(render_dir) = &config.render_dir {
        let pattern = detector.pattern();
        let sides = [
            (&config.subdirs.left, "left", &pair.rgb.left, &left),
            (&config.subdirs.right, "right", &pair.rgb.right, &right),
        ];
        for (subdir, prefix, frame, corners) in sides {
            let dir = util::ensure_dir(&render_dir.join(subdir))?;
            let mut canvas: RgbImage = frame.clone();
            detector::draw_chessboard_corners(&mut canvas, pattern, corners);
            canvas.save(dir.join(format!("{}_img{}.png", prefix, next_index)))?;
        }
    }
    Ok((status, Some(StereoPair::new(left, right))))
}

/// Loads every image pair under `input` and collects the samples in which
/// both views show the full board.
pub fn collect_samples(
    input: &Path,
    config: &CalibrationConfig,
) -> Result<(SampleSet, Vec<SampleOutcome>, Option<Resolution>), CalibrationError> {
    let pairs = loader::list_image_pairs(
        input,
        &config.subdirs,
        config.image_limit,
        config.require_matching_names,
    )?;
    info!("Found {} image pairs under {}", pairs.len(), input.display());

    let detector = ChessboardDetector::new(config.pattern, config.detection, config.subpix);
    let mut samples = SampleSet::default();
    let mut outcomes = Vec::with_capacity(pairs.len());
    let mut image_size: Option<Resolution> = None;

    for paths in &pairs {
        let pair = loader::load_pair(paths, image_size)?;
        image_size = Some(pair.size);

        let (status, corners) = detect_pair(&detector, &pair, samples.len(), config)?;
        if let Some(corners) = corners {
            samples.left.push(corners.left);
            samples.right.push(corners.right);
        }
        outcomes.push(SampleOutcome {
            files: pair.names,
            status,
        });
    }
    info!(
        "Chessboard found in both views of {} of {} pairs",
        samples.len(),
        pairs.len()
    );
    Ok((samples, outcomes, image_size))
}

/// Calibrates the stereo rig from the image pairs under `input`.
///
/// # Arguments
///
/// * `input` - Directory holding the left and right image subdirectories.
/// * `config` - Run configuration.
///
/// # Errors
///
/// * Input errors from the loader ([`CalibrationError::MissingDirectory`],
///   [`CalibrationError::PairCountMismatch`], ...).
/// * [`CalibrationError::InsufficientSamples`] when fewer than
///   `config.min_samples` pairs show the board in both views. No solver runs
///   in that case.
/// * [`CalibrationError::Numerical`] when a solve degenerates.
pub fn stereo_calibration(
    input: &Path,
    config: &CalibrationConfig,
) -> Result<CalibrationResult, CalibrationError> {
    config.validate()?;
    let (samples, outcomes, image_size) = collect_samples(input, config)?;

    let image_size = match image_size {
        Some(size) if samples.len() >= config.min_samples => size,
        _ => {
            return Err(CalibrationError::InsufficientSamples {
                found: samples.len(),
                required: config.min_samples,
            })
        }
    };

    let object_points: Arc<Vec<Vector3<f64>>> = config.pattern.shared_object_points();
    let verbose = log_enabled!(Level::Debug);

    let left = MonoCalibrator::new(
        object_points.clone(),
        samples.left.clone(),
        image_size,
        config.mono_flags,
        config.mono_criteria,
    )?
    .calibrate(verbose)?;
    info!("Left camera RMS error: {:.4} px", left.rms);
    let right = MonoCalibrator::new(
        object_points.clone(),
        samples.right.clone(),
        image_size,
        config.mono_flags,
        config.mono_criteria,
    )?
    .calibrate(verbose)?;
    info!("Right camera RMS error: {:.4} px", right.rms);
    let mono_rms = StereoPair::new(left.rms, right.rms);

    let stereo = StereoCalibrator::new(
        object_points,
        samples.left,
        samples.right,
        left,
        right,
        config.stereo_flags,
        config.stereo_criteria,
    )?
    .calibrate(verbose)?;

    if stereo.rms < RMS_GOOD {
        info!("Stereo RMS error: {:.4} px (good)", stereo.rms);
    } else if stereo.rms > RMS_SUSPECT {
        warn!(
            "Stereo RMS error: {:.4} px is above {} px, check the input images",
            stereo.rms, RMS_SUSPECT
        );
    } else {
        info!("Stereo RMS error: {:.4} px", stereo.rms);
    }
    debug!("R = {}", stereo.rotation);
    debug!("T = {}", stereo.translation);

    let rectification = rectify::stereo_rectify(
        &stereo.left,
        &stereo.right,
        &stereo.rotation,
        &stereo.translation,
        config.rectify_alpha,
    )?;

    let mut result = CalibrationResult {
        cameras: StereoPair::new(stereo.left, stereo.right),
        rotation: stereo.rotation,
        translation: stereo.translation,
        essential: stereo.essential,
        fundamental: stereo.fundamental,
        rectification,
        rms_error: stereo.rms,
        mono_rms,
        image_size,
        outcomes,
        archive: PathBuf::new(),
    };
    result.archive = util::save_npz(&config.param_save_path, &result)?;
    info!("Saved stereo parameters to {}", result.archive.display());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_status_from_detection() {
        assert_eq!(
            SampleStatus::from_detection(true, true, 4),
            SampleStatus::Accepted { index: 4 }
        );
        assert_eq!(SampleStatus::from_detection(false, true, 0), SampleStatus::RejectedLeft);
        assert_eq!(SampleStatus::from_detection(true, false, 0), SampleStatus::RejectedRight);
        assert_eq!(SampleStatus::from_detection(false, false, 0), SampleStatus::RejectedBoth);
        assert_eq!(SampleStatus::RejectedBoth.sample_index(), None);
    }

    #[test]
    fn test_stereo_pair_map() {
        let pair = StereoPair::new(2, 3).map(|v| v * 10);
        assert_eq!(pair, StereoPair::new(20, 30));
        let names = StereoPair::new("a".to_string(), "bb".to_string());
        assert_eq!(names.as_ref().map(|s| s.len()), StereoPair::new(1, 2));
    }

    #[test]
    fn test_error_messages() {
        let err = CalibrationError::InsufficientSamples { found: 1, required: 3 };
        assert_eq!(
            err.to_string(),
            "Not enough usable samples: found 1, need at least 3"
        );
        let err = CalibrationError::ImageSizeMismatch {
            file: PathBuf::from("a.png"),
            found: Resolution { width: 10, height: 5 },
            expected: Resolution { width: 640, height: 480 },
        };
        assert_eq!(err.to_string(), "Image a.png is 10x5, expected 640x480");
    }
}
