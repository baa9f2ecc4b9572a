//! Stereo Calibration Library
//!
//! Calibrates a two-camera rig from chessboard image pairs:
//! - Chessboard corner detection with sub-pixel refinement
//! - Per-camera calibration with the radial-tangential distortion model
//! - Stereo extrinsics, essential and fundamental matrices
//! - Rectification and rectification maps
//!
//! The nonlinear solves use the tiny-solver Levenberg-Marquardt optimizer
//! with automatic differentiation.

pub mod calibration;
pub mod camera;
pub mod geometry;
pub mod optimization;
pub mod rectify;
pub mod synthetic;
pub mod util;

// Re-export commonly used types
pub use calibration::{
    stereo_calibration, CalibrationConfig, CalibrationError, CalibrationResult, ChessboardPattern,
    SampleOutcome, SampleStatus, StereoPair,
};
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use optimization::{MonoFlags, Optimizer, StereoFlags, TermCriteria};
pub use rectify::{stereo_rectify, RectificationSet, RectifyMap, Roi};
