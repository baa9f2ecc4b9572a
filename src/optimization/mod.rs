//! The `optimization` module provides the calibrators of the stereo pipeline.
//!
//! It defines the [`Optimizer`] trait, which outlines the common interface of
//! the two nonlinear problems solved during a run:
//!
//! * [`mono::MonoCalibrator`] refines the intrinsics and distortion of one
//!   camera together with one board pose per view.
//! * [`stereo::StereoCalibrator`] estimates the rigid transform between the two
//!   cameras, optionally refining both intrinsics as well.
//!
//! Both follow the same recipe: a closed-form [`Optimizer::linear_estimation`]
//! to get an initial guess, then Levenberg-Marquardt refinement with
//! `tiny_solver` over residuals written generically so they can be
//! differentiated automatically.
//!
//! Which parameters are free is described by [`MonoFlags`] and
//! [`StereoFlags`]; when the solver stops is described by [`TermCriteria`].

use std::fmt;

use nalgebra::{DVector, RealField, Vector3};
use serde::{Deserialize, Serialize};
use tiny_solver::OptimizerOptions;

use crate::calibration::CalibrationError;
use crate::geometry;

pub mod mono;
pub mod stereo;

pub use mono::{MonoCalibration, MonoCalibrator};
pub use stereo::{StereoCalibration, StereoCalibrator};

/// When to stop an iterative solver: after `max_iter` iterations or once the
/// change between iterations falls below `epsilon`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermCriteria {
    pub max_iter: usize,
    pub epsilon: f64,
}

impl TermCriteria {
    pub fn new(max_iter: usize, epsilon: f64) -> Self {
        TermCriteria { max_iter, epsilon }
    }

    /// Checks `max_iter >= 1` and a finite, non-negative `epsilon`.
    pub fn validate(&self, name: &str) -> Result<(), CalibrationError> {
        if self.max_iter == 0 {
            return Err(CalibrationError::InvalidConfig(format!(
                "{}: max_iter must be at least 1",
                name
            )));
        }
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return Err(CalibrationError::InvalidConfig(format!(
                "{}: epsilon must be finite and non-negative, got {}",
                name, self.epsilon
            )));
        }
        Ok(())
    }

    /// Levenberg-Marquardt options: the iteration cap, with `epsilon` as the
    /// relative cost-decrease threshold.
    pub(crate) fn solver_options(&self) -> OptimizerOptions {
        let threshold = self.epsilon.max(f64::EPSILON);
        OptimizerOptions {
            max_iteration: self.max_iter,
            min_rel_error_decrease_threshold: threshold,
            min_abs_error_decrease_threshold: threshold * 1e-6,
            ..Default::default()
        }
    }
}

/// Parameter flags of the per-camera calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonoFlags {
    /// Keep `p1 = p2 = 0`.
    pub zero_tangent_dist: bool,
    pub fix_principal_point: bool,
    pub fix_k1: bool,
    pub fix_k2: bool,
    pub fix_k3: bool,
}

impl Default for MonoFlags {
    fn default() -> Self {
        MonoFlags {
            zero_tangent_dist: true,
            fix_principal_point: false,
            fix_k1: false,
            fix_k2: false,
            fix_k3: false,
        }
    }
}

impl MonoFlags {
    pub fn mask(&self) -> ParamMask {
        let mut free = [true; 9];
        if self.fix_principal_point {
            free[2] = false;
            free[3] = false;
        }
        free[4] = !self.fix_k1;
        free[5] = !self.fix_k2;
        if self.zero_tangent_dist {
            free[6] = false;
            free[7] = false;
        }
        free[8] = !self.fix_k3;
        ParamMask { free }
    }
}

/// Parameter flags of the stereo solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoFlags {
    /// Hold both cameras' intrinsics and distortion at the per-camera
    /// estimates; only the poses are optimized.
    pub fix_intrinsic: bool,
    pub fix_principal_point: bool,
    pub fix_focal_length: bool,
    pub zero_tangent_dist: bool,
    pub fix_k1: bool,
    pub fix_k2: bool,
    pub fix_k3: bool,
}

impl Default for StereoFlags {
    fn default() -> Self {
        StereoFlags {
            fix_intrinsic: true,
            fix_principal_point: false,
            fix_focal_length: false,
            zero_tangent_dist: false,
            fix_k1: false,
            fix_k2: false,
            fix_k3: false,
        }
    }
}

impl StereoFlags {
    pub fn mask(&self) -> ParamMask {
        if self.fix_intrinsic {
            return ParamMask { free: [false; 9] };
        }
        let mut free = [true; 9];
        if self.fix_focal_length {
            free[0] = false;
            free[1] = false;
        }
        if self.fix_principal_point {
            free[2] = false;
            free[3] = false;
        }
        free[4] = !self.fix_k1;
        free[5] = !self.fix_k2;
        if self.zero_tangent_dist {
            free[6] = false;
            free[7] = false;
        }
        free[8] = !self.fix_k3;
        ParamMask { free }
    }
}

/// Which of `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` the solver may change.
///
/// Only the free entries become solver variables; the fixed ones stay
/// constants inside the residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamMask {
    pub free: [bool; 9],
}

impl ParamMask {
    pub fn free_count(&self) -> usize {
        self.free.iter().filter(|f| **f).count()
    }

    /// The free entries of `params`, in order.
    pub fn pack(&self, params: &[f64; 9]) -> DVector<f64> {
        DVector::from_iterator(
            self.free_count(),
            params
                .iter()
                .zip(self.free.iter())
                .filter(|(_, free)| **free)
                .map(|(p, _)| *p),
        )
    }

    /// Rebuilds the full parameter vector from the free values and the
    /// constants of `base`.
    pub fn unpack<T: RealField>(&self, base: &[f64; 9], free_values: &[T]) -> Vec<T> {
        let mut next = 0;
        base.iter()
            .zip(self.free.iter())
            .map(|(b, free)| {
                if *free {
                    next += 1;
                    free_values[next - 1].clone()
                } else {
                    nalgebra::convert::<f64, T>(*b)
                }
            })
            .collect()
    }

    pub fn unpack_f64(&self, base: &[f64; 9], free_values: &DVector<f64>) -> [f64; 9] {
        let mut out = *base;
        let mut next = 0;
        for (value, free) in out.iter_mut().zip(self.free.iter()) {
            if *free {
                *value = free_values[next];
                next += 1;
            }
        }
        out
    }
}

/// Rigid transform as an angle-axis rotation plus translation,
/// `X' = R(rvec) * X + tvec`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

impl Pose {
    pub fn to_dvector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.rvec.x,
            self.rvec.y,
            self.rvec.z,
            self.tvec.x,
            self.tvec.y,
            self.tvec.z,
        ])
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Pose {
            rvec: Vector3::new(values[0], values[1], values[2]),
            tvec: Vector3::new(values[3], values[4], values[5]),
        }
    }

    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        geometry::rodrigues(&self.rvec) * point + self.tvec
    }
}

/// Applies a 6-vector pose `[rx, ry, rz, tx, ty, tz]` to a point, on any
/// [`RealField`].
pub(crate) fn transform_generic<T: RealField>(pose: &[T], point: [T; 3]) -> [T; 3] {
    let rotated = geometry::rotate_point(
        [pose[0].clone(), pose[1].clone(), pose[2].clone()],
        point,
    );
    [
        rotated[0].clone() + pose[3].clone(),
        rotated[1].clone() + pose[4].clone(),
        rotated[2].clone() + pose[5].clone(),
    ]
}

/// Reprojection error statistics over a set of per-point pixel distances.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    /// Statistics of per-point distances; `None` for an empty set.
    pub fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let mut sorted = errors.to_vec();
        let median = geometry::median(&mut sorted)?;

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// A trait for the calibration problems of the pipeline.
///
/// Implementors own their observations and current estimate. The expected
/// call order is [`Optimizer::linear_estimation`] then
/// [`Optimizer::optimize`].
pub trait Optimizer {
    /// Computes a closed-form initial estimate.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Numerical`] if the linear system is degenerate.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>;

    /// Refines the current estimate with Levenberg-Marquardt.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, logs progress and results at `info` level.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Numerical`] if the solver fails or produces
    /// non-finite parameters.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Pixel reprojection error statistics of the current estimate.
    fn compute_reprojection_error(&self) -> Result<ProjectionError, CalibrationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mono_flags_mask() {
        let mask = MonoFlags::default().mask();
        assert_eq!(
            mask.free,
            [true, true, true, true, true, true, false, false, true]
        );
        assert_eq!(mask.free_count(), 7);
    }

    #[test]
    fn test_stereo_fix_intrinsic_has_no_free_params() {
        assert_eq!(StereoFlags::default().mask().free_count(), 0);
        let flags = StereoFlags {
            fix_intrinsic: false,
            fix_focal_length: true,
            ..Default::default()
        };
        assert_eq!(flags.mask().free_count(), 7);
    }

    #[test]
    fn test_mask_pack_unpack() {
        let mask = MonoFlags::default().mask();
        let base = [600.0, 601.0, 320.0, 240.0, -0.1, 0.01, 0.0, 0.0, 0.001];
        let packed = mask.pack(&base);
        assert_eq!(packed.len(), 7);
        let mut changed = packed.clone();
        changed[0] = 650.0;
        let full = mask.unpack_f64(&base, &changed);
        assert_eq!(full[0], 650.0);
        assert_eq!(full[6], 0.0);
        let generic: Vec<f64> = mask.unpack(&base, changed.as_slice());
        assert_eq!(generic.as_slice(), &full[..]);
    }

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert!(ProjectionError::from_errors(&[]).is_none());
    }

    #[test]
    fn test_term_criteria_validation() {
        assert!(TermCriteria::new(30, 1e-6).validate("stereo").is_ok());
        assert!(TermCriteria::new(0, 1e-6).validate("stereo").is_err());
        assert!(TermCriteria::new(30, f64::NAN).validate("stereo").is_err());
    }

    #[test]
    fn test_generic_transform_matches_pose() {
        let pose = Pose {
            rvec: Vector3::new(0.1, -0.2, 0.05),
            tvec: Vector3::new(0.3, 0.0, 1.2),
        };
        let p = Vector3::new(0.05, 0.02, 0.0);
        let expected = pose.transform(&p);
        let generic = transform_generic(pose.to_dvector().as_slice(), [p.x, p.y, p.z]);
        assert_relative_eq!(generic[0], expected.x, epsilon = 1e-12);
        assert_relative_eq!(generic[1], expected.y, epsilon = 1e-12);
        assert_relative_eq!(generic[2], expected.z, epsilon = 1e-12);
    }
}
