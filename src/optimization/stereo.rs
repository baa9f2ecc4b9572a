//! Joint estimation of the left-to-right camera transform.
//!
//! Unknowns are one board pose per view (in the left camera), the relative
//! pose `(R, T)` with `X_r = R * X_l + T`, and, unless
//! [`StereoFlags::fix_intrinsic`] is set, the free parameters of both cameras.
//! Every view contributes the corner residuals of both images.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use nalgebra::{DVector, Matrix3, Point2, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use super::mono::{reprojection_errors, MonoCalibration, MIN_VIEWS};
use super::{transform_generic, Optimizer, ParamMask, Pose, ProjectionError, StereoFlags, TermCriteria};
use crate::calibration::CalibrationError;
use crate::camera::rad_tan::{project_generic, RadTanModel};
use crate::geometry;

/// Residuals of one view in both cameras: `[left u, v ...; right u, v ...]`.
///
/// Parameter blocks are `[pose, relative]`, followed by
/// `[camera_left, camera_right]` when the intrinsics are free.
#[derive(Debug, Clone)]
struct StereoReprojectionFactor {
    object_points: Arc<Vec<Vector3<f64>>>,
    left: Vec<Vector2<f64>>,
    right: Vec<Vector2<f64>>,
    base_left: [f64; 9],
    base_right: [f64; 9],
    mask: ParamMask,
}

impl<T: RealField> Factor<T> for StereoReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = params[0].as_slice();
        let relative = params[1].as_slice();
        let (camera_left, camera_right) = if self.mask.free_count() > 0 {
            (
                self.mask.unpack(&self.base_left, params[2].as_slice()),
                self.mask.unpack(&self.base_right, params[3].as_slice()),
            )
        } else {
            (
                self.base_left.iter().map(|v| nalgebra::convert(*v)).collect(),
                self.base_right.iter().map(|v| nalgebra::convert(*v)).collect(),
            )
        };

        let n = self.object_points.len();
        let mut residuals = DVector::zeros(n * 4);
        for (i, object) in self.object_points.iter().enumerate() {
            let in_left = transform_generic(
                pose,
                [
                    nalgebra::convert(object.x),
                    nalgebra::convert(object.y),
                    nalgebra::convert(object.z),
                ],
            );
            let in_right = transform_generic(relative, in_left.clone());

            let [ul, vl] = project_generic(&camera_left, &in_left);
            let [ur, vr] = project_generic(&camera_right, &in_right);
            residuals[i * 2] = ul - nalgebra::convert::<f64, T>(self.left[i].x);
            residuals[i * 2 + 1] = vl - nalgebra::convert::<f64, T>(self.left[i].y);
            residuals[2 * n + i * 2] = ur - nalgebra::convert::<f64, T>(self.right[i].x);
            residuals[2 * n + i * 2 + 1] = vr - nalgebra::convert::<f64, T>(self.right[i].y);
        }
        residuals
    }
}

/// Result of the stereo solve.
#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub left: RadTanModel,
    pub right: RadTanModel,
    /// Rotation from the left to the right camera frame.
    pub rotation: Matrix3<f64>,
    /// Translation from the left to the right camera frame.
    pub translation: Vector3<f64>,
    /// `[T]x * R`.
    pub essential: Matrix3<f64>,
    /// `K_r^-T * E * K_l^-1`, scaled so that `F[(2, 2)] == 1`.
    pub fundamental: Matrix3<f64>,
    /// `sqrt(sum |e|^2 / (2 * N))` over both cameras, in pixels.
    pub rms: f64,
}

/// The stereo problem over the per-camera calibrations of a run.
#[derive(Debug, Clone)]
pub struct StereoCalibrator {
    object_points: Arc<Vec<Vector3<f64>>>,
    left_observations: Vec<Vec<Point2<f64>>>,
    right_observations: Vec<Vec<Point2<f64>>>,
    left: RadTanModel,
    right: RadTanModel,
    left_poses: Vec<Pose>,
    right_poses: Vec<Pose>,
    relative: Option<Pose>,
    flags: StereoFlags,
    criteria: TermCriteria,
}

impl StereoCalibrator {
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientSamples`] for fewer than three views.
    /// * [`CalibrationError::InvalidConfig`] if the two sides disagree in view
    ///   count or in corners per view, or if the per-camera calibrations were
    ///   computed on a different number of views.
    pub fn new(
        object_points: Arc<Vec<Vector3<f64>>>,
        left_observations: Vec<Vec<Point2<f64>>>,
        right_observations: Vec<Vec<Point2<f64>>>,
        left: MonoCalibration,
        right: MonoCalibration,
        flags: StereoFlags,
        criteria: TermCriteria,
    ) -> Result<Self, CalibrationError> {
        let views = left_observations.len();
        if views < MIN_VIEWS {
            return Err(CalibrationError::InsufficientSamples {
                found: views,
                required: MIN_VIEWS,
            });
        }
        if right_observations.len() != views || left.poses.len() != views || right.poses.len() != views {
            return Err(CalibrationError::InvalidConfig(
                "left and right observations must cover the same views".to_string(),
            ));
        }
        let n = object_points.len();
        if left_observations
            .iter()
            .chain(right_observations.iter())
            .any(|view| view.len() != n)
        {
            return Err(CalibrationError::InvalidConfig(format!(
                "every view must observe all {} corners",
                n
            )));
        }

        Ok(StereoCalibrator {
            object_points,
            left_observations,
            right_observations,
            left: left.camera,
            right: right.camera,
            left_poses: left.poses,
            right_poses: right.poses,
            relative: None,
            flags,
            criteria,
        })
    }

    /// Runs [`Optimizer::linear_estimation`] and [`Optimizer::optimize`].
    pub fn calibrate(mut self, verbose: bool) -> Result<StereoCalibration, CalibrationError> {
        self.linear_estimation()?;
        self.optimize(verbose)?;

        let relative = self.current_relative()?;
        let rotation = geometry::rodrigues(&relative.rvec);
        let translation = relative.tvec;
        let essential = geometry::skew(&translation) * rotation;
        let fundamental = fundamental_matrix(&self.left, &self.right, &essential)?;
        let rms = self.compute_reprojection_error()?.rmse;

        Ok(StereoCalibration {
            left: self.left,
            right: self.right,
            rotation,
            translation,
            essential,
            fundamental,
            rms,
        })
    }

    /// The current relative pose estimate.
    pub fn relative_pose(&self) -> Option<Pose> {
        self.relative
    }

    fn current_relative(&self) -> Result<Pose, CalibrationError> {
        self.relative.ok_or_else(|| {
            CalibrationError::Numerical("relative pose has not been initialized".to_string())
        })
    }

    fn right_poses_from_relative(&self, relative: &Pose) -> Vec<Pose> {
        let r_rel = geometry::rodrigues(&relative.rvec);
        self.left_poses
            .iter()
            .map(|pose| {
                let r = r_rel * geometry::rodrigues(&pose.rvec);
                Pose {
                    rvec: geometry::rotation_vector(&r),
                    tvec: r_rel * pose.tvec + relative.tvec,
                }
            })
            .collect()
    }
}

/// `K_r^-T * E * K_l^-1`, normalized so the bottom-right entry is one when it
/// does not vanish.
fn fundamental_matrix(
    left: &RadTanModel,
    right: &RadTanModel,
    essential: &Matrix3<f64>,
) -> Result<Matrix3<f64>, CalibrationError> {
    let kl_inv = left
        .camera_matrix()
        .try_inverse()
        .ok_or_else(|| CalibrationError::Numerical("singular left camera matrix".to_string()))?;
    let kr_inv = right
        .camera_matrix()
        .try_inverse()
        .ok_or_else(|| CalibrationError::Numerical("singular right camera matrix".to_string()))?;
    let mut f = kr_inv.transpose() * essential * kl_inv;
    if f[(2, 2)].abs() > f64::EPSILON {
        f /= f[(2, 2)];
    }
    Ok(f)
}

impl Optimizer for StereoCalibrator {
    /// Initializes `(R, T)` with the component-wise median of the per-view
    /// relative poses `R_r * R_l^T`, `t_r - R * t_l`.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        let mut components: [Vec<f64>; 6] = Default::default();
        for (left, right) in self.left_poses.iter().zip(self.right_poses.iter()) {
            let r_l = geometry::rodrigues(&left.rvec);
            let r_r = geometry::rodrigues(&right.rvec);
            let r = r_r * r_l.transpose();
            let t = right.tvec - r * left.tvec;
            let rvec = geometry::rotation_vector(&r);
            for (k, value) in rvec.iter().chain(t.iter()).enumerate() {
                components[k].push(*value);
            }
        }

        let mut median = [0.0; 6];
        for (value, samples) in median.iter_mut().zip(components.iter_mut()) {
            *value = geometry::median(samples).ok_or_else(|| {
                CalibrationError::Numerical("no views to initialize the relative pose".to_string())
            })?;
        }
        self.relative = Some(Pose::from_slice(&median));
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        let relative = self.current_relative()?;
        let mask = self.flags.mask();
        let free_intrinsics = mask.free_count() > 0;
        let base_left = self.left.params();
        let base_right = self.right.params();

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert("relative".to_string(), relative.to_dvector());
        if free_intrinsics {
            initial_values.insert("camera_left".to_string(), mask.pack(&base_left));
            initial_values.insert("camera_right".to_string(), mask.pack(&base_right));
        }

        let n = self.object_points.len();
        for (i, pose) in self.left_poses.iter().enumerate() {
            let pose_name = format!("pose_{}", i);
            let factor = StereoReprojectionFactor {
                object_points: Arc::clone(&self.object_points),
                left: self.left_observations[i].iter().map(|p| p.coords).collect(),
                right: self.right_observations[i].iter().map(|p| p.coords).collect(),
                base_left,
                base_right,
                mask,
            };
            let mut blocks = vec![pose_name.as_str(), "relative"];
            if free_intrinsics {
                blocks.extend(["camera_left", "camera_right"]);
            }
            problem.add_residual_block(n * 4, &blocks, Box::new(factor), None);
            initial_values.insert(pose_name.clone(), pose.to_dvector());
        }

        if verbose {
            info!(
                "Starting stereo optimization over {} views (intrinsics {})...",
                self.left_poses.len(),
                if free_intrinsics { "free" } else { "fixed" }
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(self.criteria.solver_options()))
            .ok_or_else(|| CalibrationError::Numerical("stereo optimization failed".to_string()))?;

        let relative = result
            .get("relative")
            .map(|v| Pose::from_slice(v.as_slice()))
            .ok_or_else(|| CalibrationError::Numerical("missing relative pose".to_string()))?;
        let mut left_poses = Vec::with_capacity(self.left_poses.len());
        for i in 0..self.left_poses.len() {
            let values = result.get(&format!("pose_{}", i)).ok_or_else(|| {
                CalibrationError::Numerical(format!("missing pose of view {}", i))
            })?;
            left_poses.push(Pose::from_slice(values.as_slice()));
        }
        if free_intrinsics {
            let missing = || CalibrationError::Numerical("missing camera parameters".to_string());
            let left = mask.unpack_f64(&base_left, result.get("camera_left").ok_or_else(missing)?);
            let right = mask.unpack_f64(&base_right, result.get("camera_right").ok_or_else(missing)?);
            self.left.set_params(&left)?;
            self.right.set_params(&right)?;
        }
        if relative
            .rvec
            .iter()
            .chain(relative.tvec.iter())
            .any(|v| !v.is_finite())
        {
            return Err(CalibrationError::Numerical(
                "stereo optimization produced a non-finite relative pose".to_string(),
            ));
        }

        self.left_poses = left_poses;
        self.relative = Some(relative);
        self.right_poses = self.right_poses_from_relative(&relative);

        if verbose {
            info!(
                "Stereo optimization finished: rvec {:?} tvec {:?}",
                relative.rvec.as_slice(),
                relative.tvec.as_slice()
            );
        }
        Ok(())
    }

    /// Statistics over the corners of both cameras; `rmse` is the stereo RMS.
    fn compute_reprojection_error(&self) -> Result<ProjectionError, CalibrationError> {
        let relative = self.current_relative()?;
        let right_poses = self.right_poses_from_relative(&relative);
        let mut errors = reprojection_errors(
            &self.left,
            &self.object_points,
            &self.left_observations,
            &self.left_poses,
        )?;
        errors.extend(reprojection_errors(
            &self.right,
            &self.object_points,
            &self.right_observations,
            &right_poses,
        )?);
        ProjectionError::from_errors(&errors)
            .ok_or_else(|| CalibrationError::Numerical("no points to reproject".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::pattern::ChessboardPattern;
    use crate::camera::{Intrinsics, Resolution};
    use crate::optimization::{MonoCalibrator, MonoFlags};
    use approx::assert_relative_eq;

    fn camera(fx: f64, cx: f64) -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx,
                fy: fx,
                cx,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [-0.05, 0.01, 0.0, 0.0, 0.0],
        }
    }

    #[test]
    fn test_stereo_calibration_recovers_baseline() {
        let pattern = ChessboardPattern::new(5, 7, 0.03).unwrap();
        let object_points = pattern.shared_object_points();
        let left_cam = camera(600.0, 318.0);
        let right_cam = camera(610.0, 324.0);
        let relative = Pose {
            rvec: Vector3::new(0.01, -0.02, 0.005),
            tvec: Vector3::new(-0.12, 0.002, 0.001),
        };

        let left_poses: Vec<Pose> = (0..6)
            .map(|i| Pose {
                rvec: Vector3::new(0.25 * ((i % 3) as f64 - 1.0), 0.2 * ((i % 2) as f64 * 2.0 - 1.0), 0.05),
                tvec: Vector3::new(-0.02 * i as f64, -0.06, 0.6 + 0.02 * i as f64),
            })
            .collect();
        let r_rel = geometry::rodrigues(&relative.rvec);
        let observe = |cam: &RadTanModel, to_camera: &dyn Fn(&Vector3<f64>, &Pose) -> Vector3<f64>| {
            left_poses
                .iter()
                .map(|pose| {
                    object_points
                        .iter()
                        .map(|p| Point2::from(cam.project_unchecked(&to_camera(p, pose)).unwrap()))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        let left_obs = observe(&left_cam, &|p, pose| pose.transform(p));
        let right_obs = observe(&right_cam, &|p, pose| r_rel * pose.transform(p) + relative.tvec);

        let mono = |obs: &Vec<Vec<Point2<f64>>>| {
            MonoCalibrator::new(
                Arc::clone(&object_points),
                obs.clone(),
                left_cam.resolution,
                MonoFlags::default(),
                TermCriteria::new(30, f64::EPSILON),
            )
            .unwrap()
            .calibrate(false)
            .unwrap()
        };
        let left = mono(&left_obs);
        let right = mono(&right_obs);

        let result = StereoCalibrator::new(
            Arc::clone(&object_points),
            left_obs,
            right_obs,
            left,
            right,
            StereoFlags::default(),
            TermCriteria::new(30, 1e-6),
        )
        .unwrap()
        .calibrate(false)
        .unwrap();

        assert!(result.rms < 1e-2, "rms {}", result.rms);
        assert_relative_eq!(result.translation, relative.tvec, epsilon = 1e-3);
        assert_relative_eq!(result.rotation, r_rel, epsilon = 1e-3);
        assert_relative_eq!(result.fundamental[(2, 2)], 1.0);
        assert_relative_eq!(
            result.essential,
            geometry::skew(&result.translation) * result.rotation,
            epsilon = 1e-12
        );

        // epipolar constraint on ideal (undistorted) pixels
        let x_left = Vector3::new(0.05, 0.02, 0.7);
        let x_right = r_rel * x_left + relative.tvec;
        let pl = result.left.camera_matrix() * (x_left / x_left.z);
        let pr = result.right.camera_matrix() * (x_right / x_right.z);
        let line = result.fundamental * pl;
        let distance = pr.dot(&line).abs() / (line.x * line.x + line.y * line.y).sqrt();
        assert!(distance < 0.05, "distance to epipolar line {}", distance);
    }
}
