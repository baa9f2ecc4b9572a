//! Per-camera calibration from planar chessboard views.
//!
//! The initial estimate follows Zhang's method: one homography per view, the
//! camera matrix from the homography constraints, board poses from the
//! homographies, zero distortion. Levenberg-Marquardt (`tiny_solver`) then
//! refines the free camera parameters and every pose jointly.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Point2, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use super::{transform_generic, MonoFlags, Optimizer, ParamMask, Pose, ProjectionError, TermCriteria};
use crate::calibration::CalibrationError;
use crate::camera::rad_tan::{project_generic, RadTanModel};
use crate::camera::Resolution;
use crate::geometry;

/// Fewest views the closed-form initialization accepts.
pub const MIN_VIEWS: usize = 3;

/// Reprojection residuals of one view: `2 * N` values, `[u, v]` per corner.
///
/// Parameter blocks are `[camera, pose]`, where `camera` holds only the free
/// entries selected by `mask`.
#[derive(Debug, Clone)]
struct MonoReprojectionFactor {
    object_points: Arc<Vec<Vector3<f64>>>,
    observed: Vec<Vector2<f64>>,
    base: [f64; 9],
    mask: ParamMask,
}

impl<T: RealField> Factor<T> for MonoReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera = self.mask.unpack(&self.base, params[0].as_slice());
        let pose = params[1].as_slice();

        let mut residuals = DVector::zeros(self.observed.len() * 2);
        for (i, (object, observed)) in self
            .object_points
            .iter()
            .zip(self.observed.iter())
            .enumerate()
        {
            let point = transform_generic(
                pose,
                [
                    nalgebra::convert(object.x),
                    nalgebra::convert(object.y),
                    nalgebra::convert(object.z),
                ],
            );
            let [u, v] = project_generic(&camera, &point);
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(observed.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(observed.y);
        }
        residuals
    }
}

/// Result of calibrating one camera.
#[derive(Debug, Clone)]
pub struct MonoCalibration {
    pub camera: RadTanModel,
    /// Board-to-camera pose of every view.
    pub poses: Vec<Pose>,
    /// `sqrt(sum |e|^2 / N)` over all corners of all views, in pixels.
    pub rms: f64,
}

/// Calibrates one camera from the shared board geometry and its per-view
/// corner observations.
#[derive(Debug, Clone)]
pub struct MonoCalibrator {
    object_points: Arc<Vec<Vector3<f64>>>,
    observations: Vec<Vec<Point2<f64>>>,
    resolution: Resolution,
    flags: MonoFlags,
    criteria: TermCriteria,
    params: Option<[f64; 9]>,
    poses: Vec<Pose>,
}

impl MonoCalibrator {
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientSamples`] for fewer than
    ///   [`MIN_VIEWS`] views.
    /// * [`CalibrationError::InvalidConfig`] if a view does not observe every
    ///   object point or the resolution is empty.
    pub fn new(
        object_points: Arc<Vec<Vector3<f64>>>,
        observations: Vec<Vec<Point2<f64>>>,
        resolution: Resolution,
        flags: MonoFlags,
        criteria: TermCriteria,
    ) -> Result<Self, CalibrationError> {
        if observations.len() < MIN_VIEWS {
            return Err(CalibrationError::InsufficientSamples {
                found: observations.len(),
                required: MIN_VIEWS,
            });
        }
        if let Some(bad) = observations
            .iter()
            .position(|view| view.len() != object_points.len())
        {
            return Err(CalibrationError::InvalidConfig(format!(
                "view {} has {} corners, expected {}",
                bad,
                observations[bad].len(),
                object_points.len()
            )));
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CalibrationError::InvalidConfig(
                "image resolution must not be empty".to_string(),
            ));
        }
        Ok(MonoCalibrator {
            object_points,
            observations,
            resolution,
            flags,
            criteria,
            params: None,
            poses: Vec::new(),
        })
    }

    /// Runs [`Optimizer::linear_estimation`] and [`Optimizer::optimize`].
    pub fn calibrate(mut self, verbose: bool) -> Result<MonoCalibration, CalibrationError> {
        self.linear_estimation()?;
        self.optimize(verbose)?;
        let camera = self.camera()?;
        let rms = self.compute_reprojection_error()?.rmse;
        Ok(MonoCalibration {
            camera,
            poses: self.poses,
            rms,
        })
    }

    /// The current camera estimate.
    pub fn camera(&self) -> Result<RadTanModel, CalibrationError> {
        let params = self.current_params()?;
        let mut camera = RadTanModel::new(&DVector::from_row_slice(&params))?;
        camera.resolution = self.resolution;
        Ok(camera)
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    fn current_params(&self) -> Result<[f64; 9], CalibrationError> {
        self.params.ok_or_else(|| {
            CalibrationError::Numerical("camera has not been initialized".to_string())
        })
    }

    /// Homography of every view, board plane to pixels.
    fn view_homographies(&self) -> Result<Vec<Matrix3<f64>>, CalibrationError> {
        let board: Vec<Point2<f64>> = self
            .object_points
            .iter()
            .map(|p| Point2::new(p.x, p.y))
            .collect();
        self.observations
            .iter()
            .enumerate()
            .map(|(i, view)| {
                geometry::find_homography(&board, view).ok_or_else(|| {
                    CalibrationError::Numerical(format!("degenerate homography in view {}", i))
                })
            })
            .collect()
    }
}

/// Image normalization `N` used to condition the intrinsic solve: centers the
/// image and scales its larger side to 2.
fn image_normalization(resolution: &Resolution) -> Matrix3<f64> {
    let w = resolution.width as f64;
    let h = resolution.height as f64;
    let s = 2.0 / w.max(h);
    Matrix3::new(s, 0.0, -s * w / 2.0, 0.0, s, -s * h / 2.0, 0.0, 0.0, 1.0)
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Scales a homography so its first two columns have unit norm on average.
fn condition(h: &Matrix3<f64>) -> Matrix3<f64> {
    let scale = 0.5 * (h.column(0).norm() + h.column(1).norm());
    if scale > 1e-18 {
        h / scale
    } else {
        *h
    }
}

/// Zhang's closed-form camera matrix with the zero-skew constraint.
///
/// `homographies` must already be expressed in normalized image coordinates.
fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Option<Matrix3<f64>> {
    let mut v = DMatrix::<f64>::zeros(2 * homographies.len() + 1, 6);
    for (i, h) in homographies.iter().map(condition).enumerate() {
        let v12 = v_ij(&h, 0, 1);
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }
    // b12 = 0
    v[(2 * homographies.len(), 1)] = 1.0;

    let b = geometry::null_vector(&v)?;
    let sign = if b[0] < 0.0 { -1.0 } else { 1.0 };
    let (b11, b12, b22, b13, b23, b33) = (
        sign * b[0],
        sign * b[1],
        sign * b[2],
        sign * b[3],
        sign * b[4],
        sign * b[5],
    );

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if !(lambda > 0.0) {
        return None;
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let k = Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0);
    if k.iter().all(|x| x.is_finite()) {
        Some(k)
    } else {
        None
    }
}

/// Focal lengths assuming the principal point `(cx, cy)`, from the
/// orthogonality and equal-norm constraints of every homography.
fn focal_from_homographies(homographies: &[Matrix3<f64>], cx: f64, cy: f64) -> Option<(f64, f64)> {
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for h in homographies {
        let h = condition(&(shift * h));
        let (h1, h2) = (h.column(0), h.column(1));
        let rows = [
            (
                Vector2::new(h1[0] * h2[0], h1[1] * h2[1]),
                -h1[2] * h2[2],
            ),
            (
                Vector2::new(h1[0] * h1[0] - h2[0] * h2[0], h1[1] * h1[1] - h2[1] * h2[1]),
                -(h1[2] * h1[2] - h2[2] * h2[2]),
            ),
        ];
        for (a, b) in rows {
            ata += a * a.transpose();
            atb += a * b;
        }
    }
    let x = ata.try_inverse()? * atb;
    if x[0] > 0.0 && x[1] > 0.0 {
        Some((1.0 / x[0].sqrt(), 1.0 / x[1].sqrt()))
    } else {
        None
    }
}

/// Board pose from `H = s * K [r1 r2 t]` with the board in front of the
/// camera.
///
/// `[r1 r2 r1 x r2]` is only approximately orthonormal for a noisy `H`;
/// [`geometry::rotation_vector`] snaps it to the nearest rotation.
fn pose_from_homography(k_inv: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Pose> {
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);
    let norm = r1_raw.norm();
    if norm < 1e-18 {
        return None;
    }
    let mut scale = 1.0 / norm;
    if t_raw.z * scale < 0.0 {
        scale = -scale;
    }

    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let rvec = geometry::rotation_vector(&Matrix3::from_columns(&[r1, r2, r3]));
    let tvec = t_raw * scale;
    if rvec.iter().chain(tvec.iter()).all(|x| x.is_finite()) {
        Some(Pose { rvec, tvec })
    } else {
        None
    }
}

impl Optimizer for MonoCalibrator {
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        let homographies = self.view_homographies()?;
        let w = self.resolution.width as f64;
        let h = self.resolution.height as f64;

        let n = image_normalization(&self.resolution);
        let normalized: Vec<Matrix3<f64>> = homographies.iter().map(|hm| n * hm).collect();
        let zhang = intrinsics_from_homographies(&normalized)
            .and_then(|k_n| n.try_inverse().map(|n_inv| n_inv * k_n))
            .filter(|k| {
                let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
                fx > 0.0 && fy > 0.0 && (0.0..w).contains(&cx) && (0.0..h).contains(&cy) && {
                    let aspect = fx / fy;
                    (0.5..2.0).contains(&aspect)
                }
            });

        let k = match zhang {
            Some(k) => k,
            None => {
                warn!("Closed-form intrinsics rejected, assuming a centered principal point");
                let (cx, cy) = ((w - 1.0) / 2.0, (h - 1.0) / 2.0);
                let (fx, fy) = focal_from_homographies(&homographies, cx, cy).ok_or_else(|| {
                    CalibrationError::Numerical(
                        "cannot initialize focal length from the board views".to_string(),
                    )
                })?;
                Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
            }
        };
        debug!(
            "Initial intrinsics fx={:.3} fy={:.3} cx={:.3} cy={:.3}",
            k[(0, 0)],
            k[(1, 1)],
            k[(0, 2)],
            k[(1, 2)]
        );

        let k_inv = k
            .try_inverse()
            .ok_or_else(|| CalibrationError::Numerical("singular camera matrix".to_string()))?;
        self.poses = homographies
            .iter()
            .enumerate()
            .map(|(i, hm)| {
                pose_from_homography(&k_inv, hm).ok_or_else(|| {
                    CalibrationError::Numerical(format!("cannot recover pose of view {}", i))
                })
            })
            .collect::<Result<_, _>>()?;

        let mut params = [k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], 0.0, 0.0, 0.0, 0.0, 0.0];
        if self.flags.fix_principal_point {
            params[2] = (w - 1.0) / 2.0;
            params[3] = (h - 1.0) / 2.0;
        }
        self.params = Some(params);
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        let base = self.current_params()?;
        let mask = self.flags.mask();

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert("camera".to_string(), mask.pack(&base));

        for (i, (view, pose)) in self.observations.iter().zip(self.poses.iter()).enumerate() {
            let pose_name = format!("pose_{}", i);
            let factor = MonoReprojectionFactor {
                object_points: Arc::clone(&self.object_points),
                observed: view.iter().map(|p| p.coords).collect(),
                base,
                mask,
            };
            problem.add_residual_block(
                view.len() * 2,
                &["camera", pose_name.as_str()],
                Box::new(factor),
                None,
            );
            initial_values.insert(pose_name, pose.to_dvector());
        }

        if verbose {
            info!(
                "Starting camera optimization over {} views with tiny-solver Levenberg-Marquardt...",
                self.observations.len()
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(self.criteria.solver_options()))
            .ok_or_else(|| CalibrationError::Numerical("camera optimization failed".to_string()))?;

        let camera_values = result
            .get("camera")
            .ok_or_else(|| CalibrationError::Numerical("missing camera parameters".to_string()))?;
        let params = mask.unpack_f64(&base, camera_values);
        let mut poses = Vec::with_capacity(self.poses.len());
        for i in 0..self.poses.len() {
            let values = result.get(&format!("pose_{}", i)).ok_or_else(|| {
                CalibrationError::Numerical(format!("missing pose of view {}", i))
            })?;
            poses.push(Pose::from_slice(values.as_slice()));
        }
        if params.iter().any(|p| !p.is_finite())
            || poses
                .iter()
                .any(|p| p.rvec.iter().chain(p.tvec.iter()).any(|x| !x.is_finite()))
        {
            return Err(CalibrationError::Numerical(
                "camera optimization produced non-finite parameters".to_string(),
            ));
        }

        self.params = Some(params);
        self.poses = poses;

        if verbose {
            let camera = self.camera()?;
            info!("Optimization finished: {:?}", camera);
        }
        Ok(())
    }

    fn compute_reprojection_error(&self) -> Result<ProjectionError, CalibrationError> {
        let camera = self.camera()?;
        let errors = reprojection_errors(&camera, &self.object_points, &self.observations, &self.poses)?;
        ProjectionError::from_errors(&errors)
            .ok_or_else(|| CalibrationError::Numerical("no points to reproject".to_string()))
    }
}

/// Pixel distance between every observed corner and its reprojection.
pub(crate) fn reprojection_errors(
    camera: &RadTanModel,
    object_points: &[Vector3<f64>],
    observations: &[Vec<Point2<f64>>],
    poses: &[Pose],
) -> Result<Vec<f64>, CalibrationError> {
    let mut errors = Vec::with_capacity(observations.len() * object_points.len());
    for (view, pose) in observations.iter().zip(poses.iter()) {
        for (object, observed) in object_points.iter().zip(view.iter()) {
            let projected = camera.project_unchecked(&pose.transform(object))?;
            errors.push((projected - observed.coords).norm());
        }
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::pattern::ChessboardPattern;
    use approx::assert_relative_eq;

    fn ground_truth() -> RadTanModel {
        RadTanModel {
            intrinsics: crate::camera::Intrinsics {
                fx: 600.0,
                fy: 605.0,
                cx: 322.0,
                cy: 238.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [-0.12, 0.05, 0.0, 0.0, 0.0],
        }
    }

    fn views() -> Vec<Pose> {
        let angles = [
            (0.2, 0.0, 0.0),
            (-0.2, 0.1, 0.05),
            (0.0, 0.3, -0.1),
            (0.1, -0.3, 0.0),
            (0.35, 0.2, 0.1),
            (-0.3, -0.25, -0.05),
        ];
        angles
            .iter()
            .enumerate()
            .map(|(i, &(rx, ry, rz))| Pose {
                rvec: Vector3::new(rx, ry, rz),
                tvec: Vector3::new(-0.1 + 0.01 * i as f64, -0.05, 0.55 + 0.03 * i as f64),
            })
            .collect()
    }

    fn observe(camera: &RadTanModel, points: &[Vector3<f64>], poses: &[Pose]) -> Vec<Vec<Point2<f64>>> {
        poses
            .iter()
            .map(|pose| {
                points
                    .iter()
                    .map(|p| Point2::from(camera.project_unchecked(&pose.transform(p)).unwrap()))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_mono_calibration_recovers_camera() {
        let pattern = ChessboardPattern::new(6, 9, 0.025).unwrap();
        let object_points = pattern.shared_object_points();
        let truth = ground_truth();
        let observations = observe(&truth, &object_points, &views());

        let calibrator = MonoCalibrator::new(
            Arc::clone(&object_points),
            observations,
            truth.resolution,
            MonoFlags::default(),
            TermCriteria::new(30, f64::EPSILON),
        )
        .unwrap();
        let result = calibrator.calibrate(false).unwrap();

        assert!(result.rms < 1e-3, "rms {}", result.rms);
        assert_relative_eq!(result.camera.intrinsics.fx, 600.0, max_relative = 1e-3);
        assert_relative_eq!(result.camera.intrinsics.fy, 605.0, max_relative = 1e-3);
        assert_relative_eq!(result.camera.intrinsics.cx, 322.0, epsilon = 0.5);
        assert_relative_eq!(result.camera.intrinsics.cy, 238.0, epsilon = 0.5);
        assert_relative_eq!(result.camera.distortions[0], -0.12, epsilon = 1e-2);
        assert_eq!(result.camera.distortions[2], 0.0);
        assert_eq!(result.camera.distortions[3], 0.0);
        assert_eq!(result.poses.len(), 6);
    }

    #[test]
    fn test_linear_estimation_is_close_without_distortion() {
        let pattern = ChessboardPattern::new(6, 9, 0.025).unwrap();
        let object_points = pattern.shared_object_points();
        let mut truth = ground_truth();
        truth.distortions = [0.0; 5];
        let poses = views();
        let observations = observe(&truth, &object_points, &poses);

        let mut calibrator = MonoCalibrator::new(
            object_points,
            observations,
            truth.resolution,
            MonoFlags::default(),
            TermCriteria::new(30, f64::EPSILON),
        )
        .unwrap();
        calibrator.linear_estimation().unwrap();
        let camera = calibrator.camera().unwrap();
        assert_relative_eq!(camera.intrinsics.fx, 600.0, max_relative = 1e-6);
        assert_relative_eq!(camera.intrinsics.cy, 238.0, epsilon = 1e-3);
        assert_relative_eq!(calibrator.poses()[2].tvec, poses[2].tvec, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_views() {
        let pattern = ChessboardPattern::new(4, 5, 0.03).unwrap();
        let object_points = pattern.shared_object_points();
        let truth = ground_truth();
        let observations = observe(&truth, &object_points, &views()[..2]);
        let err = MonoCalibrator::new(
            object_points,
            observations,
            truth.resolution,
            MonoFlags::default(),
            TermCriteria::new(30, f64::EPSILON),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientSamples { found: 2, required: 3 }
        ));
    }

    #[test]
    fn test_pose_from_skewed_homography_is_a_rotation() {
        let k = ground_truth().camera_matrix();
        let rotation = geometry::rodrigues(&Vector3::new(0.2, -0.1, 0.05));
        let t = Vector3::new(0.05, -0.02, 0.6);
        // second column slightly off orthogonal, overall scale negative
        let r2 = rotation.column(1) + Vector3::new(0.01, -0.005, 0.0);
        let h = k * Matrix3::from_columns(&[rotation.column(0).into_owned(), r2, t]) * -3.0;

        let pose = pose_from_homography(&k.try_inverse().unwrap(), &h).unwrap();
        let r = geometry::rodrigues(&pose.rvec);
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(r, rotation, epsilon = 0.01);
        assert_relative_eq!(pose.tvec, t, epsilon = 1e-9);
    }
}
