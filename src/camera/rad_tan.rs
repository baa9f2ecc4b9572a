//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct: a pinhole camera with the
//! five-coefficient Brown-Conrady lens distortion `[k1, k2, p1, p2, k3]`, the
//! same layout OpenCV uses for its `distCoeffs`. Besides the [`CameraModel`]
//! trait it exposes the building blocks the calibrators and the rectification
//! solver need: projection without image-bounds checks, point undistortion and
//! a projection function generic over [`RealField`] for automatic
//! differentiation.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::YamlLoader;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// The distortion coefficients are stored as:
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use nalgebra::{DVector, Vector3};
/// use stereo_calib::camera::rad_tan::RadTanModel;
/// use stereo_calib::camera::{CameraModel, Resolution};
///
/// // Parameters: fx, fy, cx, cy, k1, k2, p1, p2, k3
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0,
///     0.1, -0.05, 0.001, 0.001, 0.02,
/// ]);
/// let mut model = RadTanModel::new(&params).unwrap();
/// model.resolution = Resolution { width: 640, height: 480 };
///
/// let pixel = model.project(&Vector3::new(0.1, 0.05, 1.0)).unwrap();
/// assert!(pixel.x > 320.0 && pixel.y > 240.0);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    pub distortions: [f64; 5], // k1, k2, p1, p2, k3
}

/// Applies the radial-tangential distortion to normalized image coordinates.
///
/// Generic over [`RealField`] so the same code runs on `f64` and on the dual
/// numbers `tiny_solver` uses for its Jacobians.
///
/// # Arguments
///
/// * `distortions` - `[k1, k2, p1, p2, k3]`.
/// * `x`, `y` - Undistorted normalized coordinates (`X / Z`, `Y / Z`).
///
/// # Return Value
///
/// The distorted normalized coordinates `(x_d, y_d)`.
pub fn distort<T: RealField>(distortions: &[T], x: T, y: T) -> (T, T) {
    let k1 = distortions[0].clone();
    let k2 = distortions[1].clone();
    let p1 = distortions[2].clone();
    let p2 = distortions[3].clone();
    let k3 = distortions[4].clone();
    let two = nalgebra::convert::<f64, T>(2.0);

    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;
    let xy = x.clone() * y.clone();

    let x_d = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let y_d = y.clone() * radial
        + p1 * (r2 + two.clone() * y.clone() * y)
        + two * p2 * xy;
    (x_d, y_d)
}

/// Projects a camera-frame point with a flat parameter slice
/// `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
///
/// No depth or image-bounds checks are performed; callers inside an optimizer
/// must see a smooth function of the parameters.
pub fn project_generic<T: RealField>(params: &[T], point: &[T; 3]) -> [T; 2] {
    let x = point[0].clone() / point[2].clone();
    let y = point[1].clone() / point[2].clone();
    let (x_d, y_d) = distort(&params[4..9], x, y);
    [
        params[0].clone() * x_d + params[2].clone(),
        params[1].clone() * y_d + params[3].clone(),
    ]
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from a parameter vector.
    ///
    /// # Arguments
    ///
    /// * `parameters` - `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    ///
    /// # Return Value
    ///
    /// The model with a `0x0` resolution; set it before calling
    /// [`CameraModel::project`], which checks image bounds.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if the vector does not hold nine
    /// values, or the error of [`CameraModel::validate_params`].
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() != 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 9 parameters, got {}",
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution::default(),
            distortions: [
                parameters[4],
                parameters[5],
                parameters[6],
                parameters[7],
                parameters[8],
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Builds a model from a camera matrix, distortion coefficients and the
    /// image resolution.
    pub fn from_matrix(
        camera_matrix: &Matrix3<f64>,
        distortions: [f64; 5],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = RadTanModel {
            intrinsics: Intrinsics::from_matrix(camera_matrix),
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// The 3x3 camera matrix `K`.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.matrix()
    }

    /// All nine parameters as `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    pub fn params(&self) -> [f64; 9] {
        let d = &self.distortions;
        [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
        ]
    }

    /// Replaces all parameters from a `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
    /// slice, keeping the resolution.
    pub fn set_params(&mut self, params: &[f64]) -> Result<(), CameraModelError> {
        if params.len() != 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 9 parameters, got {}",
                params.len()
            )));
        }
        self.intrinsics = Intrinsics {
            fx: params[0],
            fy: params[1],
            cx: params[2],
            cy: params[3],
        };
        self.distortions.copy_from_slice(&params[4..9]);
        self.validate_params()
    }

    /// Maps undistorted normalized coordinates to a pixel.
    pub fn project_normalized(&self, x: f64, y: f64) -> Vector2<f64> {
        let (x_d, y_d) = distort(&self.distortions, x, y);
        Vector2::new(
            self.intrinsics.fx * x_d + self.intrinsics.cx,
            self.intrinsics.fy * y_d + self.intrinsics.cy,
        )
    }

    /// Projects a camera-frame point, rejecting only points at or behind the
    /// camera center. Unlike [`CameraModel::project`] the result may lie
    /// outside the image.
    pub fn project_unchecked(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        Ok(self.project_normalized(point_3d.x / point_3d.z, point_3d.y / point_3d.z))
    }

    /// Removes the lens distortion of a pixel.
    ///
    /// Inverts the distortion with Newton iterations on the normalized image
    /// plane, starting from the distorted point.
    ///
    /// # Arguments
    ///
    /// * `pixel` - Pixel coordinates, not required to lie inside the image.
    ///
    /// # Return Value
    ///
    /// Undistorted normalized coordinates `(X / Z, Y / Z)`.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the distortion Jacobian becomes
    /// singular or the iteration does not converge.
    pub fn undistort_normalized(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 50;

        let [k1, k2, p1, p2, k3] = self.distortions;
        let target = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        let mut point = target;

        for _ in 0..MAX_ITERATIONS {
            let (x, y) = (point.x, point.y);
            let (x_d, y_d) = distort(&self.distortions, x, y);
            let error = Vector2::new(x_d, y_d) - target;
            if error.norm() < EPS {
                return Ok(point);
            }

            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            // d(radial) / d(r2)
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r2 * r2;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;
            let jacobian = Matrix2::new(j00, j01, j10, j11);

            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })?;
            let delta = inv_jacobian * error;
            point -= delta;
            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations",
            MAX_ITERATIONS
        )))
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point to pixel coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`] if `z` is close to zero or
    ///   negative.
    /// * [`CameraModelError::ProjectionOutSideImage`] if the pixel falls
    ///   outside the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = self.project_unchecked(point_3d)?;
        if pixel.x < 0.0
            || pixel.x >= self.resolution.width as f64
            || pixel.y < 0.0
            || pixel.y >= self.resolution.height as f64
        {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    /// Unprojects a pixel to a unit-norm ray in the camera frame.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`] if the pixel is outside the
    ///   resolution.
    /// * The errors of [`RadTanModel::undistort_normalized`].
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if point_2d.x < 0.0
            || point_2d.x >= self.resolution.width as f64
            || point_2d.y < 0.0
            || point_2d.y >= self.resolution.height as f64
        {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let normalized = self.undistort_normalized(point_2d)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    /// Loads a model from a Kalibr-style YAML file with a `cam0` entry
    /// holding `intrinsics`, `distortion` (five values) and `resolution`.
    ///
    /// # Errors
    ///
    /// IO and YAML errors, or [`CameraModelError::InvalidParams`] for missing
    /// or malformed entries.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs.first().ok_or_else(|| {
            CameraModelError::InvalidParams("Empty YAML document".to_string())
        })?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid intrinsics".to_string()))?;
        let resolution_yaml = doc["cam0"]["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let distortion_yaml = doc["cam0"]["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("Missing distortion parameters".to_string())
        })?;

        if intrinsics_yaml.len() != 4 || resolution_yaml.len() != 2 {
            return Err(CameraModelError::InvalidParams(
                "Expected 4 intrinsics and 2 resolution values".to_string(),
            ));
        }
        if distortion_yaml.len() != 5 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 5 distortion parameters in YAML, found {}",
                distortion_yaml.len()
            )));
        }

        let float_at = |node: &yaml_rust::Yaml, name: &str| {
            node.as_f64()
                .or_else(|| node.as_i64().map(|v| v as f64))
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {}", name)))
        };

        let intrinsics = Intrinsics {
            fx: float_at(&intrinsics_yaml[0], "fx")?,
            fy: float_at(&intrinsics_yaml[1], "fy")?,
            cx: float_at(&intrinsics_yaml[2], "cx")?,
            cy: float_at(&intrinsics_yaml[3], "cy")?,
        };

        let resolution = Resolution {
            width: resolution_yaml[0]
                .as_i64()
                .ok_or_else(|| CameraModelError::InvalidParams("Invalid width".to_string()))?
                as u32,
            height: resolution_yaml[1]
                .as_i64()
                .ok_or_else(|| CameraModelError::InvalidParams("Invalid height".to_string()))?
                as u32,
        };

        let mut distortions = [0.0; 5];
        for (i, param) in distortion_yaml.iter().enumerate() {
            distortions[i] = float_at(param, &format!("distortion parameter at index {}", i))?;
        }

        let model = RadTanModel {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Saves the model in the layout read by [`CameraModel::load_from_yaml`].
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        use serde_yaml::{Mapping, Value};

        let mut cam = Mapping::new();
        cam.insert(
            Value::from("camera_model"),
            Value::from("pinhole"),
        );
        cam.insert(
            Value::from("distortion_model"),
            Value::from("radtan"),
        );
        cam.insert(
            Value::from("intrinsics"),
            serde_yaml::to_value([
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
            ])?,
        );
        cam.insert(
            Value::from("distortion"),
            serde_yaml::to_value(self.distortions)?,
        );
        cam.insert(
            Value::from("resolution"),
            serde_yaml::to_value([self.resolution.width, self.resolution.height])?,
        );

        let mut root = Mapping::new();
        root.insert(Value::from("cam0"), Value::Mapping(cam));
        let yaml_string = serde_yaml::to_string(&Value::Mapping(root))?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel::load_from_yaml("samples/rad_tan.yaml").unwrap()
    }

    #[test]
    fn test_radtan_load_from_yaml() {
        let model = sample_model();

        assert_eq!(model.intrinsics.fx, 461.629);
        assert_eq!(model.intrinsics.fy, 460.152);
        assert_eq!(model.intrinsics.cx, 362.680);
        assert_eq!(model.intrinsics.cy, 246.049);
        assert_eq!(model.resolution.width, 752);
        assert_eq!(model.resolution.height, 480);

        assert_eq!(model.distortions[0], -0.28340811); // k1
        assert_eq!(model.distortions[1], 0.07395907); // k2
        assert_eq!(model.distortions[2], 0.00019359); // p1
        assert_eq!(model.distortions[3], 1.76187114e-05); // p2
        assert_eq!(model.distortions[4], 0.0); // k3
    }

    #[test]
    fn test_radtan_save_to_yaml() {
        let dir = std::env::temp_dir().join("stereo_calib_radtan_yaml");
        fs::create_dir_all(&dir).unwrap();
        let output_path = dir.join("rad_tan_saved.yaml");
        let output_path = output_path.to_str().unwrap();

        let model = sample_model();
        model.save_to_yaml(output_path).unwrap();
        let saved_model = RadTanModel::load_from_yaml(output_path).unwrap();

        assert_eq!(model, saved_model);
        fs::remove_file(output_path).unwrap();
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = sample_model();

        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        assert!(point_2d.x >= 0.0 && point_2d.x < model.resolution.width as f64);
        assert!(point_2d.y >= 0.0 && point_2d.y < model.resolution.height as f64);

        let point_3d_unprojected = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(norm_3d, point_3d_unprojected, epsilon = 1e-6);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();

        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),   // Center
            Vector3::new(0.5, 0.0, 1.0),   // Right
            Vector3::new(-0.5, 0.0, 1.0),  // Left
            Vector3::new(0.0, 0.4, 1.0),   // Bottom
            Vector3::new(0.0, -0.4, 1.0),  // Top
            Vector3::new(0.3, 0.4, 1.0),   // Bottom-right
            Vector3::new(-0.3, -0.4, 1.0), // Top-left
            Vector3::new(0.1, 0.1, 2.0),   // Further away
        ];

        for (i, original_point) in test_points.iter().enumerate() {
            let pixel = model.project_unchecked(original_point).unwrap();
            let normalized = model.undistort_normalized(&pixel).unwrap();
            let ray = Vector3::new(normalized.x, normalized.y, 1.0).normalize();
            let dot_product = original_point.normalize().dot(&ray);
            assert!(
                dot_product > 1.0 - 1e-9,
                "Test point {}: direction mismatch, dot product {}",
                i,
                dot_product
            );
        }
    }

    #[test]
    fn test_generic_projection_matches_model() {
        let model = sample_model();
        let params = model.params();
        let point = [0.2, -0.1, 1.5];
        let generic = project_generic(&params, &point);
        let direct = model
            .project_unchecked(&Vector3::new(point[0], point[1], point[2]))
            .unwrap();
        assert_relative_eq!(generic[0], direct.x, epsilon = 1e-12);
        assert_relative_eq!(generic[1], direct.y, epsilon = 1e-12);
    }

    #[test]
    fn test_point_behind_camera_is_rejected() {
        let model = sample_model();
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, -1.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let params = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0]);
        assert!(matches!(
            RadTanModel::new(&params),
            Err(CameraModelError::InvalidParams(_))
        ));
    }
}
