//! Output helpers: directories, the NumPy parameter archive and run reports.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::info;
use nalgebra::{Dim, Matrix, RawStorage};
use ndarray::{Array1, Array2};
use ndarray_npy::NpzWriter;
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationError, CalibrationResult, StereoPair};
use crate::camera::CameraModel;

/// File name of the parameter archive inside `param_save_path`.
pub const ARCHIVE_NAME: &str = "stereo_calib.npz";

/// Creates `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<PathBuf, CalibrationError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
    }
    Ok(dir.to_path_buf())
}

fn to_array2<R: Dim, C: Dim, S: RawStorage<f64, R, C>>(m: &Matrix<f64, R, C, S>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Writes the compressed archive `<dir>/stereo_calib.npz` with the arrays
/// `mtxL, distL, mtxR, distR, R, T, R1, R2, P1, P2, Q`.
///
/// # Return Value
///
/// The path of the written archive.
pub fn save_npz(dir: &Path, result: &CalibrationResult) -> Result<PathBuf, CalibrationError> {
    let path = ensure_dir(dir)?.join(ARCHIVE_NAME);
    let mut npz = NpzWriter::new_compressed(File::create(&path)?);

    let cameras = &result.cameras;
    let rect = &result.rectification;
    npz.add_array("mtxL", &to_array2(&cameras.left.camera_matrix()))?;
    npz.add_array("distL", &Array1::from(cameras.left.distortions.to_vec()))?;
    npz.add_array("mtxR", &to_array2(&cameras.right.camera_matrix()))?;
    npz.add_array("distR", &Array1::from(cameras.right.distortions.to_vec()))?;
    npz.add_array("R", &to_array2(&result.rotation))?;
    npz.add_array("T", &to_array2(&result.translation))?;
    npz.add_array("R1", &to_array2(&rect.r1))?;
    npz.add_array("R2", &to_array2(&rect.r2))?;
    npz.add_array("P1", &to_array2(&rect.p1))?;
    npz.add_array("P2", &to_array2(&rect.p2))?;
    npz.add_array("Q", &to_array2(&rect.q))?;
    npz.finish()?;
    Ok(path)
}

#[derive(Debug, Serialize)]
struct SampleRow<'a> {
    pair: usize,
    left_file: &'a str,
    right_file: &'a str,
    status: &'a str,
    sample_index: Option<usize>,
}

/// Writes one CSV row per input pair with its detection outcome.
pub fn write_sample_report(path: &Path, result: &CalibrationResult) -> Result<(), CalibrationError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for (pair, outcome) in result.outcomes.iter().enumerate() {
        writer.serialize(SampleRow {
            pair,
            left_file: &outcome.files.left,
            right_file: &outcome.files.right,
            status: outcome.status.label(),
            sample_index: outcome.status.sample_index(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Camera values of [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSummary {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// `[k1, k2, p1, p2, k3]`
    pub distortion: Vec<f64>,
    pub mono_rms: f64,
}

/// Human-readable digest of a run, written as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub rms_error: f64,
    pub image_width: u32,
    pub image_height: u32,
    pub pairs: usize,
    pub samples: usize,
    pub cameras: StereoPair<CameraSummary>,
    /// Row-major.
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
    pub baseline: f64,
    pub vertical_rig: bool,
    pub archive: PathBuf,
}

impl RunSummary {
    pub fn from_result(result: &CalibrationResult) -> Self {
        let camera = |model: &crate::camera::RadTanModel, mono_rms: f64| {
            let intrinsics = model.get_intrinsics();
            CameraSummary {
                fx: intrinsics.fx,
                fy: intrinsics.fy,
                cx: intrinsics.cx,
                cy: intrinsics.cy,
                distortion: model.get_distortion(),
                mono_rms,
            }
        };
        let r = &result.rotation;
        RunSummary {
            rms_error: result.rms_error,
            image_width: result.image_size.width,
            image_height: result.image_size.height,
            pairs: result.outcomes.len(),
            samples: result.sample_count(),
            cameras: StereoPair::new(
                camera(&result.cameras.left, result.mono_rms.left),
                camera(&result.cameras.right, result.mono_rms.right),
            ),
            rotation: [
                [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
                [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
                [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
            ],
            translation: [
                result.translation.x,
                result.translation.y,
                result.translation.z,
            ],
            baseline: result.translation.norm(),
            vertical_rig: result.rectification.vertical,
            archive: result.archive.clone(),
        }
    }
}

pub fn write_json_summary(path: &Path, result: &CalibrationResult) -> Result<(), CalibrationError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &RunSummary::from_result(result))?;
    Ok(())
}

/// Saves `left.yaml` and `right.yaml` camera files into `dir`.
pub fn export_camera_yaml(dir: &Path, result: &CalibrationResult) -> Result<StereoPair<PathBuf>, CalibrationError> {
    let dir = ensure_dir(dir)?;
    let paths = StereoPair::new(dir.join("left.yaml"), dir.join("right.yaml"));
    result
        .cameras
        .left
        .save_to_yaml(&paths.left.to_string_lossy())?;
    result
        .cameras
        .right
        .save_to_yaml(&paths.right.to_string_lossy())?;
    Ok(paths)
}

/// Logs the calibrated parameters.
pub fn display_results_summary(result: &CalibrationResult) {
    let summary = RunSummary::from_result(result);
    info!(
        "Calibrated from {} of {} pairs at {}x{}",
        summary.samples, summary.pairs, summary.image_width, summary.image_height
    );
    for (name, camera) in [("Left", &summary.cameras.left), ("Right", &summary.cameras.right)] {
        info!(
            "{} camera: fx={:.3} fy={:.3} cx={:.3} cy={:.3} dist={:?} (mono RMS {:.4} px)",
            name, camera.fx, camera.fy, camera.cx, camera.cy, camera.distortion, camera.mono_rms
        );
    }
    info!(
        "Baseline {:.5}, T = {:?}{}",
        summary.baseline,
        summary.translation,
        if summary.vertical_rig { " (vertical rig)" } else { "" }
    );
    info!("Stereo RMS error: {:.4} px", summary.rms_error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{SampleOutcome, SampleStatus};
    use crate::camera::{Intrinsics, RadTanModel, Resolution};
    use crate::rectify::stereo_rectify;
    use nalgebra::{Matrix3, Vector3};

    fn result() -> CalibrationResult {
        let camera = RadTanModel {
            intrinsics: Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [0.0; 5],
        };
        let rotation = Matrix3::identity();
        let translation = Vector3::new(-0.12, 0.0, 0.0);
        let rectification = stereo_rectify(&camera, &camera, &rotation, &translation, None).unwrap();
        let outcome = |name: &str, status| SampleOutcome {
            files: StereoPair::new(name.to_string(), name.to_string()),
            status,
        };
        CalibrationResult {
            cameras: StereoPair::new(camera.clone(), camera),
            rotation,
            translation,
            essential: crate::geometry::skew(&translation) * rotation,
            fundamental: Matrix3::identity(),
            rectification,
            rms_error: 0.25,
            mono_rms: StereoPair::new(0.2, 0.3),
            image_size: Resolution {
                width: 640,
                height: 480,
            },
            outcomes: vec![
                outcome("a.png", SampleStatus::Accepted { index: 0 }),
                outcome("b.png", SampleStatus::RejectedLeft),
            ],
            archive: PathBuf::from("stereo_calib.npz"),
        }
    }

    #[test]
    fn test_sample_report_rows() {
        let dir = std::env::temp_dir().join("stereo_calib_util_csv");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("report.csv");
        write_sample_report(&path, &result()).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["pair", "left_file", "right_file", "status", "sample_index"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][3], "accepted");
        assert_eq!(&rows[0][4], "0");
        assert_eq!(&rows[1][3], "rejected_left");
        assert_eq!(&rows[1][4], "");
    }

    #[test]
    fn test_json_summary() {
        let dir = std::env::temp_dir().join("stereo_calib_util_json");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("summary.json");
        write_json_summary(&path, &result()).unwrap();

        let summary: RunSummary =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(summary.pairs, 2);
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.cameras.right.mono_rms, 0.3);
        assert!((summary.baseline - 0.12).abs() < 1e-12);
        assert!(!summary.vertical_rig);
    }

    #[test]
    fn test_camera_yaml_export_round_trips() {
        let dir = std::env::temp_dir().join("stereo_calib_util_yaml");
        let _ = fs::remove_dir_all(&dir);
        let result = result();
        let paths = export_camera_yaml(&dir, &result).unwrap();
        let loaded = RadTanModel::load_from_yaml(&paths.left.to_string_lossy()).unwrap();
        assert_eq!(loaded.intrinsics, result.cameras.left.intrinsics);
        assert_eq!(loaded.resolution, result.cameras.left.resolution);
    }

    #[test]
    fn test_save_npz_creates_directory() {
        let dir = std::env::temp_dir().join("stereo_calib_util_npz").join("nested");
        let _ = fs::remove_dir_all(&dir);
        let path = save_npz(&dir, &result()).unwrap();
        assert_eq!(path, dir.join(ARCHIVE_NAME));
        assert!(path.is_file());
    }
}
