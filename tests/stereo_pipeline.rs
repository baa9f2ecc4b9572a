use std::fs::File;
use std::path::PathBuf;

use approx::assert_relative_eq;
use image::{GrayImage, Luma};
use ndarray::ArrayD;
use ndarray_npy::NpzReader;

use stereo_calib::calibration::{collect_samples, stereo_calibration, CalibrationConfig};
use stereo_calib::synthetic::{self, board_poses, SyntheticRig};
use stereo_calib::{CalibrationError, ChessboardPattern, SampleStatus};

fn pattern() -> ChessboardPattern {
    ChessboardPattern::new(4, 8, 0.03).unwrap()
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stereo_calib_pipeline_{}", name));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn dataset(name: &str, pairs: usize) -> (PathBuf, CalibrationConfig) {
    let root = scratch(name);
    let config = CalibrationConfig::builder(pattern())
        .param_save_path(root.join("params"))
        .build()
        .unwrap();
    synthetic::write_dataset(
        &root.join("input"),
        &config.subdirs,
        &SyntheticRig::default(),
        &pattern(),
        pairs,
    )
    .unwrap();
    (root, config)
}

fn npz_array(npz: &mut NpzReader<File>, name: &str) -> ArrayD<f64> {
    let entry = npz
        .names()
        .unwrap()
        .into_iter()
        .find(|n| n.trim_end_matches(".npy") == name)
        .unwrap_or_else(|| panic!("{} missing from archive", name));
    npz.by_name(&entry).unwrap()
}

#[test]
fn test_end_to_end_synthetic_rig() {
    let (root, mut config) = dataset("end_to_end", 10);
    config.render_dir = Some(root.join("render"));

    let result = stereo_calibration(&root.join("input"), &config).unwrap();
    assert!(result.rms_error > 0.0 && result.rms_error < 2.0, "rms {}", result.rms_error);
    assert!(result.sample_count() >= 8, "only {} samples", result.sample_count());
    assert_eq!(result.outcomes.len(), 10);

    let rig = SyntheticRig::default();
    assert_relative_eq!(result.translation, rig.translation, epsilon = 0.01);
    assert_relative_eq!(result.rotation, rig.rotation, epsilon = 0.01);
    assert_relative_eq!(
        result.essential,
        stereo_calib::geometry::skew(&result.translation) * result.rotation,
        epsilon = 1e-12
    );
    assert_relative_eq!(result.fundamental[(2, 2)], 1.0, epsilon = 1e-12);
    let left = &result.cameras.left.intrinsics;
    assert!((left.fx - 600.0).abs() < 10.0, "fx {}", left.fx);

    // optical axes of the rectified cameras coincide
    let rect = &result.rectification;
    assert_relative_eq!(
        rect.r2 * result.rotation * rect.r1.transpose(),
        nalgebra::Matrix3::identity(),
        epsilon = 1e-9
    );
    let baseline = rect.r2 * result.translation;
    assert!(baseline.x.abs() > 0.99 * baseline.norm());

    let archive = root.join("params").join("stereo_calib.npz");
    assert_eq!(result.archive, archive);
    let mut npz = NpzReader::new(File::open(&archive).unwrap()).unwrap();
    let shapes: [(&str, &[usize]); 11] = [
        ("mtxL", &[3, 3]),
        ("distL", &[5]),
        ("mtxR", &[3, 3]),
        ("distR", &[5]),
        ("R", &[3, 3]),
        ("T", &[3, 1]),
        ("R1", &[3, 3]),
        ("R2", &[3, 3]),
        ("P1", &[3, 4]),
        ("P2", &[3, 4]),
        ("Q", &[4, 4]),
    ];
    for (name, shape) in shapes {
        assert_eq!(npz_array(&mut npz, name).shape(), shape, "{}", name);
    }
    let t = npz_array(&mut npz, "T");
    assert_relative_eq!(t[[0, 0]], result.translation.x, epsilon = 1e-15);
    let mtx = npz_array(&mut npz, "mtxL");
    assert_relative_eq!(mtx[[0, 0]], left.fx, epsilon = 1e-15);
    assert_relative_eq!(mtx[[2, 2]], 1.0);

    let first = result
        .outcomes
        .iter()
        .find_map(|o| o.status.sample_index())
        .unwrap();
    assert_eq!(first, 0);
    assert!(root.join("render/stereo_left/left_img0.png").is_file());
    assert!(root.join("render/stereo_right/right_img0.png").is_file());
}

#[test]
fn test_no_usable_pairs_is_insufficient() {
    let root = scratch("blank");
    let config = CalibrationConfig::builder(pattern())
        .param_save_path(root.join("params"))
        .build()
        .unwrap();
    for side in [&config.subdirs.left, &config.subdirs.right] {
        let dir = root.join("input").join(side);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..3 {
            GrayImage::from_pixel(64, 48, Luma([90]))
                .save(dir.join(synthetic::image_name(i)))
                .unwrap();
        }
    }

    match stereo_calibration(&root.join("input"), &config) {
        Err(CalibrationError::InsufficientSamples { found, required }) => {
            assert_eq!(found, 0);
            assert_eq!(required, 3);
        }
        other => panic!("expected InsufficientSamples, got {:?}", other.map(|r| r.rms_error)),
    }
    assert!(!root.join("params").join("stereo_calib.npz").exists());
}

#[test]
fn test_empty_input_is_insufficient() {
    let root = scratch("empty");
    let config = CalibrationConfig::builder(pattern()).build().unwrap();
    std::fs::create_dir_all(root.join("stereo_left")).unwrap();
    std::fs::create_dir_all(root.join("stereo_right")).unwrap();
    let err = stereo_calibration(&root, &config).unwrap_err();
    assert!(matches!(
        err,
        CalibrationError::InsufficientSamples { found: 0, .. }
    ));
}

#[test]
fn test_identical_runs_are_deterministic() {
    let (root, config) = dataset("determinism", 6);
    let first = stereo_calibration(&root.join("input"), &config).unwrap();
    let second = stereo_calibration(&root.join("input"), &config).unwrap();
    assert_relative_eq!(first.rotation, second.rotation, epsilon = 1e-9);
    assert_relative_eq!(first.translation, second.translation, epsilon = 1e-9);
    assert_relative_eq!(
        first.cameras.left.camera_matrix(),
        second.cameras.left.camera_matrix(),
        epsilon = 1e-9
    );
    assert_relative_eq!(first.rectification.q, second.rectification.q, epsilon = 1e-9);
    assert_eq!(first.outcomes, second.outcomes);
}

#[test]
fn test_image_limit_takes_first_pairs_by_name() {
    let (root, config) = dataset("limit", 15);
    let input = root.join("input");

    let mut limited = config.clone();
    limited.image_limit = 10;
    let (samples, outcomes, _) = collect_samples(&input, &limited).unwrap();
    assert_eq!(outcomes.len(), 10);
    assert!(samples.len() <= 10);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.files.left, synthetic::image_name(i));
    }

    let mut generous = config;
    generous.image_limit = 20;
    let (_, outcomes, size) = collect_samples(&input, &generous).unwrap();
    assert_eq!(outcomes.len(), 15);
    assert_eq!(size.map(|s| (s.width, s.height)), Some((640, 480)));
}

#[test]
fn test_blank_right_image_drops_the_pair() {
    let (root, config) = dataset("drop", 4);
    let input = root.join("input");
    GrayImage::from_pixel(640, 480, Luma([128]))
        .save(input.join(&config.subdirs.right).join(synthetic::image_name(1)))
        .unwrap();

    let (samples, outcomes, _) = collect_samples(&input, &config).unwrap();
    assert_eq!(outcomes[1].status, SampleStatus::RejectedRight);
    assert_eq!(samples.left.len(), samples.right.len());
    assert!(outcomes
        .iter()
        .all(|o| o.status == SampleStatus::RejectedRight || o.status.sample_index().is_some()));

    // retained indices skip the dropped pair
    assert_eq!(outcomes[0].status, SampleStatus::Accepted { index: 0 });
    assert_eq!(outcomes[2].status, SampleStatus::Accepted { index: 1 });
    assert_eq!(samples.len(), 3);
}

#[test]
fn test_detected_corners_follow_object_point_order() {
    let (root, config) = dataset("order", 3);
    let (samples, outcomes, _) = collect_samples(&root.join("input"), &config).unwrap();
    let rig = SyntheticRig::default();
    let poses = board_poses(&pattern(), 3);

    for (pair, outcome) in outcomes.iter().enumerate() {
        let Some(index) = outcome.status.sample_index() else {
            continue;
        };
        let ideal = rig.project_corners(&pattern(), &poses[pair]).unwrap();
        for (detected, expected) in [
            (&samples.left[index], &ideal.left),
            (&samples.right[index], &ideal.right),
        ] {
            assert_eq!(detected.len(), 32);
            for (d, e) in detected.iter().zip(expected.iter()) {
                assert!((d - e).norm() < 0.5, "{:?} vs {:?}", d, e);
            }
        }
    }
    assert!(samples.len() >= 2);
    // board x axis maps to the image x axis
    let row = &samples.left[0];
    assert!(row[1].x > row[0].x);
    assert!(row[8].y > row[0].y);
}
