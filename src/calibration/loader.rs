//! Image-pair loader.
//!
//! Pairs are formed by position: the i-th PNG of the left directory (sorted by
//! name) goes with the i-th PNG of the right directory.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, RgbImage};
use log::debug;

use super::{CalibrationError, StereoPair};
use crate::camera::Resolution;

/// File locations of one left/right pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePairPaths {
    pub paths: StereoPair<PathBuf>,
    pub names: StereoPair<String>,
}

/// A decoded pair, in color for rendering and in gray for detection.
#[derive(Debug, Clone)]
pub struct LoadedPair {
    pub names: StereoPair<String>,
    pub rgb: StereoPair<RgbImage>,
    pub gray: StereoPair<GrayImage>,
    pub size: Resolution,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Sorted `*.png` files (any case of the extension) directly inside `dir`.
///
/// # Errors
///
/// [`CalibrationError::MissingDirectory`] if `dir` is not a directory.
pub fn list_png_files(dir: &Path) -> Result<Vec<PathBuf>, CalibrationError> {
    if !dir.is_dir() {
        return Err(CalibrationError::MissingDirectory(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("png"))
            .unwrap_or(false);
        if is_png && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by_key(|p| file_name(p));
    Ok(files)
}

/// Lists the image pairs under `root`, at most `limit` of them.
///
/// # Errors
///
/// * [`CalibrationError::MissingDirectory`] if a camera directory is missing.
/// * [`CalibrationError::PairCountMismatch`] if the two sides keep a different
///   number of files after truncation.
/// * [`CalibrationError::PairNameMismatch`] for the first pair whose names
///   differ, when `require_matching_names` is set.
pub fn list_image_pairs(
    root: &Path,
    subdirs: &StereoPair<String>,
    limit: usize,
    require_matching_names: bool,
) -> Result<Vec<ImagePairPaths>, CalibrationError> {
    let mut left = list_png_files(&root.join(&subdirs.left))?;
    let mut right = list_png_files(&root.join(&subdirs.right))?;
    debug!(
        "{} left and {} right images before the limit of {}",
        left.len(),
        right.len(),
        limit
    );
    left.truncate(limit);
    right.truncate(limit);

    if left.len() != right.len() {
        return Err(CalibrationError::PairCountMismatch {
            left: left.len(),
            right: right.len(),
        });
    }

    left.into_iter()
        .zip(right)
        .enumerate()
        .map(|(index, (left, right))| {
            let names = StereoPair::new(file_name(&left), file_name(&right));
            if require_matching_names && names.left != names.right {
                return Err(CalibrationError::PairNameMismatch {
                    index,
                    left: names.left,
                    right: names.right,
                });
            }
            Ok(ImagePairPaths {
                paths: StereoPair::new(left, right),
                names,
            })
        })
        .collect()
}

/// Decodes one pair.
///
/// Both frames must have the size of `expected` when given, and always the
/// same size as each other.
pub fn load_pair(
    pair: &ImagePairPaths,
    expected: Option<Resolution>,
) -> Result<LoadedPair, CalibrationError> {
    let left = image::open(&pair.paths.left)?;
    let right = image::open(&pair.paths.right)?;

    let left_size = Resolution {
        width: left.width(),
        height: left.height(),
    };
    let expected = expected.unwrap_or(left_size);
    for (path, frame) in [(&pair.paths.left, &left), (&pair.paths.right, &right)] {
        let found = Resolution {
            width: frame.width(),
            height: frame.height(),
        };
        if found != expected {
            return Err(CalibrationError::ImageSizeMismatch {
                file: path.clone(),
                found,
                expected,
            });
        }
    }

    Ok(LoadedPair {
        names: pair.names.clone(),
        gray: StereoPair::new(left.to_luma8(), right.to_luma8()),
        rgb: StereoPair::new(left.to_rgb8(), right.to_rgb8()),
        size: expected,
    })
}
