//! Chessboard interior-corner detection.
//!
//! ChESS corner responses from `chess-corners` are assembled into a labelled
//! grid by `calib_targets::detect::detect_chessboard`. On top of that this
//! module keeps only complete `cols x rows` boards, fixes the corner order and
//! refines every corner with [`corner_subpix`].
//!
//! The returned corners follow a deterministic order: row by row, with the
//! row direction pointing right (down for near-vertical rows) in the image
//! and the column direction completing a right-handed frame.

use std::collections::HashMap;

use calib_targets::chessboard::ChessboardDetectionResult;
use calib_targets::{detect, ChessboardParams};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::contrast::adaptive_threshold;
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use imageproc::gradients::{horizontal_scharr, vertical_scharr};
use imageproc::stats::percentile;
use log::debug;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use super::pattern::ChessboardPattern;
use crate::optimization::TermCriteria;

/// Detection switches, named after their OpenCV counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFlags {
    /// Retry a frame whose board was not found on a locally thresholded copy.
    pub adaptive_threshold: bool,
    /// Stretch the gray levels between the 1st and 99th percentile.
    pub normalize_image: bool,
}

impl Default for DetectionFlags {
    fn default() -> Self {
        DetectionFlags {
            adaptive_threshold: true,
            normalize_image: true,
        }
    }
}

/// Sub-pixel refinement settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPixConfig {
    /// Half size of the search window; `(11, 11)` is a 23x23 window.
    pub window: (usize, usize),
    /// Half size of the dead zone in the middle of the window, `(-1, -1)`
    /// for none.
    pub zero_zone: (i32, i32),
    pub criteria: TermCriteria,
}

impl Default for SubPixConfig {
    fn default() -> Self {
        SubPixConfig {
            window: (11, 11),
            zero_zone: (-1, -1),
            criteria: TermCriteria::new(30, 0.001),
        }
    }
}

/// Block radius of the local threshold, relative to the shorter image side.
const THRESHOLD_BLOCK_DIVISOR: u32 = 16;
const CORNER_RADIUS: i32 = 4;

type Gradient = ImageBuffer<Luma<i16>, Vec<i16>>;

/// Linear stretch of the 1st..99th percentile to `0..255`. Flat images are
/// returned unchanged.
pub fn normalized(gray: &GrayImage) -> GrayImage {
    if gray.width() == 0 || gray.height() == 0 {
        return gray.clone();
    }
    let lo = percentile(gray, 1) as f32;
    let hi = percentile(gray, 99) as f32;
    if hi - lo < 1.0 {
        return gray.clone();
    }
    let scale = 255.0 / (hi - lo);
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = ((pixel.0[0] as f32 - lo) * scale).round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn board_params(pattern: &ChessboardPattern) -> ChessboardParams {
    ChessboardParams {
        expected_rows: Some(pattern.rows as u32),
        expected_cols: Some(pattern.cols as u32),
        ..ChessboardParams::default()
    }
}

/// Grid-labelled corners of a detection, keyed by `(i, j)`.
fn labelled_corners(detection: ChessboardDetectionResult) -> HashMap<(i32, i32), Point2<f64>> {
    detection
        .detection
        .corners
        .into_iter()
        .filter_map(|corner| {
            let grid = corner.grid?;
            Some((
                (grid.i as i32, grid.j as i32),
                Point2::new(corner.position.x as f64, corner.position.y as f64),
            ))
        })
        .collect()
}

/// Orders a complete lattice into the row-major corner list of `pattern`,
/// or `None` if the lattice is not exactly `cols x rows`.
fn order_lattice(
    grid: &HashMap<(i32, i32), Point2<f64>>,
    pattern: &ChessboardPattern,
) -> Option<Vec<Point2<f64>>> {
    let min_i = grid.keys().map(|k| k.0).min()?;
    let max_i = grid.keys().map(|k| k.0).max()?;
    let min_j = grid.keys().map(|k| k.1).min()?;
    let max_j = grid.keys().map(|k| k.1).max()?;
    let width = (max_i - min_i + 1) as usize;
    let height = (max_j - min_j + 1) as usize;
    if grid.len() != width * height {
        return None;
    }

    // rows[j][i]
    let mut rows = (0..height)
        .map(|j| {
            (0..width)
                .map(|i| grid.get(&(min_i + i as i32, min_j + j as i32)).copied())
                .collect::<Option<Vec<_>>>()
        })
        .collect::<Option<Vec<_>>>()?;
    let transpose = |rows: &Vec<Vec<Point2<f64>>>| -> Vec<Vec<Point2<f64>>> {
        (0..rows[0].len())
            .map(|i| rows.iter().map(|row| row[i]).collect())
            .collect()
    };
    let mean_step = |rows: &Vec<Vec<Point2<f64>>>| -> Vector2<f64> {
        let mut sum = Vector2::zeros();
        for row in rows {
            sum += row[row.len() - 1] - row[0];
        }
        sum
    };

    let (cols, n_rows) = (pattern.cols, pattern.rows);
    if width == cols && height == n_rows {
        if cols == n_rows {
            // square lattice, rows run along the more horizontal axis
            let u = mean_step(&rows);
            let t = transpose(&rows);
            let v = mean_step(&t);
            if (v.x.abs() / v.norm()) > (u.x.abs() / u.norm()) {
                rows = t;
            }
        }
    } else if width == n_rows && height == cols {
        rows = transpose(&rows);
    } else {
        return None;
    }

    let u = mean_step(&rows);
    let flip_rows = if u.x.abs() >= u.y.abs() { u.x < 0.0 } else { u.y < 0.0 };
    if flip_rows {
        rows.iter_mut().for_each(|row| row.reverse());
    }
    let u = mean_step(&rows);
    let v = rows[rows.len() - 1][0] - rows[0][0];
    if u.x * v.y - u.y * v.x < 0.0 {
        rows.reverse();
    }
    Some(rows.into_iter().flatten().collect())
}

/// One detector pass over `image`.
fn detect_board(image: &GrayImage, pattern: &ChessboardPattern) -> Option<Vec<Point2<f64>>> {
    let detection =
        detect::detect_chessboard(image, &detect::default_chess_config(), board_params(pattern))?;
    let grid = labelled_corners(detection);
    debug!(
        "{} labelled corners for a {}x{} board",
        grid.len(),
        pattern.cols,
        pattern.rows
    );
    if grid.len() != pattern.corner_count() {
        return None;
    }
    order_lattice(&grid, pattern)
}

/// Finds the interior corners of `pattern` without sub-pixel refinement.
///
/// # Return Value
///
/// `Some(corners)` with exactly `rows * cols` pixel positions in the order
/// described in the module documentation, `None` if the full board is not
/// visible.
pub fn find_chessboard_corners(
    gray: &GrayImage,
    pattern: &ChessboardPattern,
    flags: &DetectionFlags,
) -> Option<Vec<Point2<f64>>> {
    let image = prepare_image(gray, flags);
    find_corners_prepared(&image, pattern, flags)
}

fn prepare_image(gray: &GrayImage, flags: &DetectionFlags) -> GrayImage {
    if flags.normalize_image {
        normalized(gray)
    } else {
        gray.clone()
    }
}

fn find_corners_prepared(
    image: &GrayImage,
    pattern: &ChessboardPattern,
    flags: &DetectionFlags,
) -> Option<Vec<Point2<f64>>> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    detect_board(image, pattern).or_else(|| {
        if !flags.adaptive_threshold {
            return None;
        }
        let block_radius = (image.width().min(image.height()) / THRESHOLD_BLOCK_DIVISOR).max(4);
        debug!("retrying with a local threshold, block radius {}", block_radius);
        detect_board(&adaptive_threshold(image, block_radius), pattern)
    })
}

/// Bilinear sample with the coordinates clamped to the image.
fn sample(img: &Gradient, x: f64, y: f64) -> f64 {
    let (w, h) = img.dimensions();
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let (ax, ay) = (x - x0 as f64, y - y0 as f64);
    let at = |x: u32, y: u32| img.get_pixel(x, y).0[0] as f64;
    let top = at(x0, y0) * (1.0 - ax) + at(x1, y0) * ax;
    let bottom = at(x0, y1) * (1.0 - ax) + at(x1, y1) * ax;
    top * (1.0 - ay) + bottom * ay
}

/// Refines corner positions to sub-pixel accuracy by the
/// gradient-orthogonality iteration.
///
/// For the true corner `q`, the image gradient `g_i` at every nearby pixel
/// `p_i` is orthogonal to `q - p_i`. Each iteration solves the weighted least
/// squares problem `sum w_i (g_i^T (q - p_i))^2` over the window for `q`.
/// Gradients are Scharr responses, sampled bilinearly at `p_i`.
pub fn corner_subpix(image: &GrayImage, corners: &mut [Point2<f64>], config: &SubPixConfig) {
    let (wx, wy) = (config.window.0 as i32, config.window.1 as i32);
    if wx < 1 || wy < 1 || image.width() < 3 || image.height() < 3 {
        return;
    }
    let gx = horizontal_scharr(image);
    let gy = vertical_scharr(image);
    let (zx, zy) = config.zero_zone;
    let max_iter = config.criteria.max_iter.max(1);
    let eps2 = config.criteria.epsilon * config.criteria.epsilon;

    // Gaussian-like weights over the window
    let mut weights = Vec::with_capacity(((2 * wx + 1) * (2 * wy + 1)) as usize);
    for dy in -wy..=wy {
        for dx in -wx..=wx {
            let in_zero_zone = zx >= 0 && zy >= 0 && dx.abs() <= zx && dy.abs() <= zy;
            let w = if in_zero_zone {
                0.0
            } else {
                let (nx, ny) = (dx as f64 / wx as f64, dy as f64 / wy as f64);
                (-(nx * nx) - ny * ny).exp()
            };
            weights.push(w);
        }
    }

    for corner in corners.iter_mut() {
        let start = *corner;
        let mut current = start;
        for _ in 0..max_iter {
            let (mut a, mut b, mut c, mut bb1, mut bb2) = (0.0, 0.0, 0.0, 0.0, 0.0);
            let mut k = 0;
            for dy in -wy..=wy {
                for dx in -wx..=wx {
                    let m = weights[k];
                    k += 1;
                    if m == 0.0 {
                        continue;
                    }
                    let px = current.x + dx as f64;
                    let py = current.y + dy as f64;
                    let gxv = sample(&gx, px, py);
                    let gyv = sample(&gy, px, py);
                    let gxx = gxv * gxv * m;
                    let gxy = gxv * gyv * m;
                    let gyy = gyv * gyv * m;
                    a += gxx;
                    b += gxy;
                    c += gyy;
                    bb1 += gxx * dx as f64 + gxy * dy as f64;
                    bb2 += gxy * dx as f64 + gyy * dy as f64;
                }
            }
            let det = a * c - b * b;
            if det.abs() <= f64::EPSILON * f64::EPSILON {
                break;
            }
            let scale = 1.0 / det;
            let next = Point2::new(
                current.x + c * scale * bb1 - b * scale * bb2,
                current.y - b * scale * bb1 + a * scale * bb2,
            );
            let moved = (next - current).norm_squared();
            current = next;
            if moved <= eps2 {
                break;
            }
        }
        // a corner that ran out of its window keeps the initial estimate
        if (current.x - start.x).abs() <= wx as f64 && (current.y - start.y).abs() <= wy as f64 {
            *corner = current;
        }
    }
}

/// Chessboard detector bound to one pattern and one set of settings.
#[derive(Debug, Clone)]
pub struct ChessboardDetector {
    pattern: ChessboardPattern,
    flags: DetectionFlags,
    subpix: SubPixConfig,
}

impl ChessboardDetector {
    pub fn new(pattern: ChessboardPattern, flags: DetectionFlags, subpix: SubPixConfig) -> Self {
        ChessboardDetector {
            pattern,
            flags,
            subpix,
        }
    }

    pub fn pattern(&self) -> &ChessboardPattern {
        &self.pattern
    }

    /// Detects and refines the board corners of one frame.
    pub fn detect(&self, gray: &GrayImage) -> Option<Vec<Point2<f64>>> {
        let image = prepare_image(gray, &self.flags);
        let mut corners = find_corners_prepared(&image, &self.pattern, &self.flags)?;
        corner_subpix(&image, &mut corners, &self.subpix);
        Some(corners)
    }
}

const ROW_COLORS: [[u8; 3]; 7] = [
    [255, 0, 0],
    [255, 128, 0],
    [200, 200, 0],
    [0, 255, 0],
    [0, 200, 200],
    [0, 0, 255],
    [255, 0, 255],
];

/// Draws the detected corners onto `img`: a circle per corner, each row in
/// its own color, consecutive corners joined by lines.
pub fn draw_chessboard_corners(img: &mut RgbImage, pattern: &ChessboardPattern, corners: &[Point2<f64>]) {
    let mut previous: Option<Point2<f64>> = None;
    for (k, corner) in corners.iter().enumerate() {
        let color = Rgb(ROW_COLORS[(k / pattern.cols.max(1)) % ROW_COLORS.len()]);
        if let Some(prev) = previous {
            draw_line_segment_mut(
                img,
                (prev.x as f32, prev.y as f32),
                (corner.x as f32, corner.y as f32),
                color,
            );
        }
        draw_hollow_circle_mut(
            img,
            (corner.x.round() as i32, corner.y.round() as i32),
            CORNER_RADIUS,
            color,
        );
        previous = Some(*corner);
    }
}
