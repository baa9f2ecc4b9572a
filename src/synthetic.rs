//! Synthetic stereo rig and chessboard renderer.
//!
//! Images are rendered by inverse mapping: every pixel is sampled 2x2 times,
//! each sample is undistorted to a viewing ray and intersected with the board
//! plane.

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use log::info;
use nalgebra::{Matrix3, Point2, Vector2, Vector3};

use crate::calibration::{CalibrationError, ChessboardPattern, StereoPair};
use crate::camera::{Intrinsics, RadTanModel, Resolution};
use crate::geometry;
use crate::optimization::Pose;
use crate::util;

const BLACK: f64 = 30.0;
const WHITE: f64 = 225.0;
const BACKGROUND: f64 = 110.0;
/// White border around the squares, in squares.
const MARGIN: f64 = 0.5;
const SUPERSAMPLING: usize = 2;

/// Two cameras and the left-to-right transform `X_r = R X_l + T`.
#[derive(Debug, Clone)]
pub struct SyntheticRig {
    pub cameras: StereoPair<RadTanModel>,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for SyntheticRig {
    /// A 640x480 pair with a 10 cm horizontal baseline and mild barrel
    /// distortion.
    fn default() -> Self {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let left = RadTanModel {
            intrinsics: Intrinsics {
                fx: 600.0,
                fy: 600.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution,
            distortions: [-0.05, 0.0, 0.0, 0.0, 0.0],
        };
        let right = RadTanModel {
            intrinsics: Intrinsics {
                fx: 605.0,
                fy: 604.0,
                cx: 318.0,
                cy: 243.0,
            },
            resolution,
            distortions: [-0.04, 0.0, 0.0, 0.0, 0.0],
        };
        let rotation = geometry::rodrigues(&Vector3::new(0.005, -0.02, 0.003));
        // right camera center 10 cm along the left camera's x axis
        let translation = -(rotation * Vector3::new(0.1, 0.0, 0.0));
        SyntheticRig {
            cameras: StereoPair::new(left, right),
            rotation,
            translation,
        }
    }
}

impl SyntheticRig {
    /// Board-to-right-camera pose from a board-to-left-camera pose.
    pub fn right_pose(&self, left: &Pose) -> Pose {
        let r_left = geometry::rodrigues(&left.rvec);
        Pose {
            rvec: geometry::rotation_vector(&(self.rotation * r_left)),
            tvec: self.rotation * left.tvec + self.translation,
        }
    }

    /// Ideal corner pixels of `pattern` in both cameras.
    pub fn project_corners(
        &self,
        pattern: &ChessboardPattern,
        left_pose: &Pose,
    ) -> Result<StereoPair<Vec<Point2<f64>>>, CalibrationError> {
        let right_pose = self.right_pose(left_pose);
        let project = |camera: &RadTanModel, pose: &Pose| {
            pattern
                .object_points()
                .iter()
                .map(|p| {
                    let pixel = camera.project_unchecked(&pose.transform(p))?;
                    Ok(Point2::new(pixel.x, pixel.y))
                })
                .collect::<Result<Vec<_>, CalibrationError>>()
        };
        Ok(StereoPair::new(
            project(&self.cameras.left, left_pose)?,
            project(&self.cameras.right, &right_pose)?,
        ))
    }
}

/// `count` board-to-left-camera poses, tilted up to about 30 degrees and
/// placed so that both cameras of [`SyntheticRig::default`] see the whole
/// board.
pub fn board_poses(pattern: &ChessboardPattern, count: usize) -> Vec<Pose> {
    let center = Vector3::new(
        (pattern.cols - 1) as f64 * pattern.square_size / 2.0,
        (pattern.rows - 1) as f64 * pattern.square_size / 2.0,
        0.0,
    );
    // keeps the board about 270 px wide whatever its physical size
    let scale = (pattern.cols + 1) as f64 * pattern.square_size / 0.27;
    (0..count)
        .map(|i| {
            let t = i as f64;
            let rvec = Vector3::new(
                0.28 * (t * 1.7).sin(),
                0.42 * (t * 0.9 + 0.5).cos(),
                0.10 * (t * 1.3).sin(),
            );
            let rotation = geometry::rodrigues(&rvec);
            let target = Vector3::new(
                0.05 + 0.02 * (t * 1.1).cos(),
                0.015 * (t * 1.9).sin(),
                0.6 + 0.06 * (t * 0.7).sin(),
            ) * scale;
            Pose {
                rvec,
                tvec: target - rotation * center,
            }
        })
        .collect()
}

/// Viewing rays of every sub-pixel sample of one camera, `None` where the
/// undistortion fails.
struct RayGrid {
    width: u32,
    height: u32,
    rays: Vec<Option<Vector3<f64>>>,
}

impl RayGrid {
    fn new(camera: &RadTanModel) -> Self {
        let (width, height) = (camera.resolution.width, camera.resolution.height);
        let mut rays = Vec::with_capacity((width * height) as usize * SUPERSAMPLING * SUPERSAMPLING);
        for v in 0..height {
            for u in 0..width {
                for sy in 0..SUPERSAMPLING {
                    for sx in 0..SUPERSAMPLING {
                        let pixel = Vector2::new(
                            u as f64 + subsample_offset(sx),
                            v as f64 + subsample_offset(sy),
                        );
                        rays.push(
                            camera
                                .undistort_normalized(&pixel)
                                .ok()
                                .map(|n| Vector3::new(n.x, n.y, 1.0)),
                        );
                    }
                }
            }
        }
        RayGrid {
            width,
            height,
            rays,
        }
    }
}

fn subsample_offset(index: usize) -> f64 {
    (index as f64 + 0.5) / SUPERSAMPLING as f64 - 0.5
}

/// Intensity of the board plane at board coordinates `(x, y)`.
fn board_intensity(pattern: &ChessboardPattern, x: f64, y: f64) -> f64 {
    let s = pattern.square_size;
    let (i, j) = ((x / s).floor(), (y / s).floor());
    let (cols, rows) = (pattern.cols as f64, pattern.rows as f64);
    if i >= -1.0 && i < cols && j >= -1.0 && j < rows {
        if (i + j).rem_euclid(2.0) == 0.0 {
            BLACK
        } else {
            WHITE
        }
    } else if x >= -(1.0 + MARGIN) * s
        && x < (cols + MARGIN) * s
        && y >= -(1.0 + MARGIN) * s
        && y < (rows + MARGIN) * s
    {
        WHITE
    } else {
        BACKGROUND
    }
}

fn render_with_rays(grid: &RayGrid, pattern: &ChessboardPattern, pose: &Pose) -> GrayImage {
    let r_t = geometry::rodrigues(&pose.rvec).transpose();
    let origin = -(r_t * pose.tvec);
    let samples = SUPERSAMPLING * SUPERSAMPLING;

    GrayImage::from_fn(grid.width, grid.height, |u, v| {
        let first = ((v * grid.width + u) as usize) * samples;
        let sum: f64 = grid.rays[first..first + samples]
            .iter()
            .map(|ray| {
                let Some(ray) = ray else {
                    return BACKGROUND;
                };
                let dir = r_t * ray;
                if dir.z.abs() < 1e-12 {
                    return BACKGROUND;
                }
                let lambda = -origin.z / dir.z;
                if lambda <= 0.0 {
                    return BACKGROUND;
                }
                let hit = origin + dir * lambda;
                board_intensity(pattern, hit.x, hit.y)
            })
            .sum();
        Luma([(sum / samples as f64).round().clamp(0.0, 255.0) as u8])
    })
}

/// Renders the board seen by `camera` from `pose` (board to camera).
pub fn render_board(camera: &RadTanModel, pattern: &ChessboardPattern, pose: &Pose) -> GrayImage {
    render_with_rays(&RayGrid::new(camera), pattern, pose)
}

/// Renders an axis-aligned board without perspective: interior corner
/// `(r, c)` lies exactly at pixel `first_corner + square_px * (c, r)`.
pub fn render_fronto_parallel_board(
    pattern: &ChessboardPattern,
    width: u32,
    height: u32,
    square_px: u32,
    first_corner: (u32, u32),
) -> GrayImage {
    const N: usize = 4;
    let s = square_px as f64;
    let unit = ChessboardPattern {
        rows: pattern.rows,
        cols: pattern.cols,
        square_size: 1.0,
    };
    GrayImage::from_fn(width, height, |u, v| {
        let mut sum = 0.0;
        for sy in 0..N {
            for sx in 0..N {
                let x = u as f64 + (sx as f64 + 0.5) / N as f64 - 0.5 - first_corner.0 as f64;
                let y = v as f64 + (sy as f64 + 0.5) / N as f64 - 0.5 - first_corner.1 as f64;
                sum += board_intensity(&unit, x / s, y / s);
            }
        }
        Luma([(sum / (N * N) as f64).round() as u8])
    })
}

/// Names of the files written by [`write_dataset`].
pub fn image_name(index: usize) -> String {
    format!("img_{:03}.png", index)
}

/// Renders `count` pairs into `<root>/<subdirs.left>` and
/// `<root>/<subdirs.right>`.
pub fn write_dataset(
    root: &Path,
    subdirs: &StereoPair<String>,
    rig: &SyntheticRig,
    pattern: &ChessboardPattern,
    count: usize,
) -> Result<StereoPair<PathBuf>, CalibrationError> {
    let dirs = StereoPair::new(
        util::ensure_dir(&root.join(&subdirs.left))?,
        util::ensure_dir(&root.join(&subdirs.right))?,
    );
    let grids = StereoPair::new(
        RayGrid::new(&rig.cameras.left),
        RayGrid::new(&rig.cameras.right),
    );
    for (i, pose) in board_poses(pattern, count).iter().enumerate() {
        let right_pose = rig.right_pose(pose);
        render_with_rays(&grids.left, pattern, pose).save(dirs.left.join(image_name(i)))?;
        render_with_rays(&grids.right, pattern, &right_pose).save(dirs.right.join(image_name(i)))?;
    }
    info!("Wrote {} synthetic pairs under {}", count, root.display());
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pattern() -> ChessboardPattern {
        ChessboardPattern::new(4, 8, 0.03).unwrap()
    }

    #[test]
    fn test_right_pose_matches_rig_transform() {
        let rig = SyntheticRig::default();
        let pose = board_poses(&pattern(), 3)[2];
        let right = rig.right_pose(&pose);
        let p = Vector3::new(0.06, 0.03, 0.0);
        assert_relative_eq!(
            right.transform(&p),
            rig.rotation * pose.transform(&p) + rig.translation,
            epsilon = 1e-12
        );
        // right camera sits at +x of the left camera
        let center = -(rig.rotation.transpose() * rig.translation);
        assert_relative_eq!(center, Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_poses_keep_the_board_in_both_views() {
        let rig = SyntheticRig::default();
        let pattern = pattern();
        for pose in board_poses(&pattern, 15) {
            assert!(pose.rvec.norm() < 0.53);
            let corners = rig.project_corners(&pattern, &pose).unwrap();
            for p in corners.left.iter().chain(corners.right.iter()) {
                assert!(p.x > 20.0 && p.x < 620.0 && p.y > 20.0 && p.y < 460.0, "{:?}", p);
            }
        }
    }

    #[test]
    fn test_rendered_board_is_dark_at_first_square() {
        let rig = SyntheticRig::default();
        let pattern = pattern();
        let pose = board_poses(&pattern, 1)[0];
        let img = render_board(&rig.cameras.left, &pattern, &pose);
        assert_eq!(img.dimensions(), (640, 480));

        // middle of square (0, 0), which is black
        let inside = pose.transform(&Vector3::new(0.015, 0.015, 0.0));
        let pixel = rig.cameras.left.project_unchecked(&inside).unwrap();
        let value = img.get_pixel(pixel.x.round() as u32, pixel.y.round() as u32)[0];
        assert!(value < 60, "{}", value);
        assert_eq!(img.get_pixel(0, 0)[0], BACKGROUND as u8);
    }

    #[test]
    fn test_fronto_parallel_edges_are_half_gray() {
        let pattern = ChessboardPattern::new(2, 2, 1.0).unwrap();
        let img = render_fronto_parallel_board(&pattern, 100, 100, 20, (40, 40));
        // pixel center on the edge x = 40 between squares (-1, -1) and (0, -1)
        assert_eq!(img.get_pixel(40, 30)[0], ((BLACK + WHITE) / 2.0).round() as u8);
        assert_eq!(img.get_pixel(30, 30)[0], BLACK as u8);
        assert_eq!(img.get_pixel(50, 30)[0], WHITE as u8);
    }
}
