//! Stereo rectification (Bouguet's method) and rectification maps.
//!
//! [`stereo_rectify`] turns a calibrated rig into the rotations `R1`, `R2`
//! that make both image planes coplanar with horizontal (or, for a vertical
//! rig, vertical) epipolar lines, the new projection matrices `P1`, `P2`, the
//! disparity-to-depth matrix `Q` and the valid-pixel rectangle of each view.
//! [`RectifyMap`] then resamples raw frames into the rectified geometry.

use image::{GrayImage, Luma, Rgb, RgbImage};
use log::debug;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationError, StereoPair};
use crate::camera::rad_tan::RadTanModel;
use crate::camera::Resolution;
use crate::geometry;

/// Pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn intersect(&self, other: &Roi) -> Roi {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return Roi::default();
        }
        Roi {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

/// Output of [`stereo_rectify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationSet {
    /// Rotation from the left camera frame to the rectified left frame.
    pub r1: Matrix3<f64>,
    /// Rotation from the right camera frame to the rectified right frame.
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    /// Like `p1` with the scaled baseline `T'_x * f` (or `T'_y * f`) in the
    /// last column.
    pub p2: Matrix3x4<f64>,
    /// Maps `(u, v, disparity, 1)` to homogeneous left-rectified 3D points.
    pub q: Matrix4<f64>,
    pub roi: StereoPair<Roi>,
    /// `true` when the baseline is mostly vertical.
    pub vertical: bool,
}

impl RectificationSet {
    /// Rectification maps for both cameras at their native resolution.
    pub fn maps(&self, left: &RadTanModel, right: &RadTanModel) -> StereoPair<RectifyMap> {
        StereoPair {
            left: RectifyMap::new(left, &self.r1, &self.p1, left.resolution),
            right: RectifyMap::new(right, &self.r2, &self.p2, right.resolution),
        }
    }
}

/// Inscribed and bounding rectangles of the rectified image border, sampled
/// on a 9x9 grid over the source image.
fn rectified_border(
    camera: &RadTanModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    size: &Resolution,
) -> Result<([f64; 4], [f64; 4]), CalibrationError> {
    const N: usize = 9;
    let (fx, fy) = (projection[(0, 0)], projection[(1, 1)]);
    let (cx, cy) = (projection[(0, 2)], projection[(1, 2)]);

    let (mut ix0, mut ix1, mut iy0, mut iy1) = (f64::MIN, f64::MAX, f64::MIN, f64::MAX);
    let (mut ox0, mut ox1, mut oy0, mut oy1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for y in 0..N {
        for x in 0..N {
            let pixel = Vector2::new(
                x as f64 * size.width as f64 / (N - 1) as f64,
                y as f64 * size.height as f64 / (N - 1) as f64,
            );
            let n = camera.undistort_normalized(&pixel)?;
            let ray = rotation * Vector3::new(n.x, n.y, 1.0);
            let p = Vector2::new(fx * ray.x / ray.z + cx, fy * ray.y / ray.z + cy);

            ox0 = ox0.min(p.x);
            ox1 = ox1.max(p.x);
            oy0 = oy0.min(p.y);
            oy1 = oy1.max(p.y);
            if x == 0 {
                ix0 = ix0.max(p.x);
            }
            if x == N - 1 {
                ix1 = ix1.min(p.x);
            }
            if y == 0 {
                iy0 = iy0.max(p.y);
            }
            if y == N - 1 {
                iy1 = iy1.min(p.y);
            }
        }
    }
    Ok((
        [ix0, iy0, ix1 - ix0, iy1 - iy0],
        [ox0, oy0, ox1 - ox0, oy1 - oy0],
    ))
}

/// Computes the rectification of a calibrated stereo pair.
///
/// The relative rotation is split evenly between the two cameras, then both
/// are rotated so the baseline becomes parallel to the image x axis (y axis
/// when the baseline is mostly vertical). Both views share one focal length,
/// the mean of the input focal lengths orthogonal to the baseline, and one
/// principal point, so corresponding points have zero disparity at infinity.
///
/// # Arguments
///
/// * `left`, `right` - Calibrated cameras; the left resolution is the image
///   size of the rectified views.
/// * `rotation`, `translation` - Left-to-right transform (`X_r = R X_l + T`).
/// * `alpha` - `None` keeps the natural scale. `Some(a)` with `a` in `[0, 1]`
///   scales between showing only valid pixels (`0`) and keeping every source
///   pixel (`1`).
///
/// # Errors
///
/// [`CalibrationError::Numerical`] for a zero baseline or when the border
/// points cannot be undistorted.
pub fn stereo_rectify(
    left: &RadTanModel,
    right: &RadTanModel,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    alpha: Option<f64>,
) -> Result<RectificationSet, CalibrationError> {
    let size = left.resolution;
    if size.width == 0 || size.height == 0 {
        return Err(CalibrationError::InvalidConfig(
            "image size must not be empty".to_string(),
        ));
    }
    let baseline = translation.norm();
    if !(baseline > f64::EPSILON) {
        return Err(CalibrationError::Numerical(
            "cannot rectify a rig with zero baseline".to_string(),
        ));
    }

    let om = geometry::rotation_vector(rotation);
    let r_half = geometry::rodrigues(&(om * -0.5));
    let t = r_half * translation;

    // align the baseline with the x axis (horizontal rig) or the y axis
    let idx = if t.x.abs() > t.y.abs() { 0 } else { 1 };
    let c = t[idx];
    let mut uu = Vector3::zeros();
    uu[idx] = if c > 0.0 { 1.0 } else { -1.0 };
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (c.abs() / baseline).clamp(-1.0, 1.0).acos() / nw;
    }
    let w_r = geometry::rodrigues(&ww);

    let r1 = w_r * r_half.transpose();
    let r2 = w_r * r_half;
    let t_new = r2 * translation;

    let other = idx ^ 1;
    let mut fc_new =
        0.5 * (left.camera_matrix()[(other, other)] + right.camera_matrix()[(other, other)]);

    // principal points that keep the image corners centered after rectification
    let (nx, ny) = (size.width as f64, size.height as f64);
    let mut cc_new = [Vector2::zeros(); 2];
    for (k, (camera, rect)) in [(left, &r1), (right, &r2)].into_iter().enumerate() {
        let mut avg = Vector2::zeros();
        for i in 0..4 {
            let corner = Vector2::new((i % 2) as f64 * nx, (i / 2) as f64 * ny);
            let n = camera.undistort_normalized(&corner)?;
            let ray = rect * Vector3::new(n.x, n.y, 1.0);
            avg += Vector2::new(fc_new * ray.x / ray.z, fc_new * ray.y / ray.z);
        }
        avg /= 4.0;
        cc_new[k] = Vector2::new((nx - 1.0) / 2.0 - avg.x, (ny - 1.0) / 2.0 - avg.y);
    }
    let shared = (cc_new[0] + cc_new[1]) * 0.5;
    cc_new = [shared, shared];

    let projection = |cc: &Vector2<f64>, f: f64, shift: f64| {
        let mut p = Matrix3x4::zeros();
        p[(0, 0)] = f;
        p[(1, 1)] = f;
        p[(0, 2)] = cc.x;
        p[(1, 2)] = cc.y;
        p[(2, 2)] = 1.0;
        p[(idx, 3)] = shift;
        p
    };
    let mut p1 = projection(&cc_new[0], fc_new, 0.0);
    let mut p2 = projection(&cc_new[1], fc_new, t_new[idx] * fc_new);

    let (inner1, outer1) = rectified_border(left, &r1, &p1, &size)?;
    let (inner2, outer2) = rectified_border(right, &r2, &p2, &size)?;

    let mut s = 1.0;
    if let Some(alpha) = alpha.filter(|a| *a >= 0.0) {
        let alpha = alpha.min(1.0);
        let ratios = |rect: &[f64; 4], cc: &Vector2<f64>| {
            [
                cc.x / (cc.x - rect[0]),
                cc.y / (cc.y - rect[1]),
                (nx - 1.0 - cc.x) / (rect[0] + rect[2] - cc.x),
                (ny - 1.0 - cc.y) / (rect[1] + rect[3] - cc.y),
            ]
        };
        let s0 = ratios(&inner1, &cc_new[0])
            .into_iter()
            .chain(ratios(&inner2, &cc_new[1]))
            .fold(f64::MIN, f64::max);
        let s1 = ratios(&outer1, &cc_new[0])
            .into_iter()
            .chain(ratios(&outer2, &cc_new[1]))
            .fold(f64::MAX, f64::min);
        s = s0 * (1.0 - alpha) + s1 * alpha;
        if !s.is_finite() || s <= 0.0 {
            return Err(CalibrationError::Numerical(format!(
                "invalid rectification scale {}",
                s
            )));
        }
    }

    fc_new *= s;
    for p in [&mut p1, &mut p2] {
        p[(0, 0)] = fc_new;
        p[(1, 1)] = fc_new;
    }
    p2[(idx, 3)] *= s;

    let image = Roi {
        x: 0,
        y: 0,
        width: size.width as i32,
        height: size.height as i32,
    };
    let roi_of = |inner: &[f64; 4], cc: &Vector2<f64>| {
        Roi {
            x: ((inner[0] - cc.x) * s + cc.x).ceil() as i32,
            y: ((inner[1] - cc.y) * s + cc.y).ceil() as i32,
            width: (inner[2] * s).floor() as i32,
            height: (inner[3] * s).floor() as i32,
        }
        .intersect(&image)
    };
    let roi = StereoPair {
        left: roi_of(&inner1, &cc_new[0]),
        right: roi_of(&inner2, &cc_new[1]),
    };

    let tx = t_new[idx];
    let cc_diff = if idx == 0 {
        cc_new[0].x - cc_new[1].x
    } else {
        cc_new[0].y - cc_new[1].y
    };
    #[rustfmt::skip]
    let q = Matrix4::new(
        1.0, 0.0, 0.0, -cc_new[0].x,
        0.0, 1.0, 0.0, -cc_new[0].y,
        0.0, 0.0, 0.0, fc_new,
        0.0, 0.0, -1.0 / tx, cc_diff / tx,
    );

    debug!(
        "Rectified focal length {:.3}, principal point ({:.3}, {:.3}), rois {:?}",
        fc_new, cc_new[0].x, cc_new[0].y, roi
    );

    Ok(RectificationSet {
        r1,
        r2,
        p1,
        p2,
        q,
        roi,
        vertical: idx == 1,
    })
}

/// Per-pixel source coordinates of a rectified view.
///
/// Built by inverse mapping: every rectified pixel is turned into a ray with
/// the new projection, rotated back into the camera frame, distorted and
/// projected with the original camera.
#[derive(Debug, Clone)]
pub struct RectifyMap {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RectifyMap {
    pub fn new(
        camera: &RadTanModel,
        rectification: &Matrix3<f64>,
        projection: &Matrix3x4<f64>,
        size: Resolution,
    ) -> Self {
        let (fx, fy) = (projection[(0, 0)], projection[(1, 1)]);
        let (cx, cy) = (projection[(0, 2)], projection[(1, 2)]);
        let inverse = rectification.transpose();
        let len = size.width as usize * size.height as usize;
        let mut map_x = Vec::with_capacity(len);
        let mut map_y = Vec::with_capacity(len);

        for v in 0..size.height {
            for u in 0..size.width {
                let ray = inverse
                    * Vector3::new((u as f64 - cx) / fx, (v as f64 - cy) / fy, 1.0);
                if ray.z <= f64::EPSILON {
                    map_x.push(-1.0);
                    map_y.push(-1.0);
                    continue;
                }
                let src = camera.project_normalized(ray.x / ray.z, ray.y / ray.z);
                map_x.push(src.x as f32);
                map_y.push(src.y as f32);
            }
        }

        RectifyMap {
            width: size.width,
            height: size.height,
            map_x,
            map_y,
        }
    }

    /// Source pixel of rectified pixel `(u, v)`.
    pub fn source(&self, u: u32, v: u32) -> Option<(f32, f32)> {
        if u >= self.width || v >= self.height {
            return None;
        }
        let i = v as usize * self.width as usize + u as usize;
        Some((self.map_x[i], self.map_y[i]))
    }

    pub fn remap_gray(&self, src: &GrayImage) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |u, v| {
            let value = self
                .source(u, v)
                .and_then(|(x, y)| bilinear(src.width(), src.height(), x, y, |px, py| {
                    [src.get_pixel(px, py)[0] as f32; 3]
                }))
                .map(|c| c[0])
                .unwrap_or(0.0);
            Luma([value.round().clamp(0.0, 255.0) as u8])
        })
    }

    pub fn remap_rgb(&self, src: &RgbImage) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |u, v| {
            let value = self
                .source(u, v)
                .and_then(|(x, y)| bilinear(src.width(), src.height(), x, y, |px, py| {
                    let p = src.get_pixel(px, py);
                    [p[0] as f32, p[1] as f32, p[2] as f32]
                }))
                .unwrap_or([0.0; 3]);
            Rgb(value.map(|c| c.round().clamp(0.0, 255.0) as u8))
        })
    }
}

/// Bilinear interpolation of up to three channels; `None` outside the image.
fn bilinear<F>(width: u32, height: u32, x: f32, y: f32, fetch: F) -> Option<[f32; 3]>
where
    F: Fn(u32, u32) -> [f32; 3],
{
    if width == 0 || height == 0 {
        return None;
    }
    if !(x >= 0.0 && y >= 0.0 && x <= (width - 1) as f32 && y <= (height - 1) as f32) {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let (ax, ay) = (x - x0 as f32, y - y0 as f32);

    let (p00, p10, p01, p11) = (fetch(x0, y0), fetch(x1, y0), fetch(x0, y1), fetch(x1, y1));
    let mut out = [0.0; 3];
    for c in 0..3 {
        let top = p00[c] * (1.0 - ax) + p10[c] * ax;
        let bottom = p01[c] * (1.0 - ax) + p11[c] * ax;
        out[c] = top * (1.0 - ay) + bottom * ay;
    }
    Some(out)
}
