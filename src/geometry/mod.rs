//! Small geometric building blocks shared by the calibrators and the
//! rectification solver.
//!
//! Rotations are exchanged as angle-axis vectors (`rvec`, the direction is the
//! axis and the norm the angle in radians) because that is the minimal
//! parameterization the Levenberg-Marquardt problems optimize over.

use nalgebra::{DMatrix, Matrix3, Point2, RealField, Rotation3, Vector3};

/// Rotation matrix of an angle-axis vector.
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*rvec).into_inner()
}

/// Angle-axis vector of a (nearly) orthonormal matrix.
///
/// The input is projected onto SO(3) first, so matrices that drifted slightly
/// away from orthonormality (e.g. after a linear solve) are accepted.
pub fn rotation_vector(rotation: &Matrix3<f64>) -> Vector3<f64> {
    let svd = rotation.svd(true, true);
    let projected = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut r = u * v_t;
            if r.determinant() < 0.0 {
                r = -r;
            }
            r
        }
        _ => *rotation,
    };
    Rotation3::from_matrix_unchecked(projected).scaled_axis()
}

/// Rotates `point` by the angle-axis vector `rvec`.
///
/// Generic over [`RealField`] so it can be evaluated on dual numbers inside
/// `tiny_solver` factors. Near the identity the first-order expansion
/// `p + r x p` is used, which keeps the derivatives finite at exactly zero
/// rotation.
pub fn rotate_point<T: RealField>(rvec: [T; 3], point: [T; 3]) -> [T; 3] {
    let [rx, ry, rz] = rvec;
    let [px, py, pz] = point;
    let theta2 = rx.clone() * rx.clone() + ry.clone() * ry.clone() + rz.clone() * rz.clone();

    // r x p
    let cx = ry.clone() * pz.clone() - rz.clone() * py.clone();
    let cy = rz.clone() * px.clone() - rx.clone() * pz.clone();
    let cz = rx.clone() * py.clone() - ry.clone() * px.clone();

    if theta2 < nalgebra::convert::<f64, T>(1e-14) {
        return [px + cx, py + cy, pz + cz];
    }

    let theta = theta2.clone().sqrt();
    let (sin, cos) = (theta.clone().sin(), theta.clone().cos());
    let one = T::one();
    // rotation with k = r / theta, written without an explicit division of r
    let a = sin / theta.clone();
    let b = (one - cos.clone()) / theta2;
    let dot = rx.clone() * px.clone() + ry.clone() * py.clone() + rz.clone() * pz.clone();

    [
        px * cos.clone() + cx * a.clone() + rx * dot.clone() * b.clone(),
        py * cos.clone() + cy * a.clone() + ry * dot.clone() * b.clone(),
        pz * cos + cz * a + rz * dot * b,
    ]
}

/// Cross-product matrix `[t]x`, so that `skew(t) * v == t.cross(&v)`.
pub fn skew(t: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0)
}

/// Median of a slice, `None` when it is empty. The slice is reordered.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some(0.5 * (values[mid - 1] + values[mid]))
    } else {
        Some(values[mid])
    }
}

/// Hartley normalization: translate to the centroid and scale so the mean
/// distance to it is `sqrt(2)`.
///
/// Returns the normalized points and the similarity `T` with
/// `normalized = T * original` (homogeneous).
pub fn normalize_points(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    if points.is_empty() {
        return (Vec::new(), Matrix3::identity());
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -mean_x * scale,
        0.0,
        scale,
        -mean_y * scale,
        0.0,
        0.0,
        1.0,
    );
    (normalized, t)
}

/// Right null vector of `a`: the right singular vector of the smallest
/// singular value.
pub fn null_vector(a: &DMatrix<f64>) -> Option<Vec<f64>> {
    // thin SVD only yields min(rows, cols) right vectors
    let a = if a.nrows() < a.ncols() {
        a.clone().resize_vertically(a.ncols(), 0.0)
    } else {
        a.clone()
    };
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(v_t.row(idx).iter().copied().collect())
}

/// Planar homography `dst ~ H * src` from at least four correspondences,
/// estimated with the normalized direct linear transform.
///
/// The result is scaled so that `H[(2, 2)] == 1` whenever that entry is not
/// vanishing. Returns `None` for degenerate input.
pub fn find_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }

    let (src_n, ts) = normalize_points(src);
    let (dst_n, td) = normalize_points(dst);
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = null_vector(&a)?;
    let hn = Matrix3::from_row_slice(&h);
    let mut h = td.try_inverse()? * hn * ts;
    if h[(2, 2)].abs() > 1e-12 {
        h /= h[(2, 2)];
    }
    if h.iter().all(|v| v.is_finite()) {
        Some(h)
    } else {
        None
    }
}

/// Applies the homography `h` to `p`.
pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-15 {
        return None;
    }
    Some(Point2::new(q.x / q.z, q.y / q.z))
}
