//! Planar chessboard target description.

use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::CalibrationError;

/// A chessboard described by its interior corners.
///
/// `cols` counts the corners along one row (board x axis), `rows` the number
/// of such rows (board y axis). A board with 9x5 squares has `cols = 8` and
/// `rows = 4`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChessboardPattern {
    pub rows: usize,
    pub cols: usize,
    /// Edge length of one square, in the unit the translation is reported in.
    pub square_size: f64,
}

impl ChessboardPattern {
    /// Creates a validated pattern.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidConfig`] if either corner count is below 2 or
    /// the square size is not a positive finite number.
    pub fn new(rows: usize, cols: usize, square_size: f64) -> Result<Self, CalibrationError> {
        let pattern = ChessboardPattern {
            rows,
            cols,
            square_size,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.rows < 2 || self.cols < 2 {
            return Err(CalibrationError::InvalidConfig(format!(
                "chessboard needs at least 2x2 interior corners, got {}x{}",
                self.cols, self.rows
            )));
        }
        if !(self.square_size.is_finite() && self.square_size > 0.0) {
            return Err(CalibrationError::InvalidConfig(format!(
                "square size must be positive, got {}",
                self.square_size
            )));
        }
        Ok(())
    }

    /// Number of interior corners, `rows * cols`.
    pub fn corner_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Board-frame coordinates of the interior corners on the `Z = 0` plane,
    /// row-major: index `r * cols + c` is `(c * s, r * s, 0)`.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.cols).map(move |c| {
                    Vector3::new(
                        c as f64 * self.square_size,
                        r as f64 * self.square_size,
                        0.0,
                    )
                })
            })
            .collect()
    }

    /// [`Self::object_points`] behind an `Arc`, shared by every sample of a run.
    pub fn shared_object_points(&self) -> Arc<Vec<Vector3<f64>>> {
        Arc::new(self.object_points())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_object_points_row_major() {
        let pattern = ChessboardPattern::new(4, 8, 0.03).unwrap();
        let points = pattern.object_points();
        assert_eq!(points.len(), 32);
        assert_relative_eq!(points[0], Vector3::zeros());
        assert_relative_eq!(points[1], Vector3::new(0.03, 0.0, 0.0));
        assert_relative_eq!(points[8], Vector3::new(0.0, 0.03, 0.0));
        assert_relative_eq!(points[31], Vector3::new(0.21, 0.09, 0.0), epsilon = 1e-12);
        assert!(points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(ChessboardPattern::new(1, 8, 0.03).is_err());
        assert!(ChessboardPattern::new(4, 1, 0.03).is_err());
        assert!(ChessboardPattern::new(4, 8, 0.0).is_err());
        assert!(ChessboardPattern::new(4, 8, f64::NAN).is_err());
    }
}
