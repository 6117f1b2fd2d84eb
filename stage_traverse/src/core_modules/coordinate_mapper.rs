// THEORY:
// The `coordinate_mapper` bridges the two spaces the rig works in: image pixels,
// where detections are found, and stage real-world units, where the stage moves.
// Three calibration pairs pin down an affine transform exactly, so no fitting or
// outlier rejection is involved. Points are normalized before the solve to keep
// the 3x3 system well conditioned at camera-sized pixel coordinates.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core_modules::detection::DetectionBox;
use crate::error::CalibrationError;

/// Below this, the normalized system is treated as singular.
const DEGENERATE_DETERMINANT: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(&self, other: &Point2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// Row-major 2x3 affine matrix, image point to real-world point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub matrix: [[f64; 3]; 2],
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    pub fn map_point(&self, p: Point2) -> Point2 {
        let [a, b] = self.matrix;
        Point2 {
            x: a[0] * p.x + a[1] * p.y + a[2],
            y: b[0] * p.x + b[1] * p.y + b[2],
        }
    }

    /// Maps the centroid of every box, preserving order.
    pub fn map_path(&self, boxes: &[DetectionBox]) -> Vec<Point2> {
        boxes.iter().map(|b| self.map_point(b.centroid())).collect()
    }
}

/// Translates the centroid to the origin and scales the mean distance to sqrt(2).
fn normalizing_transform(points: &[Point2]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Solves the affine transform carrying each `image` point onto its `world` point.
pub fn compute_transform(
    image: &[Point2],
    world: &[Point2],
) -> Result<AffineTransform, CalibrationError> {
    if image.len() != 3 || world.len() != 3 {
        return Err(CalibrationError::WrongPointCount {
            image: image.len(),
            world: world.len(),
        });
    }

    // --- 1. Normalize the image points ---
    let t = normalizing_transform(image);
    let normalized: Vec<Vector3<f64>> = image
        .iter()
        .map(|p| t * Vector3::new(p.x, p.y, 1.0))
        .collect();

    // --- 2. Solve P * m = w for each output axis ---
    let p = Matrix3::from_rows(&[
        normalized[0].transpose(),
        normalized[1].transpose(),
        normalized[2].transpose(),
    ]);
    if p.determinant().abs() < DEGENERATE_DETERMINANT {
        return Err(CalibrationError::Degenerate);
    }
    let p_inv = p.try_inverse().ok_or(CalibrationError::Degenerate)?;
    let mx = p_inv * Vector3::new(world[0].x, world[1].x, world[2].x);
    let my = p_inv * Vector3::new(world[0].y, world[1].y, world[2].y);

    // --- 3. Fold the normalization back in ---
    let rx = mx.transpose() * t;
    let ry = my.transpose() * t;

    let transform = AffineTransform {
        matrix: [[rx[0], rx[1], rx[2]], [ry[0], ry[1], ry[2]]],
    };
    tracing::info!(matrix = ?transform.matrix, "calibration transform computed");
    Ok(transform)
}
