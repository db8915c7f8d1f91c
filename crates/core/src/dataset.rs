//! Raw snapshot dataset: grid axes plus one sample matrix per wind component.
//!
//! Each matrix row is one discretely simulated wind direction (a "sample"),
//! each column one grid point. The dataset is consumed once by the offline
//! model builder and discarded.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Snapshot matrices and grid point coordinates for one simulated domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDataset {
    /// UTM easting per grid point (meters).
    pub x: Vec<i32>,
    /// UTM northing per grid point (meters).
    pub y: Vec<i32>,
    /// Altitude per grid point (meters).
    pub z: Vec<f32>,
    /// Wind component along easting, `[num_samples x num_points]`.
    pub ux: DMatrix<f32>,
    /// Wind component along northing, `[num_samples x num_points]`.
    pub uy: DMatrix<f32>,
    /// Vertical wind component, `[num_samples x num_points]`.
    pub uz: DMatrix<f32>,
}

impl SnapshotDataset {
    /// Assemble a dataset, validating that all axes and matrices agree on the
    /// number of grid points and samples.
    ///
    /// # Errors
    /// Returns [`ModelError::ShapeMismatch`] on disagreeing dimensions and
    /// [`ModelError::EmptyDataset`] when there are no points or no samples.
    pub fn new(
        x: Vec<i32>,
        y: Vec<i32>,
        z: Vec<f32>,
        ux: DMatrix<f32>,
        uy: DMatrix<f32>,
        uz: DMatrix<f32>,
    ) -> Result<Self, ModelError> {
        let points = x.len();
        if y.len() != points || z.len() != points {
            return Err(ModelError::ShapeMismatch(format!(
                "axes disagree: x={points}, y={}, z={}",
                y.len(),
                z.len()
            )));
        }
        for (name, m) in [("ux", &ux), ("uy", &uy), ("uz", &uz)] {
            if m.ncols() != points || m.shape() != ux.shape() {
                return Err(ModelError::ShapeMismatch(format!(
                    "{name} is {}x{}, expected {}x{points}",
                    m.nrows(),
                    m.ncols(),
                    ux.nrows()
                )));
            }
        }
        if points == 0 || ux.nrows() == 0 {
            return Err(ModelError::EmptyDataset);
        }
        Ok(Self { x, y, z, ux, uy, uz })
    }

    /// Number of sampled wind directions.
    pub fn num_samples(&self) -> usize {
        self.ux.nrows()
    }

    /// Number of grid points.
    pub fn num_points(&self) -> usize {
        self.x.len()
    }

    /// Index of the grid point nearest to `reference` by Euclidean distance
    /// in (x, y, z).
    pub fn locate(&self, reference: &ReferencePoint) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for i in 0..self.num_points() {
            let dx = self.x[i] as f32 - reference.x;
            let dy = self.y[i] as f32 - reference.y;
            let dz = self.z[i] - reference.z;
            let dist = dx * dx + dy * dy + dz * dz;
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best
    }
}

/// Physical location of the reference sensor in UTM coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl ReferencePoint {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, fill: f32) -> DMatrix<f32> {
        DMatrix::from_element(rows, cols, fill)
    }

    #[test]
    fn test_shape_validation() {
        let ds = SnapshotDataset::new(
            vec![0, 2],
            vec![0, 0],
            vec![10.0, 10.0],
            matrix(3, 2, 1.0),
            matrix(3, 2, 0.0),
            matrix(3, 2, 0.0),
        );
        assert!(ds.is_ok());

        let bad = SnapshotDataset::new(
            vec![0, 2],
            vec![0],
            vec![10.0, 10.0],
            matrix(3, 2, 1.0),
            matrix(3, 2, 0.0),
            matrix(3, 2, 0.0),
        );
        assert!(matches!(bad, Err(ModelError::ShapeMismatch(_))));

        let bad = SnapshotDataset::new(
            vec![0, 2],
            vec![0, 0],
            vec![10.0, 10.0],
            matrix(3, 2, 1.0),
            matrix(2, 2, 0.0),
            matrix(3, 2, 0.0),
        );
        assert!(matches!(bad, Err(ModelError::ShapeMismatch(_))));
    }

    #[test]
    fn test_locate_nearest() {
        let ds = SnapshotDataset::new(
            vec![0, 2, 4],
            vec![0, 0, 0],
            vec![10.0, 10.0, 35.0],
            matrix(1, 3, 1.0),
            matrix(1, 3, 0.0),
            matrix(1, 3, 0.0),
        )
        .unwrap();

        assert_eq!(ds.locate(&ReferencePoint::new(0.4, 0.0, 10.0)), 0);
        assert_eq!(ds.locate(&ReferencePoint::new(2.3, 0.1, 11.0)), 1);
        // Altitude dominates here: (4, 0, 35) is closer than (2, 0, 10).
        assert_eq!(ds.locate(&ReferencePoint::new(2.0, 0.0, 34.0)), 2);
    }
}
