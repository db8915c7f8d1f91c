//! NaN-aware spatial downsampler.
//!
//! Aggregates a fine point grid into coarser k x k tiles, independently per
//! altitude layer and per sample. No aggregation happens across samples or
//! across altitudes. Each block becomes the NaN-aware mean of its cells, or
//! NaN when fewer cells are present than the required vote share — blocks on
//! the sparse fringe of the simulated domain disappear rather than getting
//! averaged from almost nothing.
//!
//! The whole reduction runs as bulk operations over flat per-sample planes
//! (rayon across samples); it covers layers x samples x rows x cols cells and
//! must never degenerate into per-point scalar code.

use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Spacing of the input grid in meters per index step. The simulation emits
/// one point every 2 m at the highest resolution.
pub const DEFAULT_GRID_SPACING: i32 = 2;

/// Required share of present cells for a block to survive aggregation.
///
/// 1 for factor 1 (no aggregation, every present cell survives), `0.95^k`
/// otherwise — the requirement deliberately relaxes as blocks coarsen. This
/// is an empirical tuning default, not an invariant; override it through
/// [`DownsampleConfig::vote_share`].
pub fn reasonable_vote_share(factor: usize) -> f64 {
    if factor == 1 {
        1.0
    } else {
        0.95f64.powi(factor as i32)
    }
}

/// Configuration for one downsampling pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DownsampleConfig {
    /// Block edge length in grid cells. Expected to be a power of two.
    pub factor: usize,
    /// Required share of present cells per block, in (0, 1].
    pub vote_share: f64,
    /// Meters per grid index step of the input.
    pub grid_spacing: i32,
}

impl DownsampleConfig {
    /// Config for a factor with the default vote share and grid spacing.
    pub fn with_factor(factor: usize) -> Self {
        Self {
            factor,
            vote_share: reasonable_vote_share(factor),
            grid_spacing: DEFAULT_GRID_SPACING,
        }
    }
}

/// Downsampled snapshot matrices with their surviving coordinates.
///
/// Surviving points are aligned across all three components and ordered
/// layer-major, then block row, then block column.
#[derive(Debug, Clone)]
pub struct DownsampledField {
    pub x: Vec<i32>,
    pub y: Vec<i32>,
    pub z: Vec<f32>,
    pub ux: DMatrix<f32>,
    pub uy: DMatrix<f32>,
    pub uz: DMatrix<f32>,
}

impl DownsampledField {
    /// True when no block survived the vote threshold.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Dense grid layout shared by the three components: layer/row/col index per
/// input point plus the plane dimensions.
struct GridIndex {
    layers: Vec<f32>,
    li: Vec<usize>,
    xi: Vec<usize>,
    yi: Vec<usize>,
    rows: usize,
    cols: usize,
    x_min: i32,
    y_min: i32,
}

impl GridIndex {
    fn build(x: &[i32], y: &[i32], z: &[f32], spacing: i32) -> Result<Self, ModelError> {
        if x.is_empty() {
            return Err(ModelError::EmptyDataset);
        }
        let x_min = *x.iter().min().unwrap_or(&0);
        let x_max = *x.iter().max().unwrap_or(&0);
        let y_min = *y.iter().min().unwrap_or(&0);
        let y_max = *y.iter().max().unwrap_or(&0);

        let mut layers: Vec<f32> = z.to_vec();
        layers.sort_by(f32::total_cmp);
        layers.dedup();

        let li = z
            .iter()
            .map(|v| layers.iter().position(|a| a == v).unwrap_or(0))
            .collect();
        let xi = x.iter().map(|v| ((v - x_min) / spacing) as usize).collect();
        let yi = y.iter().map(|v| ((v - y_min) / spacing) as usize).collect();

        Ok(Self {
            layers,
            li,
            xi,
            yi,
            rows: 1 + ((x_max - x_min) / spacing) as usize,
            cols: 1 + ((y_max - y_min) / spacing) as usize,
            x_min,
            y_min,
        })
    }

    fn block_rows(&self, k: usize) -> usize {
        self.rows.div_ceil(k)
    }

    fn block_cols(&self, k: usize) -> usize {
        self.cols.div_ceil(k)
    }
}

/// Downsample the three component matrices to blocks of `factor` x `factor`
/// cells per altitude layer.
///
/// A point survives iff its block is non-NaN in the first sample of the `ux`
/// component; the other components are re-sliced to the identical surviving
/// coordinate set. Output coordinates are the geometric centers of the
/// surviving blocks, re-expressed in the original coordinate unit. Zero
/// survivors is a valid, explicitly empty output.
///
/// # Errors
/// Returns [`ModelError::InvalidDownsamplingFactor`] for factor 0,
/// [`ModelError::ShapeMismatch`] for disagreeing inputs and
/// [`ModelError::EmptyDataset`] for an empty grid.
pub fn downsample(
    ux: &DMatrix<f32>,
    uy: &DMatrix<f32>,
    uz: &DMatrix<f32>,
    x: &[i32],
    y: &[i32],
    z: &[f32],
    config: &DownsampleConfig,
) -> Result<DownsampledField, ModelError> {
    let k = config.factor;
    if k == 0 {
        return Err(ModelError::InvalidDownsamplingFactor(0));
    }
    let points = x.len();
    if y.len() != points || z.len() != points {
        return Err(ModelError::ShapeMismatch(format!(
            "axes disagree: x={points}, y={}, z={}",
            y.len(),
            z.len()
        )));
    }
    for (name, m) in [("ux", ux), ("uy", uy), ("uz", uz)] {
        if m.ncols() != points || m.nrows() != ux.nrows() {
            return Err(ModelError::ShapeMismatch(format!(
                "{name} is {}x{}, expected {}x{points}",
                m.nrows(),
                m.ncols(),
                ux.nrows()
            )));
        }
    }

    let grid = GridIndex::build(x, y, z, config.grid_spacing)?;

    let rux = reduce_component(ux, &grid, k, config.vote_share);
    let ruy = reduce_component(uy, &grid, k, config.vote_share);
    let ruz = reduce_component(uz, &grid, k, config.vote_share);

    // Survivor mask from the reference component's first sample.
    let brows = grid.block_rows(k);
    let bcols = grid.block_cols(k);
    let mut survivors = Vec::new();
    for layer in 0..grid.layers.len() {
        for br in 0..brows {
            for bc in 0..bcols {
                if rux[0][(layer * brows + br) * bcols + bc].is_finite() {
                    survivors.push((layer, br, bc));
                }
            }
        }
    }

    let spacing = f64::from(config.grid_spacing);
    let half = k as f64 / 2.0;
    let mut out_x = Vec::with_capacity(survivors.len());
    let mut out_y = Vec::with_capacity(survivors.len());
    let mut out_z = Vec::with_capacity(survivors.len());
    for &(layer, br, bc) in &survivors {
        // Block geometric center, back in original units.
        out_x.push((((br * k) as f64 + half) * spacing - 1.0 + f64::from(grid.x_min)).round() as i32);
        out_y.push((((bc * k) as f64 + half) * spacing - 1.0 + f64::from(grid.y_min)).round() as i32);
        out_z.push(grid.layers[layer]);
    }

    let slice = |reduced: &[Vec<f32>]| {
        DMatrix::from_fn(ux.nrows(), survivors.len(), |s, j| {
            let (layer, br, bc) = survivors[j];
            reduced[s][(layer * brows + br) * bcols + bc]
        })
    };

    Ok(DownsampledField {
        x: out_x,
        y: out_y,
        z: out_z,
        ux: slice(&rux),
        uy: slice(&ruy),
        uz: slice(&ruz),
    })
}

/// Reduce one component to per-sample block planes.
///
/// Returned vectors are `layers * block_rows * block_cols` long, one per
/// sample, NaN where a block did not reach the vote share.
fn reduce_component(c: &DMatrix<f32>, grid: &GridIndex, k: usize, share: f64) -> Vec<Vec<f32>> {
    let layers = grid.layers.len();
    let (rows, cols) = (grid.rows, grid.cols);
    let (brows, bcols) = (grid.block_rows(k), grid.block_cols(k));
    let area = (k * k) as f64;

    (0..c.nrows())
        .into_par_iter()
        .map(|s| {
            // Scatter the sample's points into a dense NaN-filled volume.
            let mut plane = vec![f32::NAN; layers * rows * cols];
            for p in 0..c.ncols() {
                plane[(grid.li[p] * rows + grid.xi[p]) * cols + grid.yi[p]] = c[(s, p)];
            }

            let mut blocks = vec![f32::NAN; layers * brows * bcols];
            for layer in 0..layers {
                for br in 0..brows {
                    for bc in 0..bcols {
                        let mut sum = 0.0f64;
                        let mut count = 0usize;
                        for dr in 0..k {
                            let row = br * k + dr;
                            if row >= rows {
                                break;
                            }
                            for dc in 0..k {
                                let col = bc * k + dc;
                                if col >= cols {
                                    break;
                                }
                                let v = plane[(layer * rows + row) * cols + col];
                                if v.is_finite() {
                                    sum += f64::from(v);
                                    count += 1;
                                }
                            }
                        }
                        // Blocks on the domain edge still vote against the
                        // full k*k area, matching NaN padding.
                        if count > 0 && (count as f64) >= area * share {
                            blocks[(layer * brows + br) * bcols + bc] =
                                (sum / count as f64) as f32;
                        }
                    }
                }
            }
            blocks
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fully dense single-layer grid in canonical order (row-major over x,
    /// then y), with values equal to the linear point index.
    fn dense_grid(side: usize, samples: usize) -> (Vec<i32>, Vec<i32>, Vec<f32>, DMatrix<f32>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut z = Vec::new();
        for i in 0..side {
            for j in 0..side {
                x.push((i as i32) * DEFAULT_GRID_SPACING + 100);
                y.push((j as i32) * DEFAULT_GRID_SPACING + 500);
                z.push(35.0);
            }
        }
        let n = side * side;
        let m = DMatrix::from_fn(samples, n, |s, p| (s * n + p) as f32);
        (x, y, z, m)
    }

    #[test]
    fn test_identity_at_factor_one() {
        let (x, y, z, m) = dense_grid(4, 2);
        let config = DownsampleConfig::with_factor(1);
        let out = downsample(&m, &m, &m, &x, &y, &z, &config).unwrap();

        assert_eq!(out.x, x);
        assert_eq!(out.y, y);
        assert_eq!(out.z, z);
        assert_eq!(out.ux, m);
        assert_eq!(out.uy, m);
        assert_eq!(out.uz, m);
    }

    #[test]
    fn test_reduction_exact_means() {
        let (x, y, z, m) = dense_grid(4, 1);
        let config = DownsampleConfig::with_factor(2);
        let out = downsample(&m, &m, &m, &x, &y, &z, &config).unwrap();

        // Fully dense 4x4 input at factor 2: exactly 16 / 4 = 4 blocks.
        assert_eq!(out.x.len(), 4);

        // First block covers points (0,0), (0,1), (1,0), (1,1) = indices
        // 0, 1, 4, 5 in the 4x4 row-major grid.
        let expected = (0.0 + 1.0 + 4.0 + 5.0) / 4.0;
        assert_eq!(out.ux[(0, 0)], expected);

        // Block centers land between the aggregated points.
        assert_eq!(out.x[0], ((0.0 + 1.0) * 2.0 - 1.0) as i32 + 100);
        assert_eq!(out.y[0], ((0.0 + 1.0) * 2.0 - 1.0) as i32 + 500);
    }

    #[test]
    fn test_reduction_point_count_per_layer() {
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut z = Vec::new();
        for layer in [10.0f32, 35.0] {
            for i in 0..8 {
                for j in 0..8 {
                    x.push(i * 2);
                    y.push(j * 2);
                    z.push(layer);
                }
            }
        }
        let n = x.len();
        let m = DMatrix::from_fn(3, n, |s, p| (s + p) as f32);
        let config = DownsampleConfig::with_factor(4);
        let out = downsample(&m, &m, &m, &x, &y, &z, &config).unwrap();

        // 64 points per layer / 16 = 4 blocks per layer.
        assert_eq!(out.x.len(), 8);
        assert_eq!(out.z.iter().filter(|&&v| v == 10.0).count(), 4);
        assert_eq!(out.z.iter().filter(|&&v| v == 35.0).count(), 4);
    }

    #[test]
    fn test_vote_threshold_boundary() {
        // 2x2 grid with one block; share 0.75 requires exactly 3 present
        // cells. Presence exactly at the share keeps the block, one fewer
        // drops it.
        let make = |points: usize| {
            let coords = [(0, 0), (0, 2), (2, 0), (2, 2)];
            let x: Vec<i32> = coords[..points].iter().map(|c| c.0).collect();
            let y: Vec<i32> = coords[..points].iter().map(|c| c.1).collect();
            let z = vec![35.0; points];
            let m = DMatrix::from_fn(1, points, |_, p| p as f32 + 1.0);
            (x, y, z, m)
        };
        let config = DownsampleConfig {
            factor: 2,
            vote_share: 0.75,
            grid_spacing: DEFAULT_GRID_SPACING,
        };

        let (x, y, z, m) = make(3);
        let out = downsample(&m, &m, &m, &x, &y, &z, &config).unwrap();
        assert_eq!(out.x.len(), 1);
        assert_eq!(out.ux[(0, 0)], 2.0); // mean of 1, 2, 3

        let (x, y, z, m) = make(2);
        // Grid extent shrinks with the dropped corner, so the single block
        // still votes over the full 2x2 area.
        let out = downsample(&m, &m, &m, &x, &y, &z, &config).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_survivors_aligned_across_components() {
        let (x, y, z, ux) = dense_grid(4, 2);
        let uy = ux.map(|v| v * 2.0);
        let uz = ux.map(|v| v - 7.0);
        let config = DownsampleConfig::with_factor(2);
        let out = downsample(&ux, &uy, &uz, &x, &y, &z, &config).unwrap();

        assert_eq!(out.ux.shape(), out.uy.shape());
        assert_eq!(out.ux.shape(), out.uz.shape());
        // Linear aggregation preserves the componentwise relationships.
        for s in 0..2 {
            for j in 0..out.x.len() {
                assert_eq!(out.uy[(s, j)], out.ux[(s, j)] * 2.0);
                assert_eq!(out.uz[(s, j)], out.ux[(s, j)] - 7.0);
            }
        }
    }

    #[test]
    fn test_rejects_factor_zero() {
        let (x, y, z, m) = dense_grid(2, 1);
        let config = DownsampleConfig {
            factor: 0,
            vote_share: 1.0,
            grid_spacing: DEFAULT_GRID_SPACING,
        };
        assert!(matches!(
            downsample(&m, &m, &m, &x, &y, &z, &config),
            Err(ModelError::InvalidDownsamplingFactor(0))
        ));
    }
}
