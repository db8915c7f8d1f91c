//! Offline POD model builder.
//!
//! Turns raw snapshot matrices into a compact per-point basis plus a small
//! global coefficient artifact, per resolution:
//!
//! 1. locate the grid point nearest the physical reference sensor;
//! 2. per sample, extract the reference wind magnitude and compass direction;
//! 3. normalize every point's vector by its sample's reference magnitude, so
//!    the stored basis is independent of absolute wind speed and query-time
//!    reconstruction only needs a scalar rescale;
//! 4. optionally downsample the normalized matrices;
//! 5. mean-center the stacked sample-by-point matrix and decompose it; the
//!    left factor is the per-point basis, `diag(sigma) * Vt` the compact
//!    point-independent coefficient matrix `A`;
//! 6. emit one point-table row per surviving point, basis columns labeled by
//!    each sample's rounded reference direction, plus `(A, WDref)` once per
//!    resolution.
//!
//! POD gives the lowest-rank linear basis reconstructing every training
//! sample's field with minimal error; a continuous query direction is later
//! answered by blending nearby sampled directions instead of re-simulating.

use nalgebra::DMatrix;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{ReferencePoint, SnapshotDataset};
use crate::downsample::{downsample, DownsampleConfig, DEFAULT_GRID_SPACING};
use crate::error::ModelError;
use crate::geo::{cell_id, cell_level_for_factor, utm_to_latlon};

/// Numeric width the emitted point table is compressed to.
///
/// Half precision has proven to barely cost accuracy for the normalized
/// basis entries while halving chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Float32,
    Float16,
}

impl Precision {
    /// Round a value to this width (values stay `f32` in memory; `Float16`
    /// rounds through IEEE 754 half precision).
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            Precision::Float32 => value,
            Precision::Float16 => f16_bits_to_f32(f32_to_f16_bits(value)),
        }
    }
}

/// Round-to-nearest-even conversion from `f32` to IEEE 754 half bits.
fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mant = bits & 0x007f_ffff;

    if exp == 0xff {
        // Infinity or NaN; keep NaN payloads non-zero.
        return sign | 0x7c00 | u16::from(mant != 0) << 9;
    }
    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7c00;
    }
    if unbiased >= -14 {
        let mut mant16 = mant >> 13;
        let round = mant & 0x1fff;
        if round > 0x1000 || (round == 0x1000 && mant16 & 1 == 1) {
            mant16 += 1;
        }
        // Mantissa overflow carries into the exponent, which is exactly the
        // next representable value (possibly infinity).
        let combined = (((unbiased + 15) as u32) << 10) + mant16;
        return sign | combined as u16;
    }
    if unbiased < -25 {
        return sign;
    }
    // Subnormal half.
    let mant = mant | 0x0080_0000;
    let shift = (13 - 14 - unbiased) as u32;
    let mut mant16 = mant >> shift;
    let rem = mant & ((1 << shift) - 1);
    let half = 1u32 << (shift - 1);
    if rem > half || (rem == half && mant16 & 1 == 1) {
        mant16 += 1;
    }
    sign | mant16 as u16
}

fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits & 0x8000) << 16;
    let exp = (bits >> 10) & 0x1f;
    let mant = u32::from(bits & 0x03ff);
    let out = if exp == 0 {
        if mant == 0 {
            sign
        } else {
            let mut exp32 = 127 - 15 + 1;
            let mut m = mant;
            while m & 0x0400 == 0 {
                m <<= 1;
                exp32 -= 1;
            }
            sign | ((exp32 as u32) << 23) | ((m & 0x03ff) << 13)
        }
    } else if exp == 0x1f {
        sign | 0x7f80_0000 | (mant << 13)
    } else {
        sign | ((u32::from(exp) + 127 - 15) << 23) | (mant << 13)
    };
    f32::from_bits(out)
}

/// Configuration for one offline build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBuilderConfig {
    /// Spatial downsampling factor; 1 keeps the full resolution. Must be a
    /// power of two.
    pub downsampling_factor: usize,
    /// Override for the downsampler's vote share; `None` uses the default
    /// for the factor.
    pub vote_share: Option<f64>,
    /// UTM zone of the grid coordinates.
    pub utm_zone: u8,
    /// Whether the grid lies in the northern hemisphere.
    pub northern: bool,
    /// Numeric width of the emitted point table.
    pub precision: Precision,
}

impl Default for ModelBuilderConfig {
    fn default() -> Self {
        Self {
            downsampling_factor: 1,
            vote_share: None,
            utm_zone: 33,
            northern: true,
            precision: Precision::Float16,
        }
    }
}

/// Per-resolution global artifact: coefficient matrix `A`
/// (`samples x samples`) and the reference direction per sample in degrees,
/// `[0, 360)`. Small enough to cache per process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodArtifact {
    pub a: DMatrix<f32>,
    pub wd_ref: Vec<f32>,
}

impl PodArtifact {
    pub fn num_samples(&self) -> usize {
        self.wd_ref.len()
    }
}

/// Columnar per-point table for one resolution (later split per chunk).
///
/// Basis matrices are `points x samples`; column `s` holds every point's
/// basis entry for sample `s`, labeled by `degrees[s]`. All basis entries and
/// means are speed-normalized and therefore unitless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointTable {
    pub x: Vec<i32>,
    pub y: Vec<i32>,
    pub z: Vec<f32>,
    pub lat: Vec<f32>,
    pub lon: Vec<f32>,
    /// Spatial cell id per point, the chunk address.
    pub cell: Vec<u64>,
    pub mean_u: Vec<f32>,
    pub mean_v: Vec<f32>,
    pub mean_w: Vec<f32>,
    /// Rounded reference direction per sample, the basis column labels.
    pub degrees: Vec<u16>,
    pub basis_u: DMatrix<f32>,
    pub basis_v: DMatrix<f32>,
    pub basis_w: DMatrix<f32>,
}

impl PointTable {
    pub fn num_points(&self) -> usize {
        self.x.len()
    }

    pub fn num_samples(&self) -> usize {
        self.degrees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// A complete built model for one resolution.
#[derive(Debug, Clone)]
pub struct PodModel {
    pub table: PointTable,
    pub artifact: PodArtifact,
}

/// Result of an offline build. Aggressive downsampling of a sparse domain
/// can legitimately leave nothing behind; that is an explicit outcome, not a
/// failure.
#[derive(Debug, Clone)]
pub enum BuildOutput {
    /// No grid point survived downsampling.
    Empty,
    Model(PodModel),
}

/// Offline builder turning a [`SnapshotDataset`] into a [`PodModel`].
#[derive(Debug, Clone)]
pub struct ChunkModelBuilder {
    config: ModelBuilderConfig,
}

impl ChunkModelBuilder {
    /// # Errors
    /// Returns [`ModelError::InvalidDownsamplingFactor`] unless the factor is
    /// a power of two >= 1.
    pub fn new(config: ModelBuilderConfig) -> Result<Self, ModelError> {
        let k = config.downsampling_factor;
        if k == 0 || !k.is_power_of_two() || k > 1 << 17 {
            return Err(ModelError::InvalidDownsamplingFactor(k));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ModelBuilderConfig {
        &self.config
    }

    /// Run the full build.
    ///
    /// # Errors
    /// Propagates shape and coordinate errors from the inputs,
    /// [`ModelError::DegenerateReference`] when a sample has no usable
    /// reference magnitude, and [`ModelError::DecompositionFailed`] when the
    /// SVD does not converge.
    pub fn build(
        &self,
        dataset: &SnapshotDataset,
        reference: &ReferencePoint,
    ) -> Result<BuildOutput, ModelError> {
        let k = self.config.downsampling_factor;
        let idx_ref = dataset.locate(reference);
        info!(
            points = dataset.num_points(),
            samples = dataset.num_samples(),
            factor = k,
            reference_index = idx_ref,
            "building POD model"
        );

        // Reference magnitude and compass direction per sample, taken at the
        // reference point before any downsampling.
        let samples = dataset.num_samples();
        let mut u_ref = Vec::with_capacity(samples);
        let mut wd_ref = Vec::with_capacity(samples);
        for s in 0..samples {
            let (uxr, uyr, uzr) = (
                dataset.ux[(s, idx_ref)],
                dataset.uy[(s, idx_ref)],
                dataset.uz[(s, idx_ref)],
            );
            let mag = (uxr * uxr + uyr * uyr + uzr * uzr).sqrt();
            if !mag.is_finite() || mag <= 0.0 {
                return Err(ModelError::DegenerateReference { sample: s });
            }
            u_ref.push(mag);
            wd_ref.push(compass_degrees(uxr, uyr));
        }

        // Speed-normalize every point's vector by its sample's reference
        // magnitude.
        let normalize = |m: &DMatrix<f32>| {
            let mut n = m.clone();
            for (s, mut row) in n.row_iter_mut().enumerate() {
                row /= u_ref[s];
            }
            n
        };
        let ux = normalize(&dataset.ux);
        let uy = normalize(&dataset.uy);
        let uz = normalize(&dataset.uz);

        let (x, y, z, ux, uy, uz) = if k > 1 {
            let config = DownsampleConfig {
                factor: k,
                vote_share: self
                    .config
                    .vote_share
                    .unwrap_or_else(|| crate::downsample::reasonable_vote_share(k)),
                grid_spacing: DEFAULT_GRID_SPACING,
            };
            let reduced = downsample(&ux, &uy, &uz, &dataset.x, &dataset.y, &dataset.z, &config)?;
            if reduced.is_empty() {
                info!(factor = k, "no grid point survived downsampling");
                return Ok(BuildOutput::Empty);
            }
            (reduced.x, reduced.y, reduced.z, reduced.ux, reduced.uy, reduced.uz)
        } else {
            (
                dataset.x.clone(),
                dataset.y.clone(),
                dataset.z.clone(),
                ux,
                uy,
                uz,
            )
        };
        let points = x.len();
        debug!(surviving_points = points, "snapshot matrices prepared");

        // Stack [Ux | Uy | Uz] along the point axis, mean-center, decompose.
        let mut stacked = DMatrix::<f32>::zeros(samples, 3 * points);
        stacked.view_mut((0, 0), (samples, points)).copy_from(&ux);
        stacked.view_mut((0, points), (samples, points)).copy_from(&uy);
        stacked
            .view_mut((0, 2 * points), (samples, points))
            .copy_from(&uz);

        let mean = stacked.row_mean();
        for mut row in stacked.row_iter_mut() {
            row -= &mean;
        }

        let svd = stacked
            .transpose()
            .try_svd(true, true, f32::EPSILON, 0)
            .ok_or(ModelError::DecompositionFailed)?;
        let mut psi = svd.u.ok_or(ModelError::DecompositionFailed)?;
        let v_t = svd.v_t.ok_or(ModelError::DecompositionFailed)?;
        let mut a = DMatrix::from_diagonal(&svd.singular_values) * v_t;
        // With fewer stacked rows than samples the thin decomposition has
        // fewer than `samples` columns. Pad with zeros so every direction
        // label owns a basis column; `Psi * A` is unchanged.
        if psi.ncols() < samples {
            psi = psi.resize_horizontally(samples, 0.0);
            a = a.resize_vertically(samples, 0.0);
        }

        // Derived coordinates and cell addresses for the surviving points.
        let zone = self.config.utm_zone;
        let northern = self.config.northern;
        let level = cell_level_for_factor(k);
        let latlon: Result<Vec<(f64, f64)>, ModelError> = (0..points)
            .into_par_iter()
            .map(|i| utm_to_latlon(f64::from(x[i]), f64::from(y[i]), zone, northern))
            .collect();
        let latlon = latlon?;
        let cell: Vec<u64> = latlon
            .par_iter()
            .map(|&(lat, lon)| cell_id(lat, lon, level))
            .collect();
        debug!(cell_level = level, "assigned spatial cells");

        let precision = self.config.precision;
        let quantize_vec = |v: &[f32]| v.iter().map(|&e| precision.quantize(e)).collect::<Vec<_>>();
        let quantize_mat = |m: DMatrix<f32>| m.map(|e| precision.quantize(e));

        let take = |offset: usize| psi.rows(offset, points).into_owned();
        let (basis_u, basis_v, basis_w) = (take(0), take(points), take(2 * points));
        let mean_slice = |offset: usize| {
            mean.columns(offset, points)
                .iter()
                .copied()
                .collect::<Vec<f32>>()
        };

        let degrees = wd_ref
            .iter()
            .map(|&d| (d.round() as u16) % 360)
            .collect::<Vec<_>>();

        let table = PointTable {
            lat: latlon.iter().map(|&(lat, _)| lat as f32).collect(),
            lon: latlon.iter().map(|&(_, lon)| lon as f32).collect(),
            x,
            y,
            z,
            cell,
            mean_u: quantize_vec(&mean_slice(0)),
            mean_v: quantize_vec(&mean_slice(points)),
            mean_w: quantize_vec(&mean_slice(2 * points)),
            degrees,
            basis_u: quantize_mat(basis_u),
            basis_v: quantize_mat(basis_v),
            basis_w: quantize_mat(basis_w),
        };
        info!(points = table.num_points(), "POD model built");

        Ok(BuildOutput::Model(PodModel {
            table,
            artifact: PodArtifact { a, wd_ref },
        }))
    }
}

/// Compass-style direction in degrees `[0, 360)` from the easting/northing
/// components at the reference point. 0 means wind *from* the north.
fn compass_degrees(ux: f32, uy: f32) -> f32 {
    (ux.atan2(uy).to_degrees() + 180.0).rem_euclid(360.0)
}

/// Split a resolution's point table into per-chunk tables keyed by cell id.
///
/// Row order within each chunk follows the input table. The global artifact
/// is shared by all chunks and is not duplicated here.
pub fn split_into_chunks(table: &PointTable) -> FxHashMap<u64, PointTable> {
    let mut groups: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
    for (i, &cell) in table.cell.iter().enumerate() {
        groups.entry(cell).or_default().push(i);
    }

    let samples = table.num_samples();
    groups
        .into_iter()
        .map(|(cell_key, rows)| {
            let pick = |v: &[f32]| rows.iter().map(|&i| v[i]).collect::<Vec<_>>();
            let pick_mat = |m: &DMatrix<f32>| {
                DMatrix::from_fn(rows.len(), samples, |r, s| m[(rows[r], s)])
            };
            let sub = PointTable {
                x: rows.iter().map(|&i| table.x[i]).collect(),
                y: rows.iter().map(|&i| table.y[i]).collect(),
                z: pick(&table.z),
                lat: pick(&table.lat),
                lon: pick(&table.lon),
                cell: vec![cell_key; rows.len()],
                mean_u: pick(&table.mean_u),
                mean_v: pick(&table.mean_v),
                mean_w: pick(&table.mean_w),
                degrees: table.degrees.clone(),
                basis_u: pick_mat(&table.basis_u),
                basis_v: pick_mat(&table.basis_v),
                basis_w: pick_mat(&table.basis_w),
            };
            (cell_key, sub)
        })
        .collect()
}
