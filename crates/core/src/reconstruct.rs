//! Query-time field reconstruction.
//!
//! Combines a chunk's point table and its resolution's `(A, WDref)` artifact
//! with a requested wind speed and direction into a concrete vector field.
//! The requested direction is answered by bracketing it between the two
//! stored sample directions closest on the circle and interpolating linearly
//! by angular distance; the blend is continuous in `wd`, handles the
//! 0/360 degree wraparound, and reproduces a stored column exactly when `wd`
//! hits that column's nominal degree. The result is then rescaled by the
//! requested speed, undoing the builder's speed-normalization.
//!
//! Reconstruction is a pure function returning a new table; the surrounding
//! [`FieldReconstructor`] service adds the per-resolution artifact cache and
//! retried storage fetches.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ReconstructError;
use crate::model::{PodArtifact, PointTable};
use crate::storage::{with_retry, ModelStore, RetryPolicy};

/// Reconstructed wind vectors in the fixed response schema: latitude and
/// longitude in degrees, altitude in meters, u/v/w in meters per second in
/// the simulation's native coordinate frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindField {
    pub lat: Vec<f32>,
    pub lon: Vec<f32>,
    pub z: Vec<i32>,
    pub u: Vec<f32>,
    pub v: Vec<f32>,
    pub w: Vec<f32>,
}

impl WindField {
    /// The empty-but-valid table: "no data for this region" is a normal
    /// outcome, not an error.
    pub fn empty() -> Self {
        Self {
            lat: Vec::new(),
            lon: Vec::new(),
            z: Vec::new(),
            u: Vec::new(),
            v: Vec::new(),
            w: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty()
    }
}

/// Weights of the two stored directions bracketing a query direction.
struct Blend {
    lower: usize,
    upper: usize,
    weight_lower: f32,
    weight_upper: f32,
}

/// Find the stored directions bracketing `wd` most tightly on the circle.
fn bracket(wd_ref: &[f32], wd: f32) -> Blend {
    let mut lower = 0;
    let mut upper = 0;
    let mut behind = f32::INFINITY;
    let mut ahead = f32::INFINITY;
    for (i, &deg) in wd_ref.iter().enumerate() {
        let b = (wd - deg).rem_euclid(360.0);
        let a = (deg - wd).rem_euclid(360.0);
        if b < behind {
            behind = b;
            lower = i;
        }
        if a < ahead {
            ahead = a;
            upper = i;
        }
    }
    // Exact hit or a single stored direction: take that column whole.
    if behind == 0.0 || ahead == 0.0 || lower == upper {
        let exact = if ahead == 0.0 { upper } else { lower };
        return Blend {
            lower: exact,
            upper: exact,
            weight_lower: 1.0,
            weight_upper: 0.0,
        };
    }
    let span = behind + ahead;
    Blend {
        lower,
        upper,
        weight_lower: ahead / span,
        weight_upper: behind / span,
    }
}

/// Reconstruct the vector field of one chunk for the requested wind speed
/// and direction.
///
/// # Errors
/// Returns [`ReconstructError::InvalidRequest`] for non-positive or
/// non-finite `ws` and `wd` outside `[0, 360)`, and
/// [`ReconstructError::MalformedModel`] when table and artifact shapes
/// disagree.
pub fn reconstruct(
    table: &PointTable,
    artifact: &PodArtifact,
    ws: f32,
    wd: f32,
) -> Result<WindField, ReconstructError> {
    validate_request(ws, wd)?;
    if artifact.num_samples() != table.num_samples() {
        return Err(ReconstructError::MalformedModel(format!(
            "artifact has {} samples, table has {}",
            artifact.num_samples(),
            table.num_samples()
        )));
    }
    let points = table.num_points();
    let samples = table.num_samples();
    for (name, basis) in [
        ("u", &table.basis_u),
        ("v", &table.basis_v),
        ("w", &table.basis_w),
    ] {
        if basis.shape() != (points, samples) {
            return Err(ReconstructError::MalformedModel(format!(
                "basis {name} is {}x{}, expected {points}x{samples}",
                basis.nrows(),
                basis.ncols()
            )));
        }
    }
    if table.is_empty() {
        return Ok(WindField::empty());
    }
    if artifact.num_samples() == 0 {
        return Err(ReconstructError::MalformedModel(
            "artifact has no sampled directions".into(),
        ));
    }

    let blend = bracket(&artifact.wd_ref, wd);
    let mut field = WindField {
        lat: table.lat.clone(),
        lon: table.lon.clone(),
        z: table.z.iter().map(|&z| z as i32).collect(),
        u: Vec::with_capacity(points),
        v: Vec::with_capacity(points),
        w: Vec::with_capacity(points),
    };
    let mix = |basis: &nalgebra::DMatrix<f32>, mean: &[f32], i: usize| {
        let blended = blend.weight_lower * basis[(i, blend.lower)]
            + blend.weight_upper * basis[(i, blend.upper)];
        (mean[i] + blended) * ws
    };
    for i in 0..points {
        field.u.push(mix(&table.basis_u, &table.mean_u, i));
        field.v.push(mix(&table.basis_v, &table.mean_v, i));
        field.w.push(mix(&table.basis_w, &table.mean_w, i));
    }
    Ok(field)
}

fn validate_request(ws: f32, wd: f32) -> Result<(), ReconstructError> {
    if !ws.is_finite() || ws <= 0.0 {
        return Err(ReconstructError::InvalidRequest(format!(
            "wind speed {ws} must be positive and finite"
        )));
    }
    if !wd.is_finite() || !(0.0..360.0).contains(&wd) {
        return Err(ReconstructError::InvalidRequest(format!(
            "wind direction {wd} must be in [0, 360)"
        )));
    }
    Ok(())
}

/// Per-request reconstruction service over an injected [`ModelStore`].
///
/// Keeps one cache keyed by resolution for the small global artifact; chunk
/// tables are fetched per request. Concurrent artifact fetches for the same
/// resolution are tolerated — the first stored value wins and duplicates are
/// dropped.
pub struct FieldReconstructor {
    store: Arc<dyn ModelStore>,
    retry: RetryPolicy,
    artifacts: Mutex<FxHashMap<u32, Arc<PodArtifact>>>,
}

impl FieldReconstructor {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn ModelStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            artifacts: Mutex::new(FxHashMap::default()),
        }
    }

    /// Reconstruct the field for one `(resolution, cell)` chunk.
    ///
    /// A missing chunk yields an empty field; a missing artifact fails with
    /// [`ReconstructError::UnknownResolution`], since direction bracketing is
    /// impossible without it.
    ///
    /// # Errors
    /// See [`reconstruct`], plus [`ReconstructError::Storage`] once retries
    /// exhaust.
    pub fn field(
        &self,
        resolution: u32,
        cell: u64,
        ws: f32,
        wd: f32,
    ) -> Result<WindField, ReconstructError> {
        validate_request(ws, wd)?;
        let artifact = self.artifact(resolution)?;
        let table = with_retry(&self.retry, || self.store.fetch_chunk(resolution, cell))?;
        match table {
            None => {
                debug!(resolution, cell, "chunk has no data");
                Ok(WindField::empty())
            }
            Some(table) => reconstruct(&table, &artifact, ws, wd),
        }
    }

    /// Cached artifact lookup. The fetch happens outside the cache lock so a
    /// slow backend never blocks other resolutions.
    fn artifact(&self, resolution: u32) -> Result<Arc<PodArtifact>, ReconstructError> {
        {
            let cache = self
                .artifacts
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(artifact) = cache.get(&resolution) {
                return Ok(Arc::clone(artifact));
            }
        }

        let fetched = with_retry(&self.retry, || self.store.fetch_artifact(resolution))?;
        let Some(artifact) = fetched else {
            return Err(ReconstructError::UnknownResolution(resolution));
        };
        info!(resolution, samples = artifact.num_samples(), "cached POD artifact");

        let mut cache = self
            .artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = cache
            .entry(resolution)
            .or_insert_with(|| Arc::new(artifact));
        Ok(Arc::clone(entry))
    }
}
