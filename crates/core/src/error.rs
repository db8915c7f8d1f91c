//! Error types for model building, reconstruction and storage access.
//!
//! Not-found conditions are deliberately *not* errors anywhere in this crate:
//! a missing chunk or sensor id is a first-class `None`/empty result. The enums
//! here cover genuine failures: malformed input, degenerate math, and storage
//! infrastructure problems.

/// Errors raised by the offline model builder and the spatial downsampler.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Dataset has no grid points.
    EmptyDataset,
    /// Axis or matrix dimensions disagree.
    ShapeMismatch(String),
    /// Downsampling factor must be a power of two >= 1.
    InvalidDownsamplingFactor(usize),
    /// Reference wind magnitude for a sample is zero or non-finite, so
    /// speed-normalization would poison the whole basis.
    DegenerateReference {
        /// Index of the offending sample row.
        sample: usize,
    },
    /// SVD failed to converge.
    DecompositionFailed,
    /// A grid coordinate fell outside the valid UTM range.
    CoordinateOutOfRange(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::EmptyDataset => write!(f, "dataset contains no grid points"),
            ModelError::ShapeMismatch(msg) => write!(f, "shape mismatch: {msg}"),
            ModelError::InvalidDownsamplingFactor(k) => {
                write!(f, "downsampling factor {k} is not a power of two >= 1")
            }
            ModelError::DegenerateReference { sample } => {
                write!(f, "reference wind magnitude for sample {sample} is zero or non-finite")
            }
            ModelError::DecompositionFailed => write!(f, "POD decomposition did not converge"),
            ModelError::CoordinateOutOfRange(msg) => write!(f, "coordinate out of range: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Errors surfaced by a storage backend.
///
/// `Transient` failures are retried with backoff on the foreground request
/// path; `Permanent` failures abort immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Temporary infrastructure failure, worth retrying.
    Transient(String),
    /// Non-retryable failure (corrupt payload, misconfiguration).
    Permanent(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Transient(msg) => write!(f, "transient storage failure: {msg}"),
            StorageError::Permanent(msg) => write!(f, "permanent storage failure: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors raised on the per-request reconstruction path.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructError {
    /// Request parameters rejected before any computation or fetch.
    InvalidRequest(String),
    /// No POD artifact exists for the requested resolution, so direction
    /// bracketing is impossible. Distinct from a missing chunk, which is a
    /// normal empty result.
    UnknownResolution(u32),
    /// Stored table and artifact disagree about their shapes.
    MalformedModel(String),
    /// Retries against the storage backend exhausted.
    Storage(StorageError),
}

impl std::fmt::Display for ReconstructError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconstructError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ReconstructError::UnknownResolution(res) => {
                write!(f, "no POD artifact for resolution {res}")
            }
            ReconstructError::MalformedModel(msg) => write!(f, "malformed model: {msg}"),
            ReconstructError::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

impl std::error::Error for ReconstructError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconstructError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for ReconstructError {
    fn from(err: StorageError) -> Self {
        ReconstructError::Storage(err)
    }
}
