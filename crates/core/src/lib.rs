//! Wind POD Model Core Library
//!
//! Precomputes reduced-order (POD) models of a simulated wind field at
//! multiple spatial resolutions and reconstructs an instantaneous wind
//! vector field for arbitrary wind speed and direction, while keeping a
//! slowly-changing live sensor reading consistent across many concurrent,
//! intermittently-connected readers.
//!
//! ## Subsystems
//!
//! - [`downsample`]: NaN-aware spatial downsampler aggregating the fine
//!   point grid into coarser tiles per altitude layer and sampled direction.
//! - [`model`]: offline builder turning raw snapshot matrices into a compact
//!   speed-normalized per-point basis plus a small global coefficient
//!   artifact, via singular value decomposition.
//! - [`reconstruct`]: query-time reconstruction blending the stored
//!   direction columns into a concrete vector field for a requested
//!   (speed, direction).
//! - [`sensor`]: background polling loop and per-request resolution logic
//!   providing monotonic reads and staggered update rollout.
//!
//! Storage backends and the polygon-covering algorithm are external
//! collaborators behind the traits in [`storage`].

// Offline model building
pub mod dataset;
pub mod downsample;
pub mod model;

// Query path
pub mod reconstruct;
pub mod sensor;

// Shared infrastructure
pub mod error;
pub mod geo;
pub mod storage;

// Re-export main types
pub use dataset::{ReferencePoint, SnapshotDataset};
pub use downsample::{downsample, DownsampleConfig, DownsampledField};
pub use error::{ModelError, ReconstructError, StorageError};
pub use model::{
    split_into_chunks, BuildOutput, ChunkModelBuilder, ModelBuilderConfig, PodArtifact, PodModel,
    PointTable, Precision,
};
pub use reconstruct::{reconstruct, FieldReconstructor, WindField};
pub use sensor::{SensorDaemon, SensorReading, SensorSample, SensorTable};
pub use storage::{InMemoryStore, JsonDirStore, ModelStore, RetryPolicy, SensorSource};
