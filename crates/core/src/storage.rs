//! Storage seams for chunk tables, POD artifacts and the sensor source.
//!
//! The backends behind these traits (object storage, SQL) are thin I/O
//! wrappers owned by the deployment; this crate only fixes the contract:
//! content-addressed retrieval by `(resolution)` and `(resolution, cell)`,
//! with "not found" as a first-class `None` rather than an error. Concrete
//! clients are constructed once and passed into the components that need
//! them — never ambient globals.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::StorageError;
use crate::model::{PodArtifact, PointTable};
use crate::sensor::SensorSample;

/// Persistent store for per-chunk point tables and per-resolution artifacts.
pub trait ModelStore: Send + Sync {
    /// Fetch the point table for a chunk; `Ok(None)` means the chunk simply
    /// has no data.
    ///
    /// # Errors
    /// Only infrastructure failures are errors.
    fn fetch_chunk(&self, resolution: u32, cell: u64) -> Result<Option<PointTable>, StorageError>;

    /// Fetch the `(A, WDref)` artifact for a resolution; `Ok(None)` means the
    /// resolution was never built.
    ///
    /// # Errors
    /// Only infrastructure failures are errors.
    fn fetch_artifact(&self, resolution: u32) -> Result<Option<PodArtifact>, StorageError>;

    /// # Errors
    /// Only infrastructure failures are errors.
    fn store_chunk(
        &self,
        resolution: u32,
        cell: u64,
        table: &PointTable,
    ) -> Result<(), StorageError>;

    /// # Errors
    /// Only infrastructure failures are errors.
    fn store_artifact(&self, resolution: u32, artifact: &PodArtifact) -> Result<(), StorageError>;
}

/// Read-only row source for the physical sensors, polled on a fixed interval.
pub trait SensorSource: Send + Sync {
    /// One record per sensor, all sharing a single source timestamp.
    ///
    /// # Errors
    /// Poll failures are logged and retried next cycle by the caller.
    fn fetch_all(&self) -> Result<Vec<(String, SensorSample)>, StorageError>;
}

/// Bounded exponential backoff for foreground storage fetches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First backoff delay.
    pub initial: Duration,
    /// Delay multiplier per attempt.
    pub multiplier: f64,
    /// Hard deadline over all attempts.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            multiplier: 3.0,
            deadline: Duration::from_secs(5),
        }
    }
}

/// Run `op`, retrying transient failures with exponential backoff until the
/// policy's deadline would be exceeded. Permanent failures return
/// immediately.
///
/// # Errors
/// The last transient error once retries exhaust, or the first permanent one.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let started = Instant::now();
    let mut delay = policy.initial;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ StorageError::Permanent(_)) => return Err(err),
            Err(err @ StorageError::Transient(_)) => {
                if started.elapsed() + delay > policy.deadline {
                    return Err(err);
                }
                debug!(delay_ms = delay.as_millis() as u64, "retrying after transient storage failure");
                std::thread::sleep(delay);
                delay = delay.mul_f64(policy.multiplier);
            }
        }
    }
}

/// In-memory [`ModelStore`] for tests, demos and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    chunks: RwLock<FxHashMap<(u32, u64), PointTable>>,
    artifacts: RwLock<FxHashMap<u32, PodArtifact>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for InMemoryStore {
    fn fetch_chunk(&self, resolution: u32, cell: u64) -> Result<Option<PointTable>, StorageError> {
        let chunks = self.chunks.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(chunks.get(&(resolution, cell)).cloned())
    }

    fn fetch_artifact(&self, resolution: u32) -> Result<Option<PodArtifact>, StorageError> {
        let artifacts = self
            .artifacts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(artifacts.get(&resolution).cloned())
    }

    fn store_chunk(
        &self,
        resolution: u32,
        cell: u64,
        table: &PointTable,
    ) -> Result<(), StorageError> {
        let mut chunks = self
            .chunks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        chunks.insert((resolution, cell), table.clone());
        Ok(())
    }

    fn store_artifact(&self, resolution: u32, artifact: &PodArtifact) -> Result<(), StorageError> {
        let mut artifacts = self
            .artifacts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        artifacts.insert(resolution, artifact.clone());
        Ok(())
    }
}

/// Filesystem [`ModelStore`] persisting JSON files under
/// `<root>/downsampling-factor-<resolution>/`.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn chunk_path(&self, resolution: u32, cell: u64) -> PathBuf {
        self.root
            .join(format!("downsampling-factor-{resolution}"))
            .join(format!("{cell}.json"))
    }

    fn artifact_path(&self, resolution: u32) -> PathBuf {
        self.root.join(format!("{resolution}_artifact.json"))
    }

    fn read<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<Option<T>, StorageError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(classify_io(&err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StorageError::Permanent(format!("corrupt payload: {err}")))
    }

    fn write<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| classify_io(&err))?;
        }
        let bytes = serde_json::to_vec(value)
            .map_err(|err| StorageError::Permanent(err.to_string()))?;
        std::fs::write(path, bytes).map_err(|err| classify_io(&err))
    }
}

/// Retrying a failure the filesystem will keep reproducing only burns the
/// backoff deadline.
fn classify_io(err: &std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied
        | std::io::ErrorKind::InvalidInput
        | std::io::ErrorKind::Unsupported => StorageError::Permanent(err.to_string()),
        _ => StorageError::Transient(err.to_string()),
    }
}

impl ModelStore for JsonDirStore {
    fn fetch_chunk(&self, resolution: u32, cell: u64) -> Result<Option<PointTable>, StorageError> {
        Self::read(&self.chunk_path(resolution, cell))
    }

    fn fetch_artifact(&self, resolution: u32) -> Result<Option<PodArtifact>, StorageError> {
        Self::read(&self.artifact_path(resolution))
    }

    fn store_chunk(
        &self,
        resolution: u32,
        cell: u64,
        table: &PointTable,
    ) -> Result<(), StorageError> {
        Self::write(&self.chunk_path(resolution, cell), table)
    }

    fn store_artifact(&self, resolution: u32, artifact: &PodArtifact) -> Result<(), StorageError> {
        Self::write(&self.artifact_path(resolution), artifact)
    }
}
