//! Live sensor consistency: monotonic reads and load-staggered rollout.
//!
//! Sensor updates are far rarer than read traffic. Releasing a new reading
//! to every reader at once causes a correlated spike of reconstruction-cache
//! misses downstream, so each client is assigned a bucket that schedules its
//! personal handover moment inside a bounded stagger window — the spike
//! becomes a plateau. The bucket travels inside the reading echoed back by
//! the client, so the server keeps no per-client session state and a client
//! cannot manipulate its own delay.
//!
//! One timer-driven poll loop per process re-queries the sensor source and
//! swaps the per-sensor state; requests never block on the network poll, and
//! only the state swap itself is mutually excluded with readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::SensorSource;

/// Tuning constants for polling and staggering.
pub mod constants {
    use std::time::Duration;

    /// Span over which a sensor update is rolled out across clients.
    pub const STAGGER_WINDOW_SECS: f64 = 57.0;
    /// Client buckets are drawn uniformly from `[0, BUCKET_RANGE_MAX)`.
    pub const BUCKET_RANGE_MAX: f64 = 100_000.0;
    /// Interval between polls of the sensor source.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// A poll taking longer than this is abandoned for the cycle.
    pub const POLL_DEADLINE: Duration = Duration::from_secs(5);
}

/// One bucket-less record from the sensor source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub time: DateTime<Utc>,
    /// Wind speed in m/s.
    pub ws: f64,
    /// Wind direction in degrees.
    pub wd: f64,
}

/// A reading as exchanged with clients: the sample plus the client's stagger
/// bucket, echoed back inside every subsequent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub time: DateTime<Utc>,
    pub ws: f64,
    pub wd: f64,
    pub bucket: f64,
}

impl SensorReading {
    /// Plausibility bounds: ws in (0, 160) m/s (comfortably above the
    /// highest wind speed ever recorded), wd in (0, 360) degrees.
    pub fn is_valid(&self) -> bool {
        self.ws > 0.0 && self.ws < 160.0 && self.wd > 0.0 && self.wd < 360.0
    }
}

/// Per-sensor state, mutated only by the poll loop.
#[derive(Debug, Clone)]
struct SensorState {
    current: SensorSample,
    /// Timestamp of the reading before `current`.
    previous_time: DateTime<Utc>,
    /// Still on the very first reading since process start.
    first_read: bool,
    /// Wall-clock moment `current` was last replaced.
    updated_at: DateTime<Utc>,
}

/// Owned sensor state table: the poll loop writes, request handlers read.
#[derive(Debug, Default)]
pub struct SensorTable {
    states: Mutex<FxHashMap<String, SensorState>>,
}

impl SensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the currently known sensors.
    pub fn sensor_ids(&self) -> Vec<String> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.keys().cloned().collect()
    }

    /// Upsert freshly polled samples. Sensors whose timestamp is unchanged
    /// are skipped; for the rest the state swap is atomic under the lock.
    pub fn ingest(&self, samples: &[(String, SensorSample)]) {
        self.ingest_at(samples, Utc::now());
    }

    fn ingest_at(&self, samples: &[(String, SensorSample)], now: DateTime<Utc>) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, sample) in samples {
            match states.get_mut(id) {
                Some(state) => {
                    if state.current.time == sample.time {
                        continue;
                    }
                    state.previous_time = state.current.time;
                    state.current = *sample;
                    state.first_read = false;
                    state.updated_at = now;
                    debug!(sensor = id.as_str(), time = %sample.time, "sensor updated");
                }
                None => {
                    states.insert(
                        id.clone(),
                        SensorState {
                            current: *sample,
                            previous_time: sample.time,
                            first_read: true,
                            updated_at: now,
                        },
                    );
                    info!(sensor = id.as_str(), "sensor first seen");
                }
            }
        }
    }

    /// Resolve the reading to serve a client, preserving monotonic reads and
    /// staggering the rollout of fresh data.
    ///
    /// `client` is an optional caller identity, carried for log attribution
    /// only; it never influences the decision. `None` only for an unknown
    /// sensor id; a known sensor always yields a reading, echoed or fresh.
    pub fn resolve(
        &self,
        sensor_id: &str,
        client: Option<&str>,
        last: Option<&SensorReading>,
    ) -> Option<SensorReading> {
        self.resolve_at(sensor_id, client, last, Utc::now())
    }

    /// [`SensorTable::resolve`] with an explicit "now" so stagger schedules
    /// are deterministic under test.
    pub fn resolve_at(
        &self,
        sensor_id: &str,
        client: Option<&str>,
        last: Option<&SensorReading>,
        now: DateTime<Utc>,
    ) -> Option<SensorReading> {
        let state = {
            let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.get(sensor_id).cloned()
        }?;

        // An implausible echoed reading is discarded rather than trusted to
        // drive the monotonic/stagger ladder.
        let last = last.filter(|r| r.is_valid());

        // Reuse the client's bucket or assign a fresh one; the value is only
        // ever exposed inside the reading returned to that client.
        let bucket = last.map_or_else(draw_bucket, |r| r.bucket);
        let current = SensorReading {
            time: state.current.time,
            ws: state.current.ws,
            wd: state.current.wd,
            bucket,
        };

        let Some(last) = last else {
            // First contact: no staggering.
            return Some(current);
        };
        if state.first_read {
            // Cold start: the instance itself only has one reading.
            return Some(current);
        }
        if last.time >= current.time {
            // Client is current or ahead of this instance.
            return Some(last.clone());
        }
        if last.time >= state.previous_time {
            let elapsed = elapsed_seconds(state.updated_at, now);
            let delay = bucket.rem_euclid(constants::STAGGER_WINDOW_SECS);
            if elapsed < delay {
                // Not yet scheduled for the handover.
                return Some(last.clone());
            }
        }
        // Scheduled, or older than even the previous reading: staggering only
        // smooths a single transition, not indefinite catch-up.
        debug!(
            sensor = sensor_id,
            client = client.unwrap_or("anonymous"),
            time = %current.time,
            "handing over fresh reading"
        );
        Some(current)
    }
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn draw_bucket() -> f64 {
    rand::rng().random_range(0.0..constants::BUCKET_RANGE_MAX)
}

/// Background poll loop feeding a [`SensorTable`] from a [`SensorSource`].
///
/// Exactly one per process. The fetch runs entirely outside the table lock;
/// a failed or overlong poll is logged and skipped, and the next cycle
/// retries. Stop with [`SensorDaemon::stop`] (or drop) — the thread exits at
/// the next interval slice without leaving the lock held.
pub struct SensorDaemon {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SensorDaemon {
    /// Spawn the loop with the default poll interval.
    pub fn spawn(table: Arc<SensorTable>, source: Arc<dyn SensorSource>) -> Self {
        Self::spawn_with(table, source, constants::POLL_INTERVAL)
    }

    /// Spawn with a custom interval (shortened in tests).
    pub fn spawn_with(
        table: Arc<SensorTable>,
        source: Arc<dyn SensorSource>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            info!("sensor poll loop started");
            while !stop_flag.load(Ordering::Relaxed) {
                let started = Instant::now();
                match source.fetch_all() {
                    Ok(samples) => {
                        if started.elapsed() > constants::POLL_DEADLINE {
                            warn!(
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "sensor poll exceeded deadline, abandoning cycle"
                            );
                        } else {
                            table.ingest(&samples);
                        }
                    }
                    Err(err) => warn!(error = %err, "sensor poll failed, retrying next cycle"),
                }

                // Sleep in short slices so stop() stays responsive.
                let mut waited = Duration::ZERO;
                while waited < interval && !stop_flag.load(Ordering::Relaxed) {
                    let slice = Duration::from_millis(20).min(interval - waited);
                    std::thread::sleep(slice);
                    waited += slice;
                }
            }
            info!("sensor poll loop stopped");
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the loop to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SensorDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
