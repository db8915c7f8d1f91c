//! Sensor consistency exercised through the public API only: a polling
//! daemon feeding the table, and clients resolving readings across a
//! staggered rollout.
//!
//! Run with: cargo test --test `sensor_rollout`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use windpod_core::sensor::constants::STAGGER_WINDOW_SECS;
use windpod_core::{SensorDaemon, SensorReading, SensorSample, SensorTable};
use windpod_core::storage::SensorSource;
use windpod_core::StorageError;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2027-07-07T14:24:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Source that advances the sensor timestamp on every poll.
struct TickingSource {
    polls: AtomicUsize,
}

impl SensorSource for TickingSource {
    fn fetch_all(&self) -> Result<Vec<(String, SensorSample)>, StorageError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(vec![(
            "EN".to_string(),
            SensorSample {
                time: t0() + TimeDelta::seconds(n * 600),
                ws: 5.0 + n as f64,
                wd: 90.0,
            },
        )])
    }
}

#[test]
fn test_daemon_feeds_table_and_clients_stay_monotonic() {
    let table = Arc::new(SensorTable::new());
    let source = Arc::new(TickingSource {
        polls: AtomicUsize::new(0),
    });
    let daemon = SensorDaemon::spawn_with(
        Arc::clone(&table),
        Arc::clone(&source) as Arc<dyn SensorSource>,
        Duration::from_millis(10),
    );

    // Wait until at least two distinct readings have been ingested.
    let deadline = Instant::now() + Duration::from_secs(5);
    while source.polls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    // A resubmitting client never observes time going backwards, whatever
    // the poll loop does concurrently.
    let mut held: Option<SensorReading> = None;
    let mut last_seen = DateTime::<Utc>::MIN_UTC;
    for _ in 0..50 {
        let got = table.resolve("EN", None, held.as_ref()).unwrap();
        assert!(got.time >= last_seen);
        last_seen = got.time;
        held = Some(got);
        std::thread::sleep(Duration::from_millis(2));
    }

    daemon.stop();
    assert_eq!(table.sensor_ids(), vec!["EN".to_string()]);
}

#[test]
fn test_rollout_spreads_clients_across_the_window() {
    // Two consecutive ingests leave the table mid-transition; clients with
    // different buckets hand over at different moments, and every one of
    // them has handed over once the full window has elapsed.
    let table = SensorTable::new();
    table.ingest(&[("EN".into(), SensorSample { time: t0(), ws: 5.0, wd: 90.0 })]);
    table.ingest(&[(
        "EN".into(),
        SensorSample {
            time: t0() + TimeDelta::seconds(60),
            ws: 6.0,
            wd: 95.0,
        },
    )]);
    let updated = Utc::now();

    let held = |bucket: f64| SensorReading {
        time: t0(),
        ws: 5.0,
        wd: 90.0,
        bucket,
    };

    // Mid-window: low buckets have transitioned, high buckets have not.
    let mid = updated + TimeDelta::seconds(28);
    let early = table.resolve_at("EN", None, Some(&held(5.0)), mid).unwrap();
    let late = table.resolve_at("EN", None, Some(&held(50.0)), mid).unwrap();
    assert_eq!(early.time, t0() + TimeDelta::seconds(60));
    assert_eq!(late.time, t0());

    // Past the window every bucket is fresh.
    let done = updated + TimeDelta::seconds(STAGGER_WINDOW_SECS as i64 + 1);
    for bucket in [0.0, 14.3, 50.0, 99_999.0] {
        let got = table.resolve_at("EN", None, Some(&held(bucket)), done).unwrap();
        assert_eq!(got.time, t0() + TimeDelta::seconds(60));
    }
}

#[test]
fn test_bucket_survives_round_trips() {
    let table = SensorTable::new();
    table.ingest(&[("EN".into(), SensorSample { time: t0(), ws: 5.0, wd: 90.0 })]);

    // The bucket assigned on first contact is preserved verbatim on every
    // later exchange, so a client's handover schedule never drifts.
    let first = table.resolve("EN", None, None).unwrap();
    let second = table.resolve("EN", None, Some(&first)).unwrap();
    assert_eq!(second.bucket, first.bucket);
    let third = table.resolve("EN", None, Some(&second)).unwrap();
    assert_eq!(third.bucket, first.bucket);
}
