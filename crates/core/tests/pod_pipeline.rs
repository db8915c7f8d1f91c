//! End-to-end pipeline validation: synthetic snapshots through the offline
//! builder, per-chunk storage, and query-time reconstruction.
//!
//! Run with: cargo test --test `pod_pipeline`

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::DMatrix;
use windpod_core::{
    split_into_chunks, BuildOutput, ChunkModelBuilder, FieldReconstructor, InMemoryStore,
    ModelBuilderConfig, ModelStore, PodModel, Precision, ReconstructError, ReferencePoint,
    SnapshotDataset,
};

/// Dense 8x8 single-layer grid around the zone-33 operating region. Each
/// sample is a uniform flow rotated per sample plus a mild spatial gradient.
fn synthetic_dataset(samples: usize) -> SnapshotDataset {
    let side = 8usize;
    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut z = Vec::new();
    for i in 0..side {
        for j in 0..side {
            x.push(386_000 + (i as i32) * 2);
            y.push(5_820_000 + (j as i32) * 2);
            z.push(35.0);
        }
    }
    let n = side * side;
    let ux = DMatrix::from_fn(samples, n, |s, p| {
        let angle = (s as f32) * std::f32::consts::FRAC_PI_4;
        4.0 * angle.sin() + 0.02 * (p % side) as f32
    });
    let uy = DMatrix::from_fn(samples, n, |s, p| {
        let angle = (s as f32) * std::f32::consts::FRAC_PI_4;
        4.0 * angle.cos() + 0.02 * (p / side) as f32
    });
    let uz = DMatrix::from_fn(samples, n, |s, p| 0.1 + 0.001 * (s * n + p) as f32);
    SnapshotDataset::new(x, y, z, ux, uy, uz).unwrap()
}

fn reference() -> ReferencePoint {
    ReferencePoint::new(386_008.0, 5_820_008.0, 35.0)
}

fn build_model(factor: usize) -> PodModel {
    let builder = ChunkModelBuilder::new(ModelBuilderConfig {
        downsampling_factor: factor,
        precision: Precision::Float32,
        ..ModelBuilderConfig::default()
    })
    .unwrap();
    match builder.build(&synthetic_dataset(4), &reference()).unwrap() {
        BuildOutput::Model(model) => model,
        BuildOutput::Empty => panic!("synthetic dataset must not be empty"),
    }
}

/// Store a built model under one resolution, chunked by cell.
fn store_model(store: &InMemoryStore, resolution: u32, model: &PodModel) -> Vec<u64> {
    store.store_artifact(resolution, &model.artifact).unwrap();
    let chunks = split_into_chunks(&model.table);
    let mut cells: Vec<u64> = chunks.keys().copied().collect();
    for (cell, chunk) in &chunks {
        store.store_chunk(resolution, *cell, chunk).unwrap();
    }
    cells.sort_unstable();
    cells
}

#[test]
fn test_build_store_reconstruct_round_trip() {
    let model = build_model(1);
    let store = Arc::new(InMemoryStore::new());
    let cells = store_model(&store, 1, &model);
    assert!(!cells.is_empty());

    let reconstructor = FieldReconstructor::new(Arc::clone(&store) as Arc<_>);
    let mut total = 0;
    for &cell in &cells {
        let field = reconstructor.field(1, cell, 2.5, 123.4).unwrap();
        assert_eq!(field.lat.len(), field.u.len());
        assert!(field.u.iter().all(|v| v.is_finite()));
        total += field.len();
    }
    assert_eq!(total, model.table.num_points());

    // All reconstructed points sit in the operating region.
    let field = reconstructor.field(1, cells[0], 2.5, 123.4).unwrap();
    for i in 0..field.len() {
        assert!(field.lat[i] > 52.0 && field.lat[i] < 53.0);
        assert!(field.lon[i] > 13.0 && field.lon[i] < 14.0);
        assert_eq!(field.z[i], 35);
    }
}

#[test]
fn test_stored_direction_reproduced_through_pipeline() {
    let model = build_model(1);
    let store = Arc::new(InMemoryStore::new());
    let cells = store_model(&store, 1, &model);
    let reconstructor = FieldReconstructor::new(Arc::clone(&store) as Arc<_>);

    // Query exactly at the first sample's reference direction: the blend
    // must reproduce that basis column, mean-added and speed-scaled.
    let wd = model.artifact.wd_ref[0];
    let ws = 3.0f32;
    let chunk = store.fetch_chunk(1, cells[0]).unwrap().unwrap();
    let field = reconstructor.field(1, cells[0], ws, wd).unwrap();
    for i in 0..field.len() {
        let expected = (chunk.mean_u[i] + chunk.basis_u[(i, 0)]) * ws;
        assert_relative_eq!(field.u[i], expected, epsilon = 1e-6);
        let expected = (chunk.mean_w[i] + chunk.basis_w[(i, 0)]) * ws;
        assert_relative_eq!(field.w[i], expected, epsilon = 1e-6);
    }
}

#[test]
fn test_speed_scaling_through_pipeline() {
    let model = build_model(2);
    let store = Arc::new(InMemoryStore::new());
    let cells = store_model(&store, 2, &model);
    let reconstructor = FieldReconstructor::new(Arc::clone(&store) as Arc<_>);

    let one = reconstructor.field(2, cells[0], 1.0, 200.0).unwrap();
    let two = reconstructor.field(2, cells[0], 2.0, 200.0).unwrap();
    assert!(!one.is_empty());
    for i in 0..one.len() {
        assert_relative_eq!(two.u[i], 2.0 * one.u[i], epsilon = 1e-5);
        assert_relative_eq!(two.v[i], 2.0 * one.v[i], epsilon = 1e-5);
        assert_relative_eq!(two.w[i], 2.0 * one.w[i], epsilon = 1e-5);
    }
}

#[test]
fn test_downsampled_resolution_has_fewer_points() {
    let fine = build_model(1);
    let coarse = build_model(2);
    assert!(coarse.table.num_points() <= fine.table.num_points() / 4);
    assert!(coarse.table.num_points() > 0);
}

#[test]
fn test_missing_chunk_vs_unknown_resolution() {
    let model = build_model(1);
    let store = Arc::new(InMemoryStore::new());
    store_model(&store, 1, &model);
    let reconstructor = FieldReconstructor::new(Arc::clone(&store) as Arc<_>);

    // Known resolution, nonexistent chunk: a normal empty result.
    let field = reconstructor.field(1, 0xdead_beef, 1.0, 10.0).unwrap();
    assert!(field.is_empty());

    // Unknown resolution: an explicit error.
    assert!(matches!(
        reconstructor.field(3, 1, 1.0, 10.0),
        Err(ReconstructError::UnknownResolution(3))
    ));
}
