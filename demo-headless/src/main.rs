use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use nalgebra::DMatrix;
use windpod_core::{
    split_into_chunks, BuildOutput, ChunkModelBuilder, FieldReconstructor, InMemoryStore,
    JsonDirStore, ModelBuilderConfig, ModelStore, PodModel, Precision, ReferencePoint,
    SnapshotDataset,
};

/// Wind field model demo: build a reduced-order model from synthetic
/// snapshots, store it per chunk, and reconstruct a field for a live
/// wind condition.
#[derive(Parser, Debug)]
#[command(name = "windpod-demo")]
#[command(about = "Wind field POD model demo", long_about = None)]
struct Args {
    /// Number of wind-direction snapshots to synthesize
    #[arg(short, long, default_value_t = 8)]
    samples: usize,

    /// Grid side length in points (2m spacing)
    #[arg(long, default_value_t = 32)]
    side: usize,

    /// Downsampling factor (power of two)
    #[arg(short = 'f', long, default_value_t = 2)]
    factor: usize,

    /// Wind speed to reconstruct at, in m/s
    #[arg(short, long, default_value_t = 4.2)]
    wind_speed: f32,

    /// Wind direction to reconstruct at, in degrees (0=North, 90=East)
    #[arg(short = 'd', long, default_value_t = 135.0)]
    wind_direction: f32,

    /// Store half-precision basis columns
    #[arg(long)]
    half_precision: bool,

    /// Persist the model as JSON under this directory instead of in memory
    #[arg(short, long)]
    output: Option<std::path::PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    println!("=== Wind Field POD Demo ===\n");

    let dataset = synthetic_dataset(args.samples, args.side);
    println!(
        "Synthesized {} snapshots over {} points ({}x{} grid, 2m spacing)",
        dataset.num_samples(),
        dataset.num_points(),
        args.side,
        args.side
    );

    let reference = ReferencePoint::new(
        386_000.0 + args.side as f32,
        5_820_000.0 + args.side as f32,
        35.0,
    );
    let config = ModelBuilderConfig {
        downsampling_factor: args.factor,
        precision: if args.half_precision {
            Precision::Float16
        } else {
            Precision::Float32
        },
        ..ModelBuilderConfig::default()
    };
    let builder = ChunkModelBuilder::new(config)?;
    let model = match builder.build(&dataset, &reference)? {
        BuildOutput::Model(model) => model,
        BuildOutput::Empty => {
            println!("No blocks survived downsampling; nothing to store.");
            return Ok(());
        }
    };
    println!(
        "Built model at factor {}: {} points, {} direction columns",
        args.factor,
        model.table.num_points(),
        model.artifact.wd_ref.len()
    );
    print_directions(&model);

    let store: Arc<dyn ModelStore> = match &args.output {
        Some(dir) => {
            println!("Persisting to {}", dir.display());
            Arc::new(JsonDirStore::new(dir.clone()))
        }
        None => Arc::new(InMemoryStore::new()),
    };
    store.store_artifact(args.factor as u32, &model.artifact)?;
    let chunks = split_into_chunks(&model.table);
    let mut cells: Vec<u64> = chunks.keys().copied().collect();
    cells.sort_unstable();
    for (cell, chunk) in &chunks {
        store.store_chunk(args.factor as u32, *cell, chunk)?;
    }
    println!("Stored {} chunk(s)\n", cells.len());

    let reconstructor = FieldReconstructor::new(store);
    println!(
        "Reconstructing at ws {:.1} m/s, wd {:.1} deg",
        args.wind_speed, args.wind_direction
    );
    println!("Cell               | Points | Mean |u| (m/s) | Max |u| (m/s)");
    println!("-------------------|--------|---------------|--------------");
    for &cell in &cells {
        let field = reconstructor.field(
            args.factor as u32,
            cell,
            args.wind_speed,
            args.wind_direction,
        )?;
        let mut sum = 0.0f64;
        let mut max = 0.0f32;
        for i in 0..field.len() {
            let mag =
                (field.u[i] * field.u[i] + field.v[i] * field.v[i] + field.w[i] * field.w[i])
                    .sqrt();
            sum += f64::from(mag);
            max = max.max(mag);
        }
        let mean = if field.is_empty() { 0.0 } else { sum / field.len() as f64 };
        println!("{cell:18} | {:6} | {mean:13.3} | {max:12.3}", field.len());
    }

    println!("\n=== Demo Complete ===");
    Ok(())
}

fn print_directions(model: &PodModel) {
    print!("Reference directions (deg):");
    for wd in &model.artifact.wd_ref {
        print!(" {wd:.1}");
    }
    println!("\n");
}

/// Uniform rotating flow plus a spatial perturbation, one snapshot per
/// compass step.
fn synthetic_dataset(samples: usize, side: usize) -> SnapshotDataset {
    let mut x = Vec::with_capacity(side * side);
    let mut y = Vec::with_capacity(side * side);
    let mut z = Vec::with_capacity(side * side);
    for i in 0..side {
        for j in 0..side {
            x.push(386_000 + (i as i32) * 2);
            y.push(5_820_000 + (j as i32) * 2);
            z.push(35.0);
        }
    }
    let n = side * side;
    let step = std::f32::consts::TAU / samples.max(1) as f32;
    let ux = DMatrix::from_fn(samples, n, |s, p| {
        let angle = s as f32 * step;
        5.0 * angle.sin() + 0.05 * ((p % side) as f32).sin()
    });
    let uy = DMatrix::from_fn(samples, n, |s, p| {
        let angle = s as f32 * step;
        5.0 * angle.cos() + 0.05 * ((p / side) as f32).cos()
    });
    let uz = DMatrix::from_fn(samples, n, |_, p| 0.2 + 0.01 * (p % 7) as f32);
    SnapshotDataset::new(x, y, z, ux, uy, uz)
        .unwrap_or_else(|_| unreachable!("shapes match by construction"))
}
