// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses the command line with `clap` and routes each subcommand
// to its Layer 2 use case. Backend selection happens here, so the
// use cases stay generic over the burn backend.
//
// Three commands are supported:
//   1. `extract` — tiles slides into a tile store
//   2. `train`   — cross-validated MIL training from the store
//   3. `predict` — grades slides with a saved checkpoint
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, ExtractArgs, PredictArgs, TrainArgs};

use crate::application::{
    extract_use_case::ExtractUseCase,
    predict_use_case::PredictUseCase,
    train_use_case::{TrainConfig, TrainUseCase},
};
use crate::ml::device::{
    cpu_device, wgpu_device, CpuBackend, CpuTrainBackend, DeviceKind, GpuBackend, GpuTrainBackend,
};

#[derive(Parser, Debug)]
#[command(
    name = "panda-mil",
    version = "0.1.0",
    about = "Tile prostate biopsy slides, train an attention MIL grader, predict ISUP grades."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Extract(args) => run_extract(args),
            Commands::Train(args)   => run_train(args),
            Commands::Predict(args) => run_predict(args),
        }
    }
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    tracing::info!("Extracting tiles from slides in: {}", args.slides_dir.display());

    let summary = ExtractUseCase::new(args.into()).execute()?;

    println!(
        "Extraction complete: {} slides, {} tiles ({} slides skipped).",
        summary.slides_written, summary.tiles_written, summary.slides_failed
    );
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    let device    = args.device;
    let overrides = args.config.clone();

    let mut config: TrainConfig = args.into();
    if let Some(path) = overrides {
        config = config.with_overrides(&path)?;
    }
    tracing::info!("Training on tile store: {} ({device})", config.tile_store.display());

    let use_case  = TrainUseCase::new(config);
    let summaries = match device {
        DeviceKind::Cpu  => use_case.execute::<CpuTrainBackend>(&cpu_device())?,
        DeviceKind::Wgpu => use_case.execute::<GpuTrainBackend>(&wgpu_device())?,
    };

    println!("Training complete.");
    for s in &summaries {
        println!("  fold {}: best kappa {:.4} at epoch {}", s.fold, s.best_kappa, s.best_epoch);
    }
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let device = args.device;
    tracing::info!("Predicting with checkpoint in: {}", args.checkpoint_dir.display());

    let use_case = PredictUseCase::new(args.into());
    let rows = match device {
        DeviceKind::Cpu  => use_case.execute::<CpuBackend>(&cpu_device())?,
        DeviceKind::Wgpu => use_case.execute::<GpuBackend>(&wgpu_device())?,
    };

    println!("Graded {} slides.", rows.len());
    Ok(())
}
