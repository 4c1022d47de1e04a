// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands `extract`, `train`, `predict`
// and all their flags.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::{
    extract_use_case::ExtractConfig,
    predict_use_case::PredictConfig,
    train_use_case::TrainConfig,
};
use crate::data::{
    slide_reader::PyramidLevel,
    tiler::{LowTileMode, TilingConfig},
};
use crate::infra::checkpoint::CheckpointChoice;
use crate::ml::{
    device::DeviceKind,
    loss::LossType,
    mil::MilArch,
    model::MilModelConfig,
    trainer::LrSchedule,
};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Tile slides into a tile store
    Extract(ExtractArgs),

    /// Train the MIL model from a tile store
    Train(TrainArgs),

    /// Grade slides with a trained checkpoint
    Predict(PredictArgs),
}

fn parse_low_tile_mode(s: &str) -> Result<LowTileMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "blank"  => Ok(LowTileMode::Blank),
        "random" => Ok(LowTileMode::Random),
        other    => Err(format!("unknown low tile mode '{other}' (expected blank or random)")),
    }
}

// ─── extract ──────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Directory holding <image_id>.tiff slides
    #[arg(long, default_value = "data/train_images")]
    pub slides_dir: PathBuf,

    /// Slide table CSV (image_id,data_provider,isup_grade,gleason_score)
    #[arg(long, default_value = "data/train.csv")]
    pub slide_table: PathBuf,

    /// Optional tile label CSV (tile_name,tile_label)
    #[arg(long)]
    pub tile_labels: Option<PathBuf>,

    /// Tile store file to create or extend
    #[arg(long, default_value = "data/tiles.sqlite")]
    pub store: PathBuf,

    /// Pyramid level to tile: an index (0 = full resolution) or "lowest"
    #[arg(long, default_value = "lowest")]
    pub level: PyramidLevel,

    #[arg(long, default_value_t = 256)]
    pub tile_size: u32,

    /// Fraction of a tile shared with its neighbour
    #[arg(long, default_value_t = 0.0)]
    pub overlap: f32,

    /// Tiles kept per slide
    #[arg(long, default_value_t = 36)]
    pub top_n: usize,

    /// Pixels brighter than this on every channel are background
    #[arg(long, default_value_t = 220)]
    pub background_threshold: u8,

    /// Tissue fraction a tile must exceed to be informative
    #[arg(long, default_value_t = 0.0)]
    pub min_tissue_fraction: f32,

    /// Integer downsample applied to the level before tiling
    #[arg(long, default_value_t = 1)]
    pub downsample: u32,

    /// How to fill bags short of informative tiles: blank | random
    #[arg(long, default_value = "blank", value_parser = parse_low_tile_mode)]
    pub low_tile_mode: LowTileMode,

    /// Skip Reinhard stain normalization
    #[arg(long)]
    pub no_normalize: bool,

    /// Reference tile to measure the Reinhard target from
    #[arg(long)]
    pub stain_reference: Option<PathBuf>,

    /// Number of tile label classes (larger labels become -1)
    #[arg(long, default_value_t = 6)]
    pub n_tile_classes: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl From<ExtractArgs> for ExtractConfig {
    fn from(a: ExtractArgs) -> Self {
        ExtractConfig {
            slides_dir:  a.slides_dir,
            slide_table: a.slide_table,
            tile_labels: a.tile_labels,
            store:       a.store,
            tiling: TilingConfig {
                tile_size:            a.tile_size,
                overlap:              a.overlap,
                background_threshold: a.background_threshold,
                min_tissue_fraction:  a.min_tissue_fraction,
                downsample:           a.downsample,
                top_n:                a.top_n,
                low_tile_mode:        a.low_tile_mode,
                seed:                 a.seed,
            },
            level:           a.level,
            normalize:       !a.no_normalize,
            stain_reference: a.stain_reference,
            n_tile_classes:  a.n_tile_classes,
        }
    }
}

// ─── train ────────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(long, default_value = "data/train.csv")]
    pub slide_table: PathBuf,

    /// Tile store written by `extract`
    #[arg(long, default_value = "data/tiles.sqlite")]
    pub tile_store: PathBuf,

    /// Checkpoints go to <dir>/fold_<k>, metrics to <dir>/metrics.csv
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// JSON file whose keys override these flags
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tile backbone: cnn-4 | resnet-lite-4 | resnet-lite-6
    #[arg(long, default_value = "resnet-lite-4")]
    pub backbone: String,

    /// Backbone record to start from
    #[arg(long)]
    pub pretrained: Option<PathBuf>,

    /// attention_per_sample | attention_batched | pool
    #[arg(long, default_value = "attention_batched")]
    pub arch: MilArch,

    /// ce | mse
    #[arg(long, default_value = "ce")]
    pub loss_type: LossType,

    /// Tile loss weight: 0 = slide loss only, 1 = tile loss only
    #[arg(long, default_value_t = 0.0)]
    pub alpha: f64,

    /// Weight the slide CE loss by inverse class frequency
    #[arg(long)]
    pub class_weighted: bool,

    /// Let padding tiles take part in attention
    #[arg(long)]
    pub no_mask_padding: bool,

    #[arg(long, default_value_t = 6)]
    pub n_slide_classes: usize,

    #[arg(long, default_value_t = 6)]
    pub n_tile_classes: usize,

    #[arg(long, default_value_t = 512)]
    pub bag_embed_dim: usize,

    #[arg(long, default_value_t = 256)]
    pub bag_hidden_dim: usize,

    #[arg(long, default_value_t = 0.5)]
    pub dropout: f64,

    #[arg(long, default_value_t = 30)]
    pub epochs: usize,

    /// Bags per batch
    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 3e-4)]
    pub lr: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,

    /// constant | linear | cosine
    #[arg(long, default_value = "constant")]
    pub schedule: LrSchedule,

    /// Print running losses every N updates
    #[arg(long, default_value_t = 50)]
    pub log_every: usize,

    /// Network input size; tiles are resized to it
    #[arg(long, default_value_t = 256)]
    pub input_size: u32,

    #[arg(long, default_value_t = 4)]
    pub n_folds: usize,

    /// Train only this fold (default: all folds)
    #[arg(long)]
    pub fold: Option<usize>,

    /// DataLoader worker threads
    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// cpu | wgpu
    #[arg(long, default_value = "cpu")]
    pub device: DeviceKind,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        let model = MilModelConfig::new(a.backbone)
            .with_n_slide_classes(a.n_slide_classes)
            .with_n_tile_classes(a.n_tile_classes)
            .with_loss_type(a.loss_type)
            .with_arch(a.arch)
            .with_mask_padding(!a.no_mask_padding)
            .with_bag_embed_dim(a.bag_embed_dim)
            .with_bag_hidden_dim(a.bag_hidden_dim)
            .with_dropout(a.dropout)
            .with_pretrained(a.pretrained);
        TrainConfig {
            slide_table:    a.slide_table,
            tile_store:     a.tile_store,
            checkpoint_dir: a.checkpoint_dir,
            model,
            alpha:          a.alpha,
            class_weighted: a.class_weighted,
            epochs:         a.epochs,
            batch_size:     a.batch_size,
            lr:             a.lr,
            weight_decay:   a.weight_decay,
            schedule:       a.schedule,
            log_every:      a.log_every,
            input_size:     a.input_size,
            n_folds:        a.n_folds,
            fold:           a.fold,
            num_workers:    a.num_workers,
            seed:           a.seed,
            manifest:       None,
        }
    }
}

// ─── predict ──────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Fold directory written by `train`, e.g. checkpoints/fold_0
    #[arg(long, default_value = "checkpoints/fold_0")]
    pub checkpoint_dir: PathBuf,

    /// best | latest | <epoch>
    #[arg(long, default_value = "best")]
    pub checkpoint: CheckpointChoice,

    #[arg(long, default_value = "data/test_images")]
    pub slides_dir: PathBuf,

    /// Slide table; only image_id is needed
    #[arg(long, default_value = "data/test.csv")]
    pub slide_table: PathBuf,

    #[arg(long, default_value = "predictions.csv")]
    pub output: PathBuf,

    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 2)]
    pub num_workers: usize,

    /// cpu | wgpu
    #[arg(long, default_value = "cpu")]
    pub device: DeviceKind,
}

impl From<PredictArgs> for PredictConfig {
    fn from(a: PredictArgs) -> Self {
        PredictConfig {
            checkpoint_dir: a.checkpoint_dir,
            checkpoint:     a.checkpoint,
            slides_dir:     a.slides_dir,
            slide_table:    a.slide_table,
            output:         a.output,
            batch_size:     a.batch_size,
            num_workers:    a.num_workers,
        }
    }
}
