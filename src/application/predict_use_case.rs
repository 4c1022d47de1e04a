// ============================================================
// Layer 2 — PredictUseCase
// ============================================================
// Grades slides with a trained checkpoint:
//
//   Step 1: Load train_config.json + weights  (Layer 6 - infra)
//   Step 2: Load the slide table              (Layer 4 - data)
//   Step 3: Rebuild the extractor and stain
//           normalizer from the manifest      (Layer 4 - data)
//   Step 4: Tile on the fly + run the model   (Layer 5 - ml)
//   Step 5: Write image_id,isup_grade         (Layer 6 - infra)
//
// Unreadable slides are graded from an all-blank bag and logged.

use anyhow::{Context, Result};
use burn::{data::dataset::Dataset, prelude::Backend};
use std::{path::PathBuf, sync::Arc};

use crate::data::{
    dataset::SlideImageDataset,
    labels::CsvSlideSource,
    stain::ReinhardNormalizer,
    tiler::TileExtractor,
    transform::TileTransform,
};
use crate::domain::traits::{SlideSource, StainNormalizer};
use crate::infra::{
    checkpoint::{CheckpointChoice, CheckpointManager},
    predictions::{write_predictions, SlidePrediction},
};
use crate::ml::inferencer::SlidePredictor;

#[derive(Debug, Clone)]
pub struct PredictConfig {
    /// A fold directory written by `train` (holds train_config.json).
    pub checkpoint_dir: PathBuf,
    pub checkpoint:     CheckpointChoice,
    pub slides_dir:     PathBuf,
    pub slide_table:    PathBuf,
    pub output:         PathBuf,
    pub batch_size:     usize,
    pub num_workers:    usize,
}

pub struct PredictUseCase {
    config: PredictConfig,
}

impl PredictUseCase {
    pub fn new(config: PredictConfig) -> Self {
        Self { config }
    }

    pub fn execute<B: Backend>(&self, device: &B::Device) -> Result<Vec<SlidePrediction>> {
        let cfg = &self.config;

        // ── Step 1: Model ─────────────────────────────────────────────────────
        let ckpt      = CheckpointManager::new(&cfg.checkpoint_dir)?;
        let predictor = SlidePredictor::<B>::from_checkpoint(&ckpt, cfg.checkpoint, device)?;
        let train_cfg = predictor.config();
        let manifest  = train_cfg.manifest.clone().with_context(|| {
            format!(
                "'{}' has no tiling manifest; it was not written by 'train'",
                cfg.checkpoint_dir.display()
            )
        })?;

        // ── Step 2: Slides ────────────────────────────────────────────────────
        let slides = CsvSlideSource::new(&cfg.slide_table).load_slides()?;

        // ── Step 3: Tiling as at training time ────────────────────────────────
        let normalizer: Option<Arc<dyn StainNormalizer>> = manifest.normalizer.map(|target| {
            let mut n = ReinhardNormalizer::new();
            n.fit(Some(target));
            Arc::new(n) as Arc<dyn StainNormalizer>
        });
        let dataset = SlideImageDataset::new(
            &cfg.slides_dir,
            slides,
            manifest.level,
            TileExtractor::new(manifest.tiling.clone()),
            normalizer,
            TileTransform::new(train_cfg.input_size),
            train_cfg.model.n_tile_classes,
        );
        tracing::info!(
            "Predicting {} slides ({} tiles of {}px each)",
            dataset.len(), manifest.tiling.top_n, manifest.tiling.tile_size,
        );

        // ── Step 4: Run ───────────────────────────────────────────────────────
        let rows = predictor.predict(dataset, cfg.batch_size, cfg.num_workers)?;

        // ── Step 5: Write ─────────────────────────────────────────────────────
        write_predictions(&cfg.output, &rows)?;
        Ok(rows)
    }
}
