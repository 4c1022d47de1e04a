// ============================================================
// Layer 2 — ExtractUseCase
// ============================================================
// Builds the tile store that training reads from:
//
//   Step 1: Validate tiling parameters
//   Step 2: Load the slide table          (Layer 4 - data)
//   Step 3: Load tile labels, if given    (Layer 4 - data)
//   Step 4: Fit the stain normalizer      (Layer 4 - data)
//   Step 5: Open the store + manifest     (Layer 6 - infra)
//   Step 6: For every slide: read level → extract top_n tiles
//           → label → write real tiles
//
// A slide that cannot be read is logged and skipped; the rest of
// the run carries on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::data::{
    labels::{CsvSlideSource, TileLabelMap},
    slide_reader::{PyramidLevel, SlideReader},
    stain::ReinhardNormalizer,
    tiler::{TileExtractor, TilingConfig},
};
use crate::domain::{
    slide::NUM_ISUP_GRADES,
    tile::Tile,
    traits::{BackgroundMask, SlideSource, StainNormalizer},
};
use crate::infra::tile_store::{StoreManifest, TileStoreWriter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub slides_dir:      PathBuf,
    pub slide_table:     PathBuf,
    /// tile_name,tile_label CSV; tiles without a row get -1.
    pub tile_labels:     Option<PathBuf>,
    pub store:           PathBuf,
    pub tiling:          TilingConfig,
    pub level:           PyramidLevel,
    pub normalize:       bool,
    /// Tile to measure the Reinhard target from instead of the
    /// built-in PANDA target.
    pub stain_reference: Option<PathBuf>,
    pub n_tile_classes:  usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            slides_dir:      "data/train_images".into(),
            slide_table:     "data/train.csv".into(),
            tile_labels:     None,
            store:           "data/tiles.sqlite".into(),
            tiling:          TilingConfig::default(),
            level:           PyramidLevel::Lowest,
            normalize:       true,
            stain_reference: None,
            n_tile_classes:  NUM_ISUP_GRADES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub slides_written: usize,
    pub slides_failed:  usize,
    pub tiles_written:  usize,
}

pub struct ExtractUseCase {
    config: ExtractConfig,
}

impl ExtractUseCase {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<ExtractSummary> {
        let cfg = &self.config;

        // ── Step 1: Validate ──────────────────────────────────────────────────
        cfg.tiling.validate()?;

        // ── Step 2: Slides ────────────────────────────────────────────────────
        let slides = CsvSlideSource::new(&cfg.slide_table).load_slides()?;

        // ── Step 3: Tile labels ───────────────────────────────────────────────
        let labels = match &cfg.tile_labels {
            Some(path) => TileLabelMap::load(path, cfg.n_tile_classes)?,
            None => TileLabelMap::default(),
        };

        // ── Step 4: Stain normalizer ──────────────────────────────────────────
        let normalizer = if cfg.normalize { Some(self.fit_normalizer()?) } else { None };

        // ── Step 5: Store ─────────────────────────────────────────────────────
        let manifest = StoreManifest {
            tiling:     cfg.tiling.clone(),
            level:      cfg.level,
            normalizer: normalizer.as_ref().map(ReinhardNormalizer::target),
        };
        let mut writer = TileStoreWriter::create(&cfg.store, &manifest)?;
        let extractor  = TileExtractor::new(cfg.tiling.clone());
        tracing::info!(
            "Extracting {} tiles of {}px from {} slides into '{}'",
            cfg.tiling.top_n, cfg.tiling.tile_size, slides.len(), cfg.store.display(),
        );

        // ── Step 6: Slides → tiles ────────────────────────────────────────────
        let mut summary = ExtractSummary::default();
        for (i, slide) in slides.iter().enumerate() {
            let image = SlideReader::open_in(&cfg.slides_dir, &slide.image_id)
                .and_then(|reader| reader.read_level(cfg.level));
            let image = match image {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!("Skipping slide '{}': {e:#}", slide.image_id);
                    summary.slides_failed += 1;
                    continue;
                }
            };

            let selection = extractor.extract(
                &image,
                normalizer.as_ref().map(|n| n as &dyn StainNormalizer),
            );
            let informative = selection.informative_count;

            let tiles: Vec<(String, Tile)> = selection
                .tiles
                .into_iter()
                .filter_map(|mut tile| {
                    let name = slide.tile_name(tile.source_index?);
                    tile.label = labels.get(&name);
                    Some((name, tile))
                })
                .collect();
            let refs: Vec<(String, &Tile)> = tiles.iter().map(|(n, t)| (n.clone(), t)).collect();

            let written = writer.write_slide(&slide.image_id, &refs)?;
            summary.slides_written += 1;
            summary.tiles_written  += written;
            tracing::debug!(
                "[{}/{}] '{}': {} informative, {} stored",
                i + 1, slides.len(), slide.image_id, informative, written,
            );
        }

        tracing::info!(
            "Extraction done: {} slides, {} tiles, {} slides skipped",
            summary.slides_written, summary.tiles_written, summary.slides_failed,
        );
        Ok(summary)
    }

    fn fit_normalizer(&self) -> Result<ReinhardNormalizer> {
        let mut normalizer = ReinhardNormalizer::new();
        if let Some(path) = &self.config.stain_reference {
            let reference = image::open(path)
                .with_context(|| format!("Cannot read stain reference '{}'", path.display()))?
                .to_rgb8();
            let mask = BackgroundMask::from_threshold(&reference, self.config.tiling.background_threshold);
            if normalizer.fit_image(&reference, &mask) {
                tracing::info!("Stain target measured from '{}'", path.display());
            } else {
                tracing::warn!(
                    "Stain reference '{}' has no tissue, keeping the default target",
                    path.display()
                );
            }
        }
        Ok(normalizer)
    }
}
