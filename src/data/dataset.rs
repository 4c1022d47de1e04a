// ============================================================
// Layer 4 — Slide Datasets
// ============================================================
// Implements Burn's Dataset trait for bags of tiles.
//
// Two sources produce the same SlideItem:
//
//   StoredSlideDataset  → tiles pre-extracted into the tile store
//                         (training and validation)
//   SlideImageDataset   → tiles cut from the slide file on the fly
//                         (prediction)
//
// Every item is a full bag: exactly `top_n` tiles, already
// transformed to channel-first floats, with a real/padding mask
// and one weak label per tile. `get` runs inside the DataLoader
// worker threads, so the expensive work (decoding, normalizing,
// resizing) happens off the training thread.
//
// A slide that cannot be read becomes an all-blank bag and a
// warning instead of an error, so one damaged file cannot stop
// an epoch.

use burn::data::dataset::Dataset;
use std::{path::PathBuf, sync::Arc};

use crate::data::{
    slide_reader::{PyramidLevel, SlideReader},
    tiler::TileExtractor,
    transform::TileTransform,
};
use crate::domain::{
    slide::Slide,
    tile::{Bag, TileLabel},
    traits::StainNormalizer,
};
use crate::infra::tile_store::TileStore;

/// Slide label used for unlabelled slides.
pub const NO_SLIDE_LABEL: i32 = -1;

/// One bag ready for batching.
#[derive(Debug, Clone)]
pub struct SlideItem {
    pub image_id:    String,
    /// `[n_tiles, 3, size, size]` flattened, channel-first.
    pub tiles:       Vec<f32>,
    /// true for real tiles, false for padding.
    pub real_mask:   Vec<bool>,
    /// One per tile, `-1` for missing / invalid.
    pub tile_labels: Vec<i32>,
    pub slide_label: i32,
}

impl SlideItem {
    pub fn n_tiles(&self) -> usize {
        self.real_mask.len()
    }

    /// Turn a bag into an item. `n_tile_classes` re-checks stored
    /// labels against the model's tile head.
    pub fn from_bag(
        bag:            &Bag,
        slide_label:    Option<u8>,
        transform:      &TileTransform,
        n_tile_classes: usize,
    ) -> Self {
        let mut tiles = Vec::with_capacity(bag.len() * transform.tile_len());
        for tile in &bag.tiles {
            transform.apply_into(&tile.pixels, &mut tiles);
        }
        let tile_labels = bag
            .tiles
            .iter()
            .map(|t| TileLabel::checked(t.label.raw() as i64, n_tile_classes).raw())
            .collect();

        Self {
            image_id:    bag.slide_id.clone(),
            tiles,
            real_mask:   bag.real_mask(),
            tile_labels,
            slide_label: slide_label.map(i32::from).unwrap_or(NO_SLIDE_LABEL),
        }
    }
}

/// Shape shared by every bag a dataset yields.
#[derive(Debug, Clone)]
pub struct BagShape {
    pub top_n:          usize,
    /// Edge of the stored / extracted tiles, used for blank padding.
    pub tile_size:      u32,
    pub n_tile_classes: usize,
}

// ─── StoredSlideDataset ───────────────────────────────────────────────────────
pub struct StoredSlideDataset {
    store:     Arc<TileStore>,
    slides:    Vec<Slide>,
    transform: TileTransform,
    shape:     BagShape,
}

impl StoredSlideDataset {
    pub fn new(
        store:     Arc<TileStore>,
        slides:    Vec<Slide>,
        transform: TileTransform,
        shape:     BagShape,
    ) -> Self {
        Self { store, slides, transform, shape }
    }

    pub fn slides(&self) -> &[Slide] {
        &self.slides
    }

    fn load_bag(&self, slide: &Slide) -> Bag {
        let tiles = match self.store.slide_tiles(&slide.image_id) {
            Ok(tiles) => tiles,
            Err(e) => {
                tracing::warn!("Cannot read tiles of '{}': {e:#}", slide.image_id);
                Vec::new()
            }
        };
        if tiles.is_empty() {
            tracing::debug!("Slide '{}' has no stored tiles", slide.image_id);
        }

        let mut tiles: Vec<_> = tiles.into_iter().map(|t| t.tile).collect();
        tiles.truncate(self.shape.top_n);
        let mut bag = Bag::new(slide.image_id.clone(), tiles);
        bag.pad_to(self.shape.top_n, self.shape.tile_size);
        bag
    }
}

impl Dataset<SlideItem> for StoredSlideDataset {
    fn get(&self, index: usize) -> Option<SlideItem> {
        let slide = self.slides.get(index)?;
        let bag   = self.load_bag(slide);
        Some(SlideItem::from_bag(&bag, slide.label(), &self.transform, self.shape.n_tile_classes))
    }

    fn len(&self) -> usize {
        self.slides.len()
    }
}

// ─── SlideImageDataset ────────────────────────────────────────────────────────
pub struct SlideImageDataset {
    slides_dir: PathBuf,
    slides:     Vec<Slide>,
    level:      PyramidLevel,
    extractor:  TileExtractor,
    normalizer: Option<Arc<dyn StainNormalizer>>,
    transform:  TileTransform,
    n_tile_classes: usize,
}

impl SlideImageDataset {
    pub fn new(
        slides_dir: impl Into<PathBuf>,
        slides:     Vec<Slide>,
        level:      PyramidLevel,
        extractor:  TileExtractor,
        normalizer: Option<Arc<dyn StainNormalizer>>,
        transform:  TileTransform,
        n_tile_classes: usize,
    ) -> Self {
        Self {
            slides_dir: slides_dir.into(),
            slides,
            level,
            extractor,
            normalizer,
            transform,
            n_tile_classes,
        }
    }

    fn load_bag(&self, slide: &Slide) -> Bag {
        let cfg = self.extractor.config();
        let image = SlideReader::open_in(&self.slides_dir, &slide.image_id)
            .and_then(|r| r.read_level(self.level));
        match image {
            Ok(image) => self
                .extractor
                .extract(&image, self.normalizer.as_deref())
                .into_bag(slide.image_id.clone()),
            Err(e) => {
                tracing::warn!(
                    "Cannot read slide '{}', using a blank bag: {e:#}",
                    slide.image_id
                );
                Bag::blank(slide.image_id.clone(), cfg.top_n, cfg.tile_size)
            }
        }
    }
}

impl Dataset<SlideItem> for SlideImageDataset {
    fn get(&self, index: usize) -> Option<SlideItem> {
        let slide = self.slides.get(index)?;
        let bag   = self.load_bag(slide);
        Some(SlideItem::from_bag(&bag, slide.label(), &self.transform, self.n_tile_classes))
    }

    fn len(&self) -> usize {
        self.slides.len()
    }
}
