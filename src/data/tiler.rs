// ============================================================
// Layer 4 — Tile Extractor
// ============================================================
// Cuts one pyramid level into a grid of square tiles and keeps
// the `top_n` most informative ones.
//
// How selection works:
//   1. Optionally downsample the level by an integer rate
//   2. Pad with white so the grid covers the image exactly
//      (padding split evenly on both sides)
//   3. Walk the grid row-major; tile index = row * cols + col
//   4. Score every tile:
//        intensity sum   = sum of every channel byte
//        tissue fraction = share of non-background pixels
//   5. Informative tiles (tissue fraction above the minimum)
//      are ranked by ascending intensity sum; background is
//      white, so a small sum means dense tissue
//   6. Keep the first `top_n`; if there are fewer, fill with
//      blank tiles (or, in random mode, with randomly chosen
//      low-information tiles first)
//
// Example with 8px tiles on a 10x10 image:
//   padded to 16x16 (3px white on the top/left, 3px bottom/right)
//   → 2x2 grid → indices 0..4
//
// The output length is always exactly `top_n`.

use image::{imageops, GenericImageView, Rgb, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::{
    tile::{Bag, Tile, TileLabel, BLANK_VALUE},
    traits::{BackgroundMask, StainNormalizer},
};
use crate::error::ConfigError;

/// What to put in the bag when a slide has fewer than `top_n`
/// informative tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LowTileMode {
    /// Pad with all-white tiles.
    #[default]
    Blank,
    /// Fill with low-information tiles chosen uniformly at random,
    /// then pad with blank tiles if still short.
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Edge length of a tile in pixels (after downsampling).
    pub tile_size:            u32,
    /// Fraction of a tile shared with its neighbour, in [0, 1).
    pub overlap:              f32,
    /// A pixel whose every channel is above this is background.
    pub background_threshold: u8,
    /// Tiles need strictly more tissue than this to be informative.
    pub min_tissue_fraction:  f32,
    /// Integer downsample rate applied before tiling.
    pub downsample:           u32,
    pub top_n:                usize,
    pub low_tile_mode:        LowTileMode,
    /// Only used in random low-tile mode.
    pub seed:                 u64,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size:            256,
            overlap:              0.0,
            background_threshold: 220,
            min_tissue_fraction:  0.0,
            downsample:           1,
            top_n:                36,
            low_tile_mode:        LowTileMode::Blank,
            seed:                 42,
        }
    }
}

impl TilingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size == 0 {
            return Err(ConfigError::out_of_range("tile_size", self.tile_size, "> 0"));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(ConfigError::out_of_range("overlap", self.overlap, "in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.min_tissue_fraction) {
            return Err(ConfigError::out_of_range(
                "min_tissue_fraction", self.min_tissue_fraction, "in [0, 1)",
            ));
        }
        if self.downsample == 0 {
            return Err(ConfigError::out_of_range("downsample", self.downsample, ">= 1"));
        }
        if self.top_n == 0 {
            return Err(ConfigError::out_of_range("top_n", self.top_n, "> 0"));
        }
        Ok(())
    }

    /// Step between neighbouring tile origins.
    pub fn stride(&self) -> u32 {
        let s = (self.tile_size as f32 * (1.0 - self.overlap)).round() as u32;
        s.clamp(1, self.tile_size)
    }
}

/// Result of tiling one slide.
#[derive(Debug, Clone)]
pub struct TileSelection {
    /// Exactly `top_n` tiles: informative ones first, then fillers.
    pub tiles:             Vec<Tile>,
    /// How many grid tiles passed the informativeness test.
    pub informative_count: usize,
    /// (rows, cols) of the grid.
    pub grid:              (u32, u32),
}

impl TileSelection {
    pub fn indices(&self) -> Vec<Option<usize>> {
        self.tiles.iter().map(|t| t.source_index).collect()
    }

    pub fn into_bag(self, slide_id: impl Into<String>) -> Bag {
        Bag::new(slide_id, self.tiles)
    }
}

/// Scores for one grid cell, computed before any pixels are copied.
#[derive(Debug, Clone, Copy)]
struct CellScore {
    index:           usize,
    x:               u32,
    y:               u32,
    intensity_sum:   u64,
    tissue_fraction: f32,
}

pub struct TileExtractor {
    cfg: TilingConfig,
}

impl TileExtractor {
    pub fn new(cfg: TilingConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &TilingConfig {
        &self.cfg
    }

    /// Extract with an RNG seeded from the config, so repeated
    /// calls on the same slide give the same tiles in every mode.
    pub fn extract(
        &self,
        image:      &RgbImage,
        normalizer: Option<&dyn StainNormalizer>,
    ) -> TileSelection {
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);
        self.extract_with_rng(image, normalizer, &mut rng)
    }

    pub fn extract_with_rng<R: Rng + ?Sized>(
        &self,
        image:      &RgbImage,
        normalizer: Option<&dyn StainNormalizer>,
        rng:        &mut R,
    ) -> TileSelection {
        let cfg = &self.cfg;

        // ── Step 1: Downsample ───────────────────────────────────────────────
        let downsampled;
        let image = if cfg.downsample > 1 {
            let w = (image.width() / cfg.downsample).max(1);
            let h = (image.height() / cfg.downsample).max(1);
            downsampled = imageops::resize(image, w, h, imageops::FilterType::Triangle);
            &downsampled
        } else {
            image
        };

        // ── Step 2: Pad to the grid ──────────────────────────────────────────
        let stride = cfg.stride();
        let (cols, padded_w) = grid_layout(image.width(), cfg.tile_size, stride);
        let (rows, padded_h) = grid_layout(image.height(), cfg.tile_size, stride);
        let canvas = pad_white(image, padded_w, padded_h);

        // ── Step 3–4: Score every cell ───────────────────────────────────────
        let scores: Vec<CellScore> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| {
                let (x, y) = (c * stride, r * stride);
                let (intensity_sum, tissue_fraction) =
                    score_cell(&canvas, x, y, cfg.tile_size, cfg.background_threshold);
                CellScore {
                    index: (r * cols + c) as usize,
                    x,
                    y,
                    intensity_sum,
                    tissue_fraction,
                }
            })
            .collect();

        // ── Step 5: Rank informative cells ───────────────────────────────────
        let (mut informative, mut low): (Vec<CellScore>, Vec<CellScore>) = scores
            .into_iter()
            .partition(|s| s.tissue_fraction > cfg.min_tissue_fraction);
        let informative_count = informative.len();
        informative.sort_by_key(|s| (s.intensity_sum, s.index));
        informative.truncate(cfg.top_n);

        // ── Step 6: Fill short bags ──────────────────────────────────────────
        let mut chosen = informative;
        if chosen.len() < cfg.top_n && cfg.low_tile_mode == LowTileMode::Random {
            let needed = cfg.top_n - chosen.len();
            low.shuffle(rng);
            low.truncate(needed);
            chosen.extend(low);
        }

        let mut tiles: Vec<Tile> = chosen
            .iter()
            .map(|s| {
                let pixels = imageops::crop_imm(&canvas, s.x, s.y, cfg.tile_size, cfg.tile_size)
                    .to_image();
                let pixels = match normalizer {
                    Some(n) => {
                        let mask = BackgroundMask::from_threshold(&pixels, cfg.background_threshold);
                        n.transform(&pixels, &mask)
                    }
                    None => pixels,
                };
                Tile {
                    pixels,
                    source_index:    Some(s.index),
                    intensity_sum:   s.intensity_sum,
                    tissue_fraction: s.tissue_fraction,
                    label:           TileLabel::INVALID,
                }
            })
            .collect();

        while tiles.len() < cfg.top_n {
            tiles.push(Tile::blank(cfg.tile_size));
        }

        tracing::trace!(
            "Tiled {}x{} grid: {} informative, {} kept",
            rows, cols, informative_count, chosen.len()
        );

        TileSelection { tiles, informative_count, grid: (rows, cols) }
    }
}

/// Number of grid positions along one axis and the padded length.
fn grid_layout(len: u32, tile: u32, stride: u32) -> (u32, u32) {
    if len <= tile {
        return (1, tile);
    }
    let n = (len - tile).div_ceil(stride) + 1;
    (n, (n - 1) * stride + tile)
}

fn pad_white(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([BLANK_VALUE; 3]));
    let off_x = (width - image.width()) / 2;
    let off_y = (height - image.height()) / 2;
    imageops::replace(&mut canvas, image, off_x as i64, off_y as i64);
    canvas
}

fn score_cell(canvas: &RgbImage, x: u32, y: u32, size: u32, threshold: u8) -> (u64, f32) {
    let view = canvas.view(x, y, size, size);
    let mut sum    = 0u64;
    let mut tissue = 0usize;
    for (_, _, px) in view.pixels() {
        sum += px.0.iter().map(|&v| v as u64).sum::<u64>();
        if !px.0.iter().all(|&c| c > threshold) {
            tissue += 1;
        }
    }
    (sum, tissue as f32 / (size as f32 * size as f32))
}
