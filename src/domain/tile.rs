// ============================================================
// Layer 3 — Tiles and Bags
// ============================================================
// A Tile is a square RGB patch cut out of one pyramid level.
// A Bag is the fixed-size collection of tiles standing in for a
// whole slide in multiple-instance learning.
//
// Bags are always exactly `top_n` long. Slides that do not yield
// enough informative tiles are padded with blank tiles: pure
// white patches with no source index.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Pixel value used for padding and blank tiles.
pub const BLANK_VALUE: u8 = 255;

/// A weak tile-level grade. Stored as a plain integer so it can
/// travel through CSV, the tile store and Int tensors unchanged;
/// `-1` marks a missing or unusable label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileLabel(i32);

impl TileLabel {
    pub const INVALID: TileLabel = TileLabel(-1);

    /// Wrap a raw value, mapping anything outside `0..n_classes`
    /// to the sentinel.
    pub fn checked(raw: i64, n_classes: usize) -> Self {
        if raw >= 0 && (raw as usize) < n_classes {
            TileLabel(raw as i32)
        } else {
            TileLabel::INVALID
        }
    }

    /// Wrap a stored value without a class range; negatives become
    /// the sentinel.
    pub fn from_raw(raw: i64) -> Self {
        Self::checked(raw, i32::MAX as usize)
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl Default for TileLabel {
    fn default() -> Self {
        TileLabel::INVALID
    }
}

/// One extracted tile plus the scores used to select it.
#[derive(Debug, Clone)]
pub struct Tile {
    pub pixels:          RgbImage,
    /// Row-major grid index in the padded slide; None for blank padding.
    pub source_index:    Option<usize>,
    /// Sum of every channel byte. Lower means more tissue.
    pub intensity_sum:   u64,
    /// Fraction of pixels that are not background.
    pub tissue_fraction: f32,
    pub label:           TileLabel,
}

impl Tile {
    /// An all-white padding tile.
    pub fn blank(size: u32) -> Self {
        let pixels = RgbImage::from_pixel(size, size, Rgb([BLANK_VALUE; 3]));
        let intensity_sum = size as u64 * size as u64 * 3 * BLANK_VALUE as u64;
        Self {
            pixels,
            source_index: None,
            intensity_sum,
            tissue_fraction: 0.0,
            label: TileLabel::INVALID,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.source_index.is_none()
    }

    pub fn size(&self) -> u32 {
        self.pixels.width()
    }
}

/// All tiles for one slide, in selection order.
#[derive(Debug, Clone)]
pub struct Bag {
    pub slide_id: String,
    pub tiles:    Vec<Tile>,
}

impl Bag {
    pub fn new(slide_id: impl Into<String>, tiles: Vec<Tile>) -> Self {
        Self { slide_id: slide_id.into(), tiles }
    }

    /// Bag of `n` blank tiles, used when a slide cannot be read.
    pub fn blank(slide_id: impl Into<String>, n: usize, size: u32) -> Self {
        Self::new(slide_id, (0..n).map(|_| Tile::blank(size)).collect())
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn real_tile_count(&self) -> usize {
        self.tiles.iter().filter(|t| !t.is_blank()).count()
    }

    /// true for tiles that came from the slide, false for padding.
    pub fn real_mask(&self) -> Vec<bool> {
        self.tiles.iter().map(|t| !t.is_blank()).collect()
    }

    /// Pad with blank tiles up to `n`. Never truncates.
    pub fn pad_to(&mut self, n: usize, size: u32) {
        while self.tiles.len() < n {
            self.tiles.push(Tile::blank(size));
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_sentinel() {
        assert_eq!(TileLabel::checked(3, 6).raw(), 3);
        assert_eq!(TileLabel::checked(-1, 6), TileLabel::INVALID);
        assert_eq!(TileLabel::checked(6, 6), TileLabel::INVALID);
        assert!(!TileLabel::default().is_valid());
    }

    #[test]
    fn test_blank_tile_is_white() {
        let t = Tile::blank(4);
        assert!(t.is_blank());
        assert!(t.pixels.pixels().all(|p| p.0 == [255, 255, 255]));
        assert_eq!(t.intensity_sum, 4 * 4 * 3 * 255);
    }

    #[test]
    fn test_bag_padding_and_mask() {
        let mut real = Tile::blank(4);
        real.source_index = Some(7);
        let mut bag = Bag::new("s1", vec![real]);
        bag.pad_to(3, 4);
        assert_eq!(bag.len(), 3);
        assert_eq!(bag.real_tile_count(), 1);
        assert_eq!(bag.real_mask(), vec![true, false, false]);

        // pad_to never shrinks
        bag.pad_to(1, 4);
        assert_eq!(bag.len(), 3);
    }
}
