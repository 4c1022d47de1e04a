// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The application layer talks to these seams instead of the
// concrete CSV reader or the concrete Reinhard implementation,
// so either can be swapped without touching the use cases.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use image::RgbImage;

use crate::domain::slide::Slide;

// ─── SlideSource ──────────────────────────────────────────────────────────────
/// Anything that can list the slides of a dataset.
///
/// Implementations:
///   - CsvSlideSource → the PANDA `train.csv` style table
pub trait SlideSource {
    fn load_slides(&self) -> Result<Vec<Slide>>;
}

// ─── BackgroundMask ───────────────────────────────────────────────────────────
/// Per-pixel background flags for one tile, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundMask {
    width:  u32,
    height: u32,
    flags:  Vec<bool>,
}

impl BackgroundMask {
    /// A pixel is background when every channel is above `threshold`.
    pub fn from_threshold(tile: &RgbImage, threshold: u8) -> Self {
        let flags = tile
            .pixels()
            .map(|p| p.0.iter().all(|&c| c > threshold))
            .collect();
        Self { width: tile.width(), height: tile.height(), flags }
    }

    pub fn is_background(&self, x: u32, y: u32) -> bool {
        self.flags[(y * self.width + x) as usize]
    }

    pub fn tissue_pixels(&self) -> usize {
        self.flags.iter().filter(|b| !**b).count()
    }

    pub fn tissue_fraction(&self) -> f32 {
        if self.flags.is_empty() {
            return 0.0;
        }
        self.tissue_pixels() as f32 / self.flags.len() as f32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

// ─── StainNormalizer ──────────────────────────────────────────────────────────
/// Maps a tile's colour distribution onto a canonical one.
///
/// Implementations:
///   - ReinhardNormalizer → Lab mean/std transfer
pub trait StainNormalizer: Send + Sync {
    /// Normalize tissue pixels; background pixels must come back untouched.
    fn transform(&self, tile: &RgbImage, mask: &BackgroundMask) -> RgbImage;

    /// Short method name for logs.
    fn method(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_background_mask_threshold() {
        let mut tile = RgbImage::from_pixel(2, 2, Rgb([250, 250, 250]));
        tile.put_pixel(1, 0, Rgb([120, 60, 140]));
        // one bright channel is not enough to be background
        tile.put_pixel(0, 1, Rgb([255, 200, 255]));

        let mask = BackgroundMask::from_threshold(&tile, 220);
        assert!(mask.is_background(0, 0));
        assert!(!mask.is_background(1, 0));
        assert!(!mask.is_background(0, 1));
        assert_eq!(mask.tissue_pixels(), 2);
        assert!((mask.tissue_fraction() - 0.5).abs() < 1e-6);
    }
}
