// ============================================================
// Layer 4 — Tile Transform
// ============================================================
// Turns an RGB tile into the float buffer the encoder consumes:
//
//   RgbImage [s, s]  →  resize to input_size (if needed)
//                    →  scale to [0, 1]
//                    →  (x - mean) / std per channel
//                    →  channel-first Vec<f32> of 3 * size * size
//
// Defaults are the ImageNet statistics the pretrained backbones
// were trained with.

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileTransform {
    pub input_size: u32,
    pub mean:       [f32; 3],
    pub std:        [f32; 3],
}

impl TileTransform {
    pub fn new(input_size: u32) -> Self {
        Self {
            input_size,
            mean: [0.485, 0.456, 0.406],
            std:  [0.229, 0.224, 0.225],
        }
    }

    pub fn with_stats(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.mean = mean;
        self.std  = std;
        self
    }

    /// Number of floats produced per tile.
    pub fn tile_len(&self) -> usize {
        3 * (self.input_size as usize) * (self.input_size as usize)
    }

    pub fn apply(&self, tile: &RgbImage) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.tile_len());
        self.apply_into(tile, &mut out);
        out
    }

    /// Append the transformed tile to `out`; lets the batcher build
    /// one flat buffer without intermediate allocations.
    pub fn apply_into(&self, tile: &RgbImage, out: &mut Vec<f32>) {
        let resized;
        let tile = if tile.dimensions() != (self.input_size, self.input_size) {
            resized = imageops::resize(
                tile,
                self.input_size,
                self.input_size,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            tile
        };

        for c in 0..3 {
            let (m, s) = (self.mean[c], self.std[c]);
            out.extend(tile.pixels().map(|p| (p[c] as f32 / 255.0 - m) / s));
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    #[test]
    fn test_channel_first_layout() {
        let mut tile = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        tile.put_pixel(1, 0, Rgb([255, 0, 51]));
        let t   = TileTransform::new(2).with_stats([0.0; 3], [1.0; 3]);
        let out = t.apply(&tile);

        assert_eq!(out.len(), 12);
        // red plane, pixel (1, 0)
        assert_relative_eq!(out[1], 1.0);
        // green plane is all zeros
        assert!(out[4..8].iter().all(|&v| v == 0.0));
        // blue plane, pixel (1, 0)
        assert_relative_eq!(out[9], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_mean_std_normalization() {
        let tile = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let t    = TileTransform::new(4);
        let out  = t.apply(&tile);
        assert_relative_eq!(out[0], (1.0 - 0.485) / 0.229, epsilon = 1e-5);
        assert_relative_eq!(out[16], (1.0 - 0.456) / 0.224, epsilon = 1e-5);
        assert_relative_eq!(out[47], (1.0 - 0.406) / 0.225, epsilon = 1e-5);
    }

    #[test]
    fn test_resizes_to_input_size() {
        let tile = RgbImage::from_pixel(16, 16, Rgb([10, 20, 30]));
        let t    = TileTransform::new(8);
        let out  = t.apply(&tile);
        assert_eq!(out.len(), t.tile_len());
        assert_eq!(out.len(), 3 * 8 * 8);
    }

    #[test]
    fn test_apply_into_appends() {
        let tile = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        let t    = TileTransform::new(2);
        let mut buf = vec![7.0];
        t.apply_into(&tile, &mut buf);
        t.apply_into(&tile, &mut buf);
        assert_eq!(buf.len(), 1 + 2 * 12);
        assert_eq!(buf[0], 7.0);
    }
}
