// ============================================================
// Layer 4 — Reinhard Stain Normalizer
// ============================================================
// H&E slides from different labs (and different scanners) come
// out in noticeably different pinks and purples. Reinhard colour
// transfer moves each tile's colour statistics onto a fixed
// target so the encoder sees a consistent palette.
//
// Steps for one tile:
//   1. Convert RGB → CIE Lab, then rescale to the 0–255 style
//      ranges the target numbers were measured in:
//        L' = L * 255 / 100,  a' = a + 128,  b' = b + 128
//   2. Measure mean / std of each channel over TISSUE pixels only
//   3. Remap every channel:
//        x' = (x - mean) / (std + ε) * target_std + target_mean
//   4. Clamp back into valid Lab (L ∈ [0,100], a,b ∈ [-127,127])
//      and convert to sRGB
//   5. Copy background pixels verbatim from the source
//
// Reference: Reinhard et al. (2001) Color Transfer between Images

use image::{Rgb, RgbImage};
use palette::{FromColor, IntoColor, Lab, LinSrgb, Srgb};
use serde::{Deserialize, Serialize};

use crate::domain::traits::{BackgroundMask, StainNormalizer};

// Near-uniform tiles have std ≈ 0.
const STD_EPSILON: f64 = 1e-11;

/// Target (mean, std) for each scaled Lab channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabTarget {
    pub l: (f64, f64),
    pub a: (f64, f64),
    pub b: (f64, f64),
}

impl Default for LabTarget {
    /// Statistics measured on a reference PANDA tile.
    fn default() -> Self {
        Self {
            l: (148.60, 41.56),
            a: (169.30, 9.01),
            b: (105.97, 6.67),
        }
    }
}

impl LabTarget {
    fn channel(&self, c: usize) -> (f64, f64) {
        match c {
            0 => self.l,
            1 => self.a,
            _ => self.b,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReinhardNormalizer {
    target: LabTarget,
}

impl ReinhardNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the target statistics. `None` keeps the current
    /// (pre-computed) target.
    pub fn fit(&mut self, target: Option<LabTarget>) {
        if let Some(t) = target {
            self.target = t;
        }
    }

    /// Measure the target from a reference tile. Returns false and
    /// leaves the target alone when the tile has no tissue.
    pub fn fit_image(&mut self, reference: &RgbImage, mask: &BackgroundMask) -> bool {
        match channel_stats(reference, mask) {
            Some([l, a, b]) => {
                self.target = LabTarget { l, a, b };
                true
            }
            None => false,
        }
    }

    pub fn target(&self) -> LabTarget {
        self.target
    }
}

impl StainNormalizer for ReinhardNormalizer {
    fn transform(&self, tile: &RgbImage, mask: &BackgroundMask) -> RgbImage {
        let Some(stats) = channel_stats(tile, mask) else {
            return tile.clone();
        };

        let mut out = tile.clone();
        for (x, y, px) in out.enumerate_pixels_mut() {
            if mask.is_background(x, y) {
                continue;
            }
            let lab = to_scaled_lab(px);
            let mut mapped = [0.0f64; 3];
            for c in 0..3 {
                let (mean, std) = stats[c];
                let (t_mean, t_std) = self.target.channel(c);
                mapped[c] = (lab[c] - mean) / (std + STD_EPSILON) * t_std + t_mean;
            }
            *px = from_scaled_lab(mapped);
        }
        out
    }

    fn method(&self) -> &'static str {
        "reinhard"
    }
}

/// sRGB pixel → (L*255/100, a+128, b+128).
pub fn to_scaled_lab(px: &Rgb<u8>) -> [f64; 3] {
    let srgb: Srgb<f32> = Srgb::new(
        px[0] as f32 / 255.0,
        px[1] as f32 / 255.0,
        px[2] as f32 / 255.0,
    );
    let lin: LinSrgb<f32> = srgb.into_linear();
    let lab: Lab = Lab::from_color(lin);
    [
        lab.l as f64 * 255.0 / 100.0,
        lab.a as f64 + 128.0,
        lab.b as f64 + 128.0,
    ]
}

fn from_scaled_lab(v: [f64; 3]) -> Rgb<u8> {
    let l = (v[0] * 100.0 / 255.0).clamp(0.0, 100.0);
    let a = (v[1] - 128.0).clamp(-127.0, 127.0);
    let b = (v[2] - 128.0).clamp(-127.0, 127.0);

    let lab = Lab::new(l as f32, a as f32, b as f32);
    let lin: LinSrgb<f32> = lab.into_color();
    let srgb: Srgb<f32> = Srgb::from_linear(lin);
    let to_u8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([to_u8(srgb.red), to_u8(srgb.green), to_u8(srgb.blue)])
}

/// Population mean/std per scaled Lab channel over tissue pixels.
fn channel_stats(tile: &RgbImage, mask: &BackgroundMask) -> Option<[(f64, f64); 3]> {
    let mut sum   = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];
    let mut n     = 0usize;

    for (x, y, px) in tile.enumerate_pixels() {
        if mask.is_background(x, y) {
            continue;
        }
        let lab = to_scaled_lab(px);
        for c in 0..3 {
            sum[c]    += lab[c];
            sum_sq[c] += lab[c] * lab[c];
        }
        n += 1;
    }
    if n == 0 {
        return None;
    }

    let n = n as f64;
    let mut out = [(0.0, 0.0); 3];
    for c in 0..3 {
        let mean = sum[c] / n;
        let var  = (sum_sq[c] / n - mean * mean).max(0.0);
        out[c] = (mean, var.sqrt());
    }
    Some(out)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pink/purple texture resembling H&E tissue.
    fn he_like_tile() -> RgbImage {
        RgbImage::from_fn(32, 32, |x, y| {
            Rgb([
                (150 + (x * 7 + y * 13) % 80) as u8,
                (60 + (x * 11 + y * 5) % 100) as u8,
                (150 + (x * 3 + y * 17) % 70) as u8,
            ])
        })
    }

    fn mean_abs_diff(a: &RgbImage, b: &RgbImage) -> (f64, u8) {
        let mut total = 0u64;
        let mut max   = 0u8;
        for (p, q) in a.pixels().zip(b.pixels()) {
            for c in 0..3 {
                let d = p[c].abs_diff(q[c]);
                total += d as u64;
                max = max.max(d);
            }
        }
        (total as f64 / (a.len() as f64), max)
    }

    #[test]
    fn test_output_matches_target_statistics() {
        let tile = he_like_tile();
        let mask = BackgroundMask::from_threshold(&tile, 240);
        let norm = ReinhardNormalizer::new();
        let out  = norm.transform(&tile, &mask);

        let out_mask = BackgroundMask::from_threshold(&out, 255);
        let stats    = channel_stats(&out, &out_mask).unwrap();
        let target   = LabTarget::default();
        for c in 0..3 {
            let (mean, std)     = stats[c];
            let (t_mean, t_std) = target.channel(c);
            assert!((mean - t_mean).abs() < 2.0, "channel {c} mean {mean} vs {t_mean}");
            assert!((std - t_std).abs() < 1.5, "channel {c} std {std} vs {t_std}");
        }
    }

    #[test]
    fn test_normalizing_twice_is_nearly_idempotent() {
        let tile = he_like_tile();
        let norm = ReinhardNormalizer::new();

        let once  = norm.transform(&tile, &BackgroundMask::from_threshold(&tile, 240));
        let twice = norm.transform(&once, &BackgroundMask::from_threshold(&once, 255));

        let (first_change, _) = mean_abs_diff(&tile, &once);
        let (mean, max)       = mean_abs_diff(&once, &twice);
        assert!(first_change > 5.0, "first pass should move colours");
        assert!(mean < 1.5, "mean change {mean}");
        assert!(max <= 8, "max change {max}");
    }

    #[test]
    fn test_background_pixels_are_copied() {
        let mut tile = he_like_tile();
        for x in 0..32 {
            for y in 0..8 {
                tile.put_pixel(x, y, Rgb([250, 248, 252]));
            }
        }
        let mask = BackgroundMask::from_threshold(&tile, 240);
        let out  = ReinhardNormalizer::new().transform(&tile, &mask);
        for x in 0..32 {
            for y in 0..8 {
                assert_eq!(out.get_pixel(x, y), tile.get_pixel(x, y));
            }
        }
        assert_ne!(out.get_pixel(5, 20), tile.get_pixel(5, 20));
    }

    #[test]
    fn test_uniform_tile_stays_finite() {
        // zero variance in every channel
        let tile = RgbImage::from_pixel(8, 8, Rgb([180, 90, 170]));
        let mask = BackgroundMask::from_threshold(&tile, 220);
        let out  = ReinhardNormalizer::new().transform(&tile, &mask);
        // every pixel maps to the target mean colour
        let first = *out.get_pixel(0, 0);
        assert!(out.pixels().all(|p| *p == first));
    }

    #[test]
    fn test_all_background_tile_unchanged() {
        let tile = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
        let mask = BackgroundMask::from_threshold(&tile, 220);
        assert_eq!(ReinhardNormalizer::new().transform(&tile, &mask), tile);
    }

    #[test]
    fn test_fit_image_uses_reference_statistics() {
        let reference = he_like_tile();
        let mask      = BackgroundMask::from_threshold(&reference, 240);
        let mut norm  = ReinhardNormalizer::new();
        assert!(norm.fit_image(&reference, &mask));

        // normalizing the reference onto itself barely moves it
        let out = norm.transform(&reference, &mask);
        let (mean, _) = mean_abs_diff(&reference, &out);
        assert!(mean < 1.5, "mean change {mean}");

        // fit(None) keeps the fitted target
        let before = norm.target();
        norm.fit(None);
        assert_eq!(norm.target(), before);
    }
}
