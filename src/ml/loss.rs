// ============================================================
// Layer 5 — MIL Loss
// ============================================================
// Two supervision signals:
//
//   slide loss   slide logits vs ISUP grade
//   tile loss    auxiliary tile logits vs weak tile labels
//
// Which ones apply:
//
//   arch          alpha      loss
//   pool          any        slide
//   attention     1          tile
//   attention     0          slide
//   attention     in (0,1)   alpha * tile + (1 - alpha) * slide
//
// Tile labels of -1 are ignored: the tile loss is averaged over
// valid labels only, and a batch with none contributes 0.
//
// Loss types:
//   ce   cross-entropy; the slide term can be weighted by
//        inverse class frequency
//   mse  regression on the grade as a float; outputs have width 1

use burn::{
    nn::loss::{CrossEntropyLossConfig, MseLoss, Reduction},
    prelude::*,
    tensor::activation::log_softmax,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::ml::{mil::MilArch, model::MilOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    #[default]
    Ce,
    Mse,
}

impl FromStr for LossType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ce"  => Ok(LossType::Ce),
            "mse" => Ok(LossType::Mse),
            other => Err(format!("unknown loss type '{other}' (expected ce or mse)")),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LossType::Ce  => "ce",
            LossType::Mse => "mse",
        })
    }
}

impl LossType {
    /// Output width for a head over `n_classes` classes.
    pub fn output_width(&self, n_classes: usize) -> usize {
        match self {
            LossType::Ce  => n_classes,
            LossType::Mse => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossTerms {
    SlideOnly,
    TileOnly,
    Mixed { alpha: f64 },
}

impl LossTerms {
    pub fn select(arch: MilArch, alpha: f64) -> Self {
        if !arch.uses_attention() || alpha <= 0.0 {
            LossTerms::SlideOnly
        } else if alpha >= 1.0 {
            LossTerms::TileOnly
        } else {
            LossTerms::Mixed { alpha }
        }
    }
}

/// Total loss plus the terms that went into it, for logging.
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub slide: Option<Tensor<B, 1>>,
    pub tile:  Option<Tensor<B, 1>>,
}

#[derive(Debug, Clone)]
pub struct MilLoss {
    pub loss_type:     LossType,
    pub terms:         LossTerms,
    pub class_weights: Option<Vec<f32>>,
}

impl MilLoss {
    pub fn new(loss_type: LossType, terms: LossTerms) -> Self {
        Self { loss_type, terms, class_weights: None }
    }

    pub fn with_class_weights(mut self, weights: Option<Vec<f32>>) -> Self {
        self.class_weights = weights;
        self
    }

    pub fn forward<B: Backend>(
        &self,
        out:          &MilOutput<B>,
        tile_labels:  Tensor<B, 1, Int>,
        slide_labels: Tensor<B, 1, Int>,
    ) -> LossOutput<B> {
        match self.terms {
            LossTerms::SlideOnly => {
                let slide = self.slide_loss(out.slide_logits.clone(), slide_labels);
                LossOutput { total: slide.clone(), slide: Some(slide), tile: None }
            }
            LossTerms::TileOnly => {
                let tile = self.tile_loss(out.tile_logits.clone(), tile_labels);
                LossOutput { total: tile.clone(), slide: None, tile: Some(tile) }
            }
            LossTerms::Mixed { alpha } => {
                let slide = self.slide_loss(out.slide_logits.clone(), slide_labels);
                let tile  = self.tile_loss(out.tile_logits.clone(), tile_labels);
                let total = tile.clone() * alpha + slide.clone() * (1.0 - alpha);
                LossOutput { total, slide: Some(slide), tile: Some(tile) }
            }
        }
    }

    /// Slide logits `[B, K]` vs grades `[B]`.
    pub fn slide_loss<B: Backend>(&self, logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        match self.loss_type {
            LossType::Ce => CrossEntropyLossConfig::new()
                .with_weights(self.class_weights.clone())
                .init(&logits.device())
                .forward(logits, labels),
            LossType::Mse => {
                let [b, _] = logits.dims();
                MseLoss::new().forward(logits.reshape([b]), labels.float(), Reduction::Mean)
            }
        }
    }

    /// Tile logits `[M, T]` vs labels `[M]`, ignoring `-1`.
    pub fn tile_loss<B: Backend>(&self, logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [m, _] = logits.dims();
        let valid  = labels.clone().greater_equal_elem(0).float();
        let count  = valid.clone().sum().clamp_min(1.0);

        let per_tile = match self.loss_type {
            LossType::Ce => {
                let safe   = labels.clamp_min(0).reshape([m, 1]);
                let picked = log_softmax(logits, 1).gather(1, safe).reshape([m]);
                picked.neg()
            }
            LossType::Mse => {
                let diff = logits.reshape([m]) - labels.float();
                diff.clone() * diff
            }
        };
        (per_tile * valid).sum() / count
    }
}

/// Smoothed inverse class frequency, `n / (k * (count_c + 1))`.
/// Every weight is positive, including classes missing from the fold.
pub fn class_weights(labels: &[u8], n_classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; n_classes];
    for &l in labels {
        if (l as usize) < n_classes {
            counts[l as usize] += 1;
        }
    }
    let n = counts.iter().sum::<usize>().max(1) as f32;
    counts
        .iter()
        .map(|&c| n / (n_classes as f32 * (c + 1) as f32))
        .collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TB = NdArray<f32>;

    fn scalar(t: Tensor<TB, 1>) -> f32 {
        t.into_scalar()
    }

    fn logits(rows: &[[f32; 3]]) -> Tensor<TB, 2> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::<TB, 1>::from_floats(flat.as_slice(), &Default::default()).reshape([rows.len(), 3])
    }

    fn ints(v: &[i64]) -> Tensor<TB, 1, Int> {
        Tensor::<TB, 1, Int>::from_ints(v, &Default::default())
    }

    #[test]
    fn test_loss_selection() {
        assert_eq!(LossTerms::select(MilArch::Pool, 1.0), LossTerms::SlideOnly);
        assert_eq!(LossTerms::select(MilArch::AttentionBatched, 1.0), LossTerms::TileOnly);
        assert_eq!(LossTerms::select(MilArch::AttentionPerSample, 0.0), LossTerms::SlideOnly);
        assert_eq!(
            LossTerms::select(MilArch::AttentionBatched, 0.3),
            LossTerms::Mixed { alpha: 0.3 }
        );
    }

    #[test]
    fn test_tile_ce_ignores_sentinel() {
        let loss = MilLoss::new(LossType::Ce, LossTerms::TileOnly);
        // uniform logits → -ln(1/3) per valid tile
        let l = loss.tile_loss(logits(&[[0.0; 3], [0.0; 3], [5.0, 0.0, 0.0]]), ints(&[1, 2, -1]));
        assert_relative_eq!(scalar(l), (3.0f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_tile_loss_without_valid_labels_is_zero() {
        let loss = MilLoss::new(LossType::Ce, LossTerms::TileOnly);
        let l = loss.tile_loss(logits(&[[1.0, 2.0, 3.0], [0.0; 3]]), ints(&[-1, -1]));
        assert_eq!(scalar(l), 0.0);

        let mse = MilLoss::new(LossType::Mse, LossTerms::TileOnly);
        let preds = Tensor::<TB, 1>::from_floats([2.0, 7.0], &Default::default()).reshape([2, 1]);
        assert_eq!(scalar(mse.tile_loss(preds, ints(&[-1, -1]))), 0.0);
    }

    #[test]
    fn test_tile_mse_masked_mean() {
        let loss  = MilLoss::new(LossType::Mse, LossTerms::TileOnly);
        let preds = Tensor::<TB, 1>::from_floats([1.0, 5.0, 100.0], &Default::default()).reshape([3, 1]);
        // (1-3)^2 = 4, (5-4)^2 = 1, third ignored
        let l = loss.tile_loss(preds, ints(&[3, 4, -1]));
        assert_relative_eq!(scalar(l), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_slide_mse() {
        let loss  = MilLoss::new(LossType::Mse, LossTerms::SlideOnly);
        let preds = Tensor::<TB, 1>::from_floats([2.0, 2.0], &Default::default()).reshape([2, 1]);
        let l = loss.slide_loss(preds, ints(&[2, 4]));
        assert_relative_eq!(scalar(l), 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mixed_loss_weights_terms() {
        let device = Default::default();
        let out = MilOutput::<TB> {
            slide_logits: logits(&[[0.0; 3]]),
            tile_logits:  logits(&[[0.0; 3], [0.0; 3]]),
            attention:    Tensor::ones([1, 2], &device),
        };
        let loss = MilLoss::new(LossType::Ce, LossTerms::Mixed { alpha: 0.25 });
        let res  = loss.forward(&out, ints(&[0, -1]), ints(&[1]));
        // both terms equal ln 3 here
        assert_relative_eq!(scalar(res.total), (3.0f32).ln(), epsilon = 1e-5);
        assert!(res.slide.is_some() && res.tile.is_some());
    }

    #[test]
    fn test_class_weights() {
        let w = class_weights(&[0, 0, 0, 1, 2, 2], 4);
        assert_relative_eq!(w[0], 6.0 / 16.0);
        assert_relative_eq!(w[1], 6.0 / 8.0);
        assert_relative_eq!(w[2], 6.0 / 12.0);
        assert_relative_eq!(w[3], 6.0 / 4.0);
        assert!(class_weights(&[], 3).iter().all(|&x| x > 0.0));
    }

    #[test]
    fn test_weighted_ce_with_absent_class_is_finite() {
        let w = class_weights(&[0, 0, 1, 1], 3);
        assert!(w.iter().all(|&x| x > 0.0), "{w:?}");

        let loss = MilLoss::new(LossType::Ce, LossTerms::SlideOnly).with_class_weights(Some(w));
        let l = loss.slide_loss(logits(&[[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.5, 0.5, 0.5]]), ints(&[0, 1, 2]));
        let v = scalar(l);
        assert!(v.is_finite() && v > 0.0, "{v}");
    }

    #[test]
    fn test_loss_type_parsing() {
        assert_eq!("MSE".parse::<LossType>().unwrap(), LossType::Mse);
        assert_eq!(LossType::Ce.output_width(6), 6);
        assert_eq!(LossType::Mse.output_width(6), 1);
        assert!("huber".parse::<LossType>().is_err());
    }
}
