// ============================================================
// Layer 5 — Quadratic Weighted Kappa
// ============================================================
// The PANDA model-selection metric: agreement between predicted
// and true grades, penalising a prediction by the squared
// distance to the true grade.
//
//   O[i][j]  observed confusion counts
//   E[i][j]  expected counts = outer(hist_true, hist_pred) / N
//   w[i][j]  (i - j)^2 / (K - 1)^2
//
//   κ = 1 - Σ w·O / Σ w·E
//
// Perfect agreement makes the numerator 0 and κ = 1, even when
// every label is the same class. Empty input gives 0.
//
// Reference: Cohen (1968) Weighted kappa

use anyhow::{anyhow, Result};
use burn::prelude::*;

use crate::ml::loss::LossType;

pub fn quadratic_weighted_kappa(preds: &[usize], targets: &[usize], n_classes: usize) -> f64 {
    if preds.is_empty() || preds.len() != targets.len() || n_classes < 2 {
        return 0.0;
    }
    let k = n_classes;
    let clamp = |v: usize| v.min(k - 1);

    let mut observed  = vec![vec![0.0f64; k]; k];
    let mut hist_true = vec![0.0f64; k];
    let mut hist_pred = vec![0.0f64; k];
    for (&p, &t) in preds.iter().zip(targets) {
        let (p, t) = (clamp(p), clamp(t));
        observed[t][p] += 1.0;
        hist_true[t]   += 1.0;
        hist_pred[p]   += 1.0;
    }

    let n     = preds.len() as f64;
    let denom = ((k - 1) * (k - 1)) as f64;
    let (mut num, mut den) = (0.0, 0.0);
    for i in 0..k {
        for j in 0..k {
            let d = i as f64 - j as f64;
            let w = d * d / denom;
            num += w * observed[i][j];
            den += w * hist_true[i] * hist_pred[j] / n;
        }
    }

    if num == 0.0 {
        1.0
    } else if den == 0.0 {
        0.0
    } else {
        1.0 - num / den
    }
}

/// Decode slide outputs `[B, K]` into grades.
///   ce  → argmax
///   mse → round, clamped to 0..n_classes
pub fn predict_grades<B: Backend>(
    slide_logits: Tensor<B, 2>,
    loss_type:    LossType,
    n_classes:    usize,
) -> Result<Vec<usize>> {
    let [b, _] = slide_logits.dims();
    let grades = match loss_type {
        LossType::Ce => slide_logits
            .argmax(1)
            .reshape([b])
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow!("Cannot read back slide predictions: {e:?}"))?
            .into_iter()
            .map(|g| g.max(0) as usize)
            .collect(),
        LossType::Mse => slide_logits
            .reshape([b])
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read back slide predictions: {e:?}"))?
            .into_iter()
            .map(|v| v.round().clamp(0.0, (n_classes - 1) as f32) as usize)
            .collect(),
    };
    Ok(grades)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TB = NdArray<f32>;

    #[test]
    fn test_identical_labels_give_one() {
        let y = [0, 1, 2, 3, 4, 5, 2, 2];
        assert_eq!(quadratic_weighted_kappa(&y, &y, 6), 1.0);
        // single class, still perfect agreement
        assert_eq!(quadratic_weighted_kappa(&[3, 3, 3], &[3, 3, 3], 6), 1.0);
    }

    #[test]
    fn test_empty_input_gives_zero() {
        assert_eq!(quadratic_weighted_kappa(&[], &[], 6), 0.0);
    }

    #[test]
    fn test_known_value() {
        // O = [[1,1],[0,2]], hist_true = [2,2], hist_pred = [1,3]
        // num = 1, den = (2*3 + 2*1) / 4 = 2 → κ = 0.5
        let preds   = [0, 1, 1, 1];
        let targets = [0, 0, 1, 1];
        assert_relative_eq!(quadratic_weighted_kappa(&preds, &targets, 2), 0.5);
    }

    #[test]
    fn test_reversed_predictions_are_negative() {
        let targets = [0, 1, 2, 3, 4, 5];
        let preds   = [5, 4, 3, 2, 1, 0];
        assert!(quadratic_weighted_kappa(&preds, &targets, 6) < 0.0);
    }

    #[test]
    fn test_far_misses_cost_more() {
        let targets = [0, 0, 5, 5, 2, 3];
        let near    = [1, 0, 4, 5, 2, 3];
        let far     = [4, 0, 1, 5, 2, 3];
        assert!(
            quadratic_weighted_kappa(&near, &targets, 6) > quadratic_weighted_kappa(&far, &targets, 6)
        );
    }

    #[test]
    fn test_predict_grades() {
        let device = Default::default();
        let logits = Tensor::<TB, 1>::from_floats([0.1, 2.0, 0.3, 5.0, -1.0, 0.0], &device)
            .reshape([2, 3]);
        assert_eq!(predict_grades(logits, LossType::Ce, 3).unwrap(), vec![1, 0]);

        let reg = Tensor::<TB, 1>::from_floats([2.4, 2.6, -0.7, 9.0], &device).reshape([4, 1]);
        assert_eq!(predict_grades(reg, LossType::Mse, 6).unwrap(), vec![2, 3, 0, 5]);
    }
}
