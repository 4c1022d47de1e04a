// ============================================================
// Layer 5 — Attention MIL Aggregator
// ============================================================
// Turns the feature maps of a bag's tiles into one slide-level
// embedding.
//
// Attention strategies (Ilse et al. 2018, gated-free variant):
//
//   1. instance embedding   concat pool         [B*N, 2C]
//   2. bag-feature embed    Linear → Mish → Dropout   [B*N, E]
//   3. attention logit      Linear → tanh → Dropout → Linear   [B*N, 1]
//   4. softmax over the N tiles of each bag     [B, N]
//   5. weighted sum         a · H               [B, E]
//
// `AttentionPerSample` runs steps 4–5 bag by bag, `AttentionBatched`
// does them with one batched matmul; both give the same numbers.
//
// Padding tiles: with `mask_padding` on, blank tiles get a logit
// of -1e9 before the softmax, so they receive no weight. A bag
// with no real tile at all has every logit at -1e9 and the
// softmax falls back to uniform weights.
//
// `Pool` skips attention: concat pooling runs over the feature
// maps of all N tiles at once, then Linear → Mish → Dropout.
// Reported attention is uniform (1/N).
//
// Reference: Ilse, Tomczak & Welling (2018) Attention-based
//            Deep Multiple Instance Learning

use burn::{
    module::Ignored,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::{mish, softmax},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::ml::backbone::concat_pool;

const MASKED_LOGIT: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MilArch {
    AttentionPerSample,
    #[default]
    AttentionBatched,
    Pool,
}

impl MilArch {
    pub fn uses_attention(&self) -> bool {
        !matches!(self, MilArch::Pool)
    }
}

impl FromStr for MilArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attention_per_sample" => Ok(MilArch::AttentionPerSample),
            "attention_batched"    => Ok(MilArch::AttentionBatched),
            "pool"                 => Ok(MilArch::Pool),
            other => Err(format!(
                "unknown MIL arch '{other}' (expected attention_per_sample, attention_batched or pool)"
            )),
        }
    }
}

impl fmt::Display for MilArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MilArch::AttentionPerSample => "attention_per_sample",
            MilArch::AttentionBatched   => "attention_batched",
            MilArch::Pool               => "pool",
        };
        f.write_str(s)
    }
}

#[derive(Config, Debug)]
pub struct MilAggregatorConfig {
    /// Channels of the backbone feature map.
    pub feature_dim: usize,
    #[config(default = 512)]
    pub bag_embed_dim: usize,
    #[config(default = 256)]
    pub bag_hidden_dim: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    #[config(default = "MilArch::AttentionBatched")]
    pub arch: MilArch,
    #[config(default = true)]
    pub mask_padding: bool,
}

impl MilAggregatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MilAggregator<B> {
        MilAggregator {
            bag_embed:     LinearConfig::new(2 * self.feature_dim, self.bag_embed_dim).init(device),
            embed_dropout: DropoutConfig::new(self.dropout).init(),
            att_hidden:    LinearConfig::new(self.bag_embed_dim, self.bag_hidden_dim).init(device),
            att_dropout:   DropoutConfig::new(self.dropout).init(),
            att_out:       LinearConfig::new(self.bag_hidden_dim, 1).init(device),
            arch:          Ignored(self.arch),
            mask_padding:  self.mask_padding,
        }
    }
}

#[derive(Module, Debug)]
pub struct MilAggregator<B: Backend> {
    bag_embed:     Linear<B>,
    embed_dropout: Dropout,
    att_hidden:    Linear<B>,
    att_dropout:   Dropout,
    att_out:       Linear<B>,
    arch:          Ignored<MilArch>,
    mask_padding:  bool,
}

/// Bag embeddings `[B, E]` and attention weights `[B, N]`.
pub struct Aggregated<B: Backend> {
    pub bag:       Tensor<B, 2>,
    pub attention: Tensor<B, 2>,
}

impl<B: Backend> MilAggregator<B> {
    pub fn arch(&self) -> MilArch {
        self.arch.0
    }

    /// `feats`: `[B*N, C, h, w]` in bag-major order; `mask`: `[B, N]`,
    /// true for real tiles.
    pub fn forward(&self, feats: Tensor<B, 4>, mask: Tensor<B, 2, Bool>) -> Aggregated<B> {
        match self.arch.0 {
            MilArch::Pool => self.forward_pool(feats, mask),
            arch => {
                let [batch, n_tiles] = mask.dims();
                let embedded = self.embed_tiles(feats);
                let logits   = self.attention_logits(embedded.clone(), mask, batch, n_tiles);
                let e        = embedded.dims()[1];
                let embedded = embedded.reshape([batch, n_tiles, e]);
                match arch {
                    MilArch::AttentionPerSample => Self::pool_per_sample(logits, embedded),
                    _ => Self::pool_batched(logits, embedded),
                }
            }
        }
    }

    /// Per-tile bag-feature embeddings `[B*N, E]`.
    pub fn embed_tiles(&self, feats: Tensor<B, 4>) -> Tensor<B, 2> {
        let inst = concat_pool(feats);
        self.embed_dropout.forward(mish(self.bag_embed.forward(inst)))
    }

    fn attention_logits(
        &self,
        embedded: Tensor<B, 2>,
        mask:     Tensor<B, 2, Bool>,
        batch:    usize,
        n_tiles:  usize,
    ) -> Tensor<B, 2> {
        let hidden = self.att_dropout.forward(self.att_hidden.forward(embedded).tanh());
        let logits = self.att_out.forward(hidden).reshape([batch, n_tiles]);
        if self.mask_padding {
            logits.mask_fill(mask.bool_not(), MASKED_LOGIT)
        } else {
            logits
        }
    }

    fn pool_batched(logits: Tensor<B, 2>, embedded: Tensor<B, 3>) -> Aggregated<B> {
        let [batch, _, e] = embedded.dims();
        let attention = softmax(logits, 1);
        let bag = attention
            .clone()
            .unsqueeze_dim::<3>(1)
            .matmul(embedded)
            .reshape([batch, e]);
        Aggregated { bag, attention }
    }

    fn pool_per_sample(logits: Tensor<B, 2>, embedded: Tensor<B, 3>) -> Aggregated<B> {
        let [batch, n_tiles, e] = embedded.dims();
        let mut bags    = Vec::with_capacity(batch);
        let mut weights = Vec::with_capacity(batch);
        for b in 0..batch {
            let w = softmax(logits.clone().slice([b..b + 1, 0..n_tiles]), 1);
            let h = embedded.clone().slice([b..b + 1, 0..n_tiles, 0..e]).reshape([n_tiles, e]);
            bags.push(w.clone().matmul(h));
            weights.push(w);
        }
        Aggregated {
            bag:       Tensor::cat(bags, 0),
            attention: Tensor::cat(weights, 0),
        }
    }

    fn forward_pool(&self, feats: Tensor<B, 4>, mask: Tensor<B, 2, Bool>) -> Aggregated<B> {
        let [batch, n_tiles] = mask.dims();
        let [_, c, h, w] = feats.dims();
        // [B*N, C, h, w] → [B, C, N*h, w]: one tall map per bag
        let stacked = feats
            .reshape([batch, n_tiles, c, h * w])
            .swap_dims(1, 2)
            .reshape([batch, c, n_tiles * h, w]);
        let bag = self
            .embed_dropout
            .forward(mish(self.bag_embed.forward(concat_pool(stacked))));
        let attention = Tensor::ones([batch, n_tiles], &bag.device()) / n_tiles as f64;
        Aggregated { bag, attention }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TB = NdArray<f32>;

    fn aggregator(arch: MilArch, mask_padding: bool) -> MilAggregator<TB> {
        MilAggregatorConfig::new(8)
            .with_bag_embed_dim(16)
            .with_bag_hidden_dim(8)
            .with_arch(arch)
            .with_mask_padding(mask_padding)
            .init(&Default::default())
    }

    fn mask(rows: &[&[bool]]) -> Tensor<TB, 2, Bool> {
        let n    = rows[0].len();
        let flat = rows.iter().flat_map(|r| r.iter().copied()).collect::<Vec<_>>();
        Tensor::from_data(TensorData::new(flat, [rows.len(), n]), &Default::default())
    }

    fn row_sums(t: Tensor<TB, 2>) -> Vec<f32> {
        t.sum_dim(1).into_data().to_vec().unwrap()
    }

    #[test]
    fn test_attention_sums_to_one_per_bag() {
        let device = Default::default();
        for n in [1usize, 3, 7] {
            let agg   = aggregator(MilArch::AttentionBatched, true);
            let feats = Tensor::<TB, 4>::random([2 * n, 8, 2, 2], Distribution::Default, &device);
            let m     = mask(&[&vec![true; n], &vec![true; n]]);
            let out   = agg.forward(feats, m);
            assert_eq!(out.bag.dims(), [2, 16]);
            assert_eq!(out.attention.dims(), [2, n]);
            for s in row_sums(out.attention.clone()) {
                assert!((s - 1.0).abs() < 1e-5, "n={n} sum={s}");
            }
            let w: Vec<f32> = out.attention.into_data().to_vec().unwrap();
            assert!(w.iter().all(|&x| x >= 0.0));
        }
    }

    #[test]
    fn test_per_sample_and_batched_agree() {
        let device  = Default::default();
        let batched = aggregator(MilArch::AttentionBatched, true);
        // same weights, different strategy
        let per_sample = MilAggregator {
            arch: Ignored(MilArch::AttentionPerSample),
            ..batched.clone()
        };

        let feats = Tensor::<TB, 4>::random([3 * 4, 8, 2, 2], Distribution::Default, &device);
        let m     = mask(&[
            &[true, true, true, true],
            &[true, true, false, false],
            &[true, false, false, false],
        ]);
        let a = batched.forward(feats.clone(), m.clone());
        let b = per_sample.forward(feats, m);

        let (ab, bb): (Vec<f32>, Vec<f32>) = (
            a.bag.into_data().to_vec().unwrap(),
            b.bag.into_data().to_vec().unwrap(),
        );
        for (x, y) in ab.iter().zip(&bb) {
            assert!((x - y).abs() < 1e-5);
        }
        let (aw, bw): (Vec<f32>, Vec<f32>) = (
            a.attention.into_data().to_vec().unwrap(),
            b.attention.into_data().to_vec().unwrap(),
        );
        for (x, y) in aw.iter().zip(&bw) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_padding_tiles_get_no_attention() {
        let device = Default::default();
        let agg    = aggregator(MilArch::AttentionBatched, true);
        let feats  = Tensor::<TB, 4>::random([5, 8, 2, 2], Distribution::Default, &device);
        let out    = agg.forward(feats, mask(&[&[true, true, false, false, false]]));
        let w: Vec<f32> = out.attention.into_data().to_vec().unwrap();
        assert!(w[2..].iter().all(|&x| x < 1e-6), "{w:?}");
        assert!((w[0] + w[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_all_blank_bag_is_uniform() {
        let device = Default::default();
        let agg    = aggregator(MilArch::AttentionBatched, true);
        let feats  = Tensor::<TB, 4>::random([4, 8, 2, 2], Distribution::Default, &device);
        let out    = agg.forward(feats, mask(&[&[false; 4]]));
        let w: Vec<f32> = out.attention.into_data().to_vec().unwrap();
        assert!(w.iter().all(|&x| (x - 0.25).abs() < 1e-6), "{w:?}");
    }

    #[test]
    fn test_unmasked_padding_still_gets_weight() {
        let device = Default::default();
        let agg    = aggregator(MilArch::AttentionBatched, false);
        let feats  = Tensor::<TB, 4>::random([3, 8, 2, 2], Distribution::Default, &device);
        let out    = agg.forward(feats, mask(&[&[true, false, false]]));
        let w: Vec<f32> = out.attention.into_data().to_vec().unwrap();
        assert!(w[1] > 0.0 && w[2] > 0.0);
    }

    #[test]
    fn test_pool_mode_shapes_and_uniform_attention() {
        let device = Default::default();
        let agg    = aggregator(MilArch::Pool, true);
        let feats  = Tensor::<TB, 4>::random([2 * 3, 8, 2, 2], Distribution::Default, &device);
        let out    = agg.forward(feats, mask(&[&[true; 3], &[true, false, false]]));
        assert_eq!(out.bag.dims(), [2, 16]);
        let w: Vec<f32> = out.attention.into_data().to_vec().unwrap();
        assert!(w.iter().all(|&x| (x - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_arch_parsing() {
        assert_eq!("pool".parse::<MilArch>().unwrap(), MilArch::Pool);
        assert_eq!(MilArch::AttentionPerSample.to_string(), "attention_per_sample");
        assert!("gated".parse::<MilArch>().is_err());
        assert!(!MilArch::Pool.uses_attention());
    }
}
