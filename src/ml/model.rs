// ============================================================
// Layer 5 — MIL Model
// ============================================================
// The full slide model:
//
//   tiles [B, N, 3, S, S]
//       │  reshape to [B*N, 3, S, S]
//       ▼
//   TileEncoder      → feature maps [B*N, C, h, w]
//       │              + tile logits [B*N, T]
//       ▼
//   MilAggregator    → bag embedding [B, E] + attention [B, N]
//       ▼
//   SlideClassifier  → slide logits [B, K]
//
// The configuration is validated before anything is built: an
// unknown backbone or a missing pretrained file is a ConfigError.

use anyhow::Result;
use burn::prelude::*;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::ml::{
    backbone::{self, BackboneSpec},
    classifier::{SlideClassifier, SlideClassifierConfig},
    encoder::TileEncoder,
    loss::LossType,
    mil::{MilAggregator, MilAggregatorConfig, MilArch},
};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally; do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct MilModelConfig {
    /// Registry name, e.g. "resnet-lite-4".
    pub backbone: String,
    #[config(default = 6)]
    pub n_slide_classes: usize,
    #[config(default = 6)]
    pub n_tile_classes: usize,
    #[config(default = "LossType::Ce")]
    pub loss_type: LossType,
    #[config(default = "MilArch::AttentionBatched")]
    pub arch: MilArch,
    #[config(default = true)]
    pub mask_padding: bool,
    #[config(default = 512)]
    pub bag_embed_dim: usize,
    #[config(default = 256)]
    pub bag_hidden_dim: usize,
    #[config(default = 512)]
    pub classifier_hidden_dim: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Backbone record file to start from.
    #[config(default = "None")]
    pub pretrained: Option<PathBuf>,
}

impl MilModelConfig {
    pub fn validate(&self) -> Result<&'static BackboneSpec, ConfigError> {
        let spec = backbone::lookup(&self.backbone)?;
        if self.n_slide_classes < 2 {
            return Err(ConfigError::out_of_range("n_slide_classes", self.n_slide_classes, ">= 2"));
        }
        if self.n_tile_classes < 1 {
            return Err(ConfigError::out_of_range("n_tile_classes", self.n_tile_classes, ">= 1"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::out_of_range("dropout", self.dropout, "in [0, 1)"));
        }
        if let Some(path) = &self.pretrained {
            if !path.exists() {
                return Err(ConfigError::MissingPretrained(path.clone()));
            }
        }
        Ok(spec)
    }

    pub fn slide_outputs(&self) -> usize {
        self.loss_type.output_width(self.n_slide_classes)
    }

    pub fn tile_outputs(&self) -> usize {
        self.loss_type.output_width(self.n_tile_classes)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<MilModel<B>> {
        let spec = self.validate()?;

        let mut encoder = TileEncoder::new(spec, self.tile_outputs(), device);
        if let Some(path) = &self.pretrained {
            encoder = encoder.load_backbone(path, device)?;
        }

        let aggregator = MilAggregatorConfig::new(spec.feature_dim())
            .with_bag_embed_dim(self.bag_embed_dim)
            .with_bag_hidden_dim(self.bag_hidden_dim)
            .with_dropout(self.dropout)
            .with_arch(self.arch)
            .with_mask_padding(self.mask_padding)
            .init(device);

        let classifier = SlideClassifierConfig::new(self.bag_embed_dim, self.slide_outputs())
            .with_hidden_dim(self.classifier_hidden_dim)
            .with_dropout(self.dropout)
            .init(device);

        tracing::debug!(
            "Built MIL model: backbone={} arch={} loss={} outputs={}",
            spec.name, self.arch, self.loss_type, self.slide_outputs()
        );
        Ok(MilModel { encoder, aggregator, classifier })
    }
}

#[derive(Module, Debug)]
pub struct MilModel<B: Backend> {
    pub encoder:    TileEncoder<B>,
    pub aggregator: MilAggregator<B>,
    pub classifier: SlideClassifier<B>,
}

pub struct MilOutput<B: Backend> {
    /// `[B, K]`
    pub slide_logits: Tensor<B, 2>,
    /// `[B*N, T]`, bag-major
    pub tile_logits:  Tensor<B, 2>,
    /// `[B, N]`
    pub attention:    Tensor<B, 2>,
}

impl<B: Backend> MilModel<B> {
    pub fn forward(&self, tiles: Tensor<B, 5>, mask: Tensor<B, 2, Bool>) -> MilOutput<B> {
        let [b, n, c, h, w] = tiles.dims();
        let (feats, tile_logits) = self.encoder.forward(tiles.reshape([b * n, c, h, w]));
        let agg = self.aggregator.forward(feats, mask);
        MilOutput {
            slide_logits: self.classifier.forward(agg.bag),
            tile_logits,
            attention: agg.attention,
        }
    }

    /// Per-tile bag-feature embeddings `[B, N, E]`, before attention.
    pub fn forward_features(&self, tiles: Tensor<B, 5>) -> Tensor<B, 3> {
        let [b, n, c, h, w] = tiles.dims();
        let feats = self.encoder.backbone.forward(tiles.reshape([b * n, c, h, w]));
        let embedded = self.aggregator.embed_tiles(feats);
        let e = embedded.dims()[1];
        embedded.reshape([b, n, e])
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TB = NdArray<f32>;

    fn small_config(arch: MilArch, loss: LossType) -> MilModelConfig {
        MilModelConfig::new("cnn-4".into())
            .with_arch(arch)
            .with_loss_type(loss)
            .with_bag_embed_dim(16)
            .with_bag_hidden_dim(8)
            .with_classifier_hidden_dim(8)
    }

    fn full_mask(b: usize, n: usize) -> Tensor<TB, 2, Bool> {
        Tensor::from_data(TensorData::new(vec![true; b * n], [b, n]), &Default::default())
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        for arch in [MilArch::AttentionPerSample, MilArch::AttentionBatched, MilArch::Pool] {
            let model = small_config(arch, LossType::Ce).init::<TB>(&device).unwrap();
            let tiles = Tensor::<TB, 5>::random([2, 4, 3, 16, 16], Distribution::Default, &device);
            let out   = model.forward(tiles, full_mask(2, 4));
            assert_eq!(out.slide_logits.dims(), [2, 6], "{arch}");
            assert_eq!(out.tile_logits.dims(), [8, 6], "{arch}");
            assert_eq!(out.attention.dims(), [2, 4], "{arch}");
        }
    }

    #[test]
    fn test_mse_has_single_outputs() {
        let device = Default::default();
        let model  = small_config(MilArch::AttentionBatched, LossType::Mse).init::<TB>(&device).unwrap();
        let tiles  = Tensor::<TB, 5>::random([1, 3, 3, 16, 16], Distribution::Default, &device);
        let out    = model.forward(tiles, full_mask(1, 3));
        assert_eq!(out.slide_logits.dims(), [1, 1]);
        assert_eq!(out.tile_logits.dims(), [3, 1]);
    }

    #[test]
    fn test_forward_features() {
        let device = Default::default();
        let model  = small_config(MilArch::AttentionBatched, LossType::Ce).init::<TB>(&device).unwrap();
        let tiles  = Tensor::<TB, 5>::random([2, 3, 3, 16, 16], Distribution::Default, &device);
        assert_eq!(model.forward_features(tiles).dims(), [2, 3, 16]);
    }

    #[test]
    fn test_zero_dropout_makes_training_forward_deterministic() {
        type AD = burn::backend::Autodiff<TB>;
        let device = Default::default();
        let model  = small_config(MilArch::AttentionBatched, LossType::Ce)
            .with_dropout(0.0)
            .init::<AD>(&device)
            .unwrap();
        let tiles = Tensor::<AD, 5>::random([2, 3, 3, 16, 16], Distribution::Default, &device);
        let mask  = Tensor::<AD, 2, Bool>::from_data(TensorData::new(vec![true; 6], [2, 3]), &device);

        let a = model.forward(tiles.clone(), mask.clone()).slide_logits.into_data();
        let b = model.forward(tiles, mask).slide_logits.into_data();
        a.assert_approx_eq(&b, 6);
    }

    #[test]
    fn test_unknown_backbone_fails_validation() {
        let cfg = MilModelConfig::new("vgg16".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedBackbone { .. })));
        assert!(cfg.init::<TB>(&Default::default()).is_err());
    }

    #[test]
    fn test_missing_pretrained_fails_validation() {
        let cfg = small_config(MilArch::Pool, LossType::Ce)
            .with_pretrained(Some(PathBuf::from("/no/such/backbone.mpk")));
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingPretrained(_))));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg  = small_config(MilArch::Pool, LossType::Mse);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MilModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.arch, MilArch::Pool);
        assert_eq!(back.loss_type, LossType::Mse);
        assert_eq!(back.bag_embed_dim, 16);
    }
}
