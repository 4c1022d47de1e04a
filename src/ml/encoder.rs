// ============================================================
// Layer 5 — Tile Encoder
// ============================================================
// Backbone plus an auxiliary tile-level head that shares the
// feature extractor:
//
//   tiles [T, 3, S, S] ─► backbone ─► feature map [T, C, h, w]
//                                          │
//                                          ├─► (to the aggregator)
//                                          │
//                                          └─► concat pool [T, 2C]
//                                              └─► Linear ─► tile logits
//
// The tile head is trained from the weak tile labels when the
// loss mixes in a tile term; otherwise it is carried along and
// ignored.

use anyhow::{Context, Result};
use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    record::CompactRecorder,
};
use std::path::Path;

use crate::ml::backbone::{concat_pool, BackboneSpec, ConvBackbone};

#[derive(Module, Debug)]
pub struct TileEncoder<B: Backend> {
    pub backbone:  ConvBackbone<B>,
    pub tile_head: Linear<B>,
}

impl<B: Backend> TileEncoder<B> {
    pub fn new(spec: &BackboneSpec, n_tile_outputs: usize, device: &B::Device) -> Self {
        Self {
            backbone:  spec.init(device),
            tile_head: LinearConfig::new(2 * spec.feature_dim(), n_tile_outputs).init(device),
        }
    }

    /// `[T, 3, S, S]` → (feature map `[T, C, h, w]`, tile logits `[T, n_tile_outputs]`).
    pub fn forward(&self, tiles: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let feats = self.backbone.forward(tiles);
        let tile_logits = self.tile_head.forward(concat_pool(feats.clone()));
        (feats, tile_logits)
    }

    /// Replace the backbone weights with a record saved by
    /// `save_backbone` (or any CompactRecorder file of the same
    /// backbone).
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        self.backbone = self
            .backbone
            .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .with_context(|| format!("Cannot load pretrained backbone '{}'", path.display()))?;
        tracing::info!("Loaded pretrained backbone from '{}'", path.display());
        Ok(self)
    }

    pub fn save_backbone(&self, path: &Path) -> Result<()> {
        self.backbone
            .clone()
            .save_file(path.to_path_buf(), &CompactRecorder::new())
            .with_context(|| format!("Cannot save backbone to '{}'", path.display()))
    }
}
