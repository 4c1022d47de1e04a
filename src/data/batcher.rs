// ============================================================
// Layer 4 — Bag Batcher
// ============================================================
// Implements Burn's Batcher trait to stack SlideItems into the
// tensors the MIL model consumes.
//
// Shapes for a batch of B bags of N tiles of size S:
//
//   tiles         [B, N, 3, S, S]   float, already normalized
//   tile_mask     [B, N]            bool, true = real tile
//   tile_labels   [B * N]           int, -1 = ignore
//   slide_labels  [B]               int, -1 = unlabelled
//
// Every bag coming out of the datasets has the same N, so the
// batcher only concatenates; no padding happens here.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};

use crate::data::dataset::SlideItem;

// ─── SlideBatch ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct SlideBatch<B: Backend> {
    pub tiles:        Tensor<B, 5>,
    pub tile_mask:    Tensor<B, 2, Bool>,
    pub tile_labels:  Tensor<B, 1, Int>,
    pub slide_labels: Tensor<B, 1, Int>,
    pub image_ids:    Vec<String>,
}

impl<B: Backend> SlideBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.image_ids.len()
    }
}

// ─── SlideBatcher ─────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct SlideBatcher<B: Backend> {
    device:     B::Device,
    input_size: usize,
}

impl<B: Backend> SlideBatcher<B> {
    pub fn new(device: B::Device, input_size: u32) -> Self {
        Self { device, input_size: input_size as usize }
    }
}

impl<B: Backend> Batcher<SlideItem, SlideBatch<B>> for SlideBatcher<B> {
    fn batch(&self, items: Vec<SlideItem>) -> SlideBatch<B> {
        let batch_size = items.len();
        let n_tiles    = items.first().map(|i| i.n_tiles()).unwrap_or(0);
        let s          = self.input_size;
        debug_assert!(items.iter().all(|i| i.n_tiles() == n_tiles));

        // ── Pixels ────────────────────────────────────────────────────────────
        let mut pixels = Vec::with_capacity(batch_size * n_tiles * 3 * s * s);
        for item in &items {
            pixels.extend_from_slice(&item.tiles);
        }
        let tiles = Tensor::<B, 5>::from_data(
            TensorData::new(pixels, [batch_size, n_tiles, 3, s, s]),
            &self.device,
        );

        // ── Mask and labels ───────────────────────────────────────────────────
        let mask: Vec<i64> = items
            .iter()
            .flat_map(|i| i.real_mask.iter().map(|&real| real as i64))
            .collect();
        let tile_mask = Tensor::<B, 2, Int>::from_data(
            TensorData::new(mask, [batch_size, n_tiles]),
            &self.device,
        )
        .greater_elem(0);

        let tile_labels: Vec<i64> = items
            .iter()
            .flat_map(|i| i.tile_labels.iter().map(|&l| l as i64))
            .collect();
        let tile_labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(tile_labels, [batch_size * n_tiles]),
            &self.device,
        );

        let slide_labels: Vec<i64> = items.iter().map(|i| i.slide_label as i64).collect();
        let slide_labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(slide_labels, [batch_size]),
            &self.device,
        );

        SlideBatch {
            tiles,
            tile_mask,
            tile_labels,
            slide_labels,
            image_ids: items.into_iter().map(|i| i.image_id).collect(),
        }
    }
}
