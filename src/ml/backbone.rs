// ============================================================
// Layer 5 — Convolutional Backbones
// ============================================================
// The tile encoder's feature extractor, picked by name from an
// explicit registry. Looking a name up happens once, when the
// configuration is validated; an unknown name is a ConfigError
// long before any weight is allocated.
//
// Registered backbones:
//
//   name            blocks  widths                    residual
//   cnn-4           4       32  64  128 256           no
//   resnet-lite-4   4       32  64  128 256           yes
//   resnet-lite-6   6       32  64  128 256 256 512   yes
//
// One block:
//   plain     conv3x3 → BN → ReLU → maxpool 2x2
//   residual  conv3x3 → BN → ReLU → conv3x3 → BN
//             + 1x1 conv shortcut → ReLU → maxpool 2x2
//
// Every block halves the spatial size, so a 128px tile leaves a
// 4-block backbone as an 8x8 map. Pooling is skipped once the
// map is down to a single pixel.
//
// Reference: He et al. (2016) Deep Residual Learning
//            Burn Book §3 (Building Blocks)

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::error::ConfigError;

/// One registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneSpec {
    pub name:     &'static str,
    pub widths:   &'static [usize],
    pub residual: bool,
}

impl BackboneSpec {
    /// Channels of the final feature map.
    pub fn feature_dim(&self) -> usize {
        self.widths.last().copied().unwrap_or(3)
    }

    pub fn depth(&self) -> usize {
        self.widths.len()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBackbone<B> {
        let mut in_ch = 3;
        let blocks = self
            .widths
            .iter()
            .map(|&out_ch| {
                let block = ConvBlock::new(in_ch, out_ch, self.residual, device);
                in_ch = out_ch;
                block
            })
            .collect();
        ConvBackbone { blocks }
    }
}

pub const REGISTRY: &[BackboneSpec] = &[
    BackboneSpec { name: "cnn-4",         widths: &[32, 64, 128, 256],           residual: false },
    BackboneSpec { name: "resnet-lite-4", widths: &[32, 64, 128, 256],           residual: true  },
    BackboneSpec { name: "resnet-lite-6", widths: &[32, 64, 128, 256, 256, 512], residual: true  },
];

pub fn lookup(name: &str) -> Result<&'static BackboneSpec, ConfigError> {
    REGISTRY
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ConfigError::UnsupportedBackbone {
            name:      name.to_string(),
            available: available(),
        })
}

pub fn available() -> String {
    REGISTRY.iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
}

// ─── Blocks ───────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1:    Conv2d<B>,
    bn1:      BatchNorm<B, 2>,
    conv2:    Option<Conv2d<B>>,
    bn2:      Option<BatchNorm<B, 2>>,
    shortcut: Option<Conv2d<B>>,
    pool:     MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_ch: usize, out_ch: usize, residual: bool, device: &B::Device) -> Self {
        let conv3 = |i: usize, o: usize| {
            Conv2dConfig::new([i, o], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };
        let (conv2, bn2, shortcut) = if residual {
            (
                Some(conv3(out_ch, out_ch)),
                Some(BatchNormConfig::new(out_ch).init(device)),
                Some(Conv2dConfig::new([in_ch, out_ch], [1, 1]).with_bias(false).init(device)),
            )
        } else {
            (None, None, None)
        };
        Self {
            conv1: conv3(in_ch, out_ch),
            bn1: BatchNormConfig::new(out_ch).init(device),
            conv2,
            bn2,
            shortcut,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.bn1.forward(self.conv1.forward(x.clone()));
        let out = match (&self.conv2, &self.bn2, &self.shortcut) {
            (Some(conv2), Some(bn2), Some(shortcut)) => {
                let out = bn2.forward(conv2.forward(relu(out)));
                relu(out + shortcut.forward(x))
            }
            _ => relu(out),
        };

        let [_, _, h, w] = out.dims();
        if h >= 2 && w >= 2 {
            self.pool.forward(out)
        } else {
            out
        }
    }
}

/// Stack of conv blocks; `[N, 3, S, S]` → `[N, C, S/2^d, S/2^d]`.
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> ConvBackbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// Adaptive concat pooling: per-channel max ‖ mean over the
/// spatial dims. `[N, C, h, w]` → `[N, 2C]`.
pub fn concat_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [n, c, h, w] = x.dims();
    let flat = x.reshape([n, c, h * w]);
    let max  = flat.clone().max_dim(2).reshape([n, c]);
    let avg  = flat.mean_dim(2).reshape([n, c]);
    Tensor::cat(vec![max, avg], 1)
}
