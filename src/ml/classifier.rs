// ============================================================
// Layer 5 — Slide Classifier
// ============================================================
// Maps the bag embedding to slide outputs:
//
//   [B, E] → Linear(E→512) → Mish → LayerNorm → Dropout(0.5) → Linear(512→K)
//
// K = number of ISUP grades for cross-entropy, K = 1 for MSE
// regression.

use burn::{
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::mish,
};

#[derive(Config, Debug)]
pub struct SlideClassifierConfig {
    pub embed_dim: usize,
    pub n_outputs: usize,
    #[config(default = 512)]
    pub hidden_dim: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl SlideClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SlideClassifier<B> {
        SlideClassifier {
            fc1:     LinearConfig::new(self.embed_dim, self.hidden_dim).init(device),
            norm:    LayerNormConfig::new(self.hidden_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2:     LinearConfig::new(self.hidden_dim, self.n_outputs).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct SlideClassifier<B: Backend> {
    fc1:     Linear<B>,
    norm:    LayerNorm<B>,
    dropout: Dropout,
    fc2:     Linear<B>,
}

impl<B: Backend> SlideClassifier<B> {
    pub fn forward(&self, bag: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = mish(self.fc1.forward(bag));
        let x = self.dropout.forward(self.norm.forward(x));
        self.fc2.forward(x)
    }
}
