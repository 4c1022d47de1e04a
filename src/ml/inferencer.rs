// ============================================================
// Layer 5 — Slide Predictor
// ============================================================
// Loads a trained MIL model and grades slides:
//
//   train_config.json ─► rebuild MilModel (dropout 0)
//   model_best / model_epoch_n ─► load weights
//   dataset of bags ─► batcher ─► forward ─► grades
//
// Runs on a plain (non-autodiff) backend.

use anyhow::Result;
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    prelude::*,
};

use crate::application::train_use_case::TrainConfig;
use crate::data::{batcher::SlideBatcher, dataset::SlideItem};
use crate::infra::{
    checkpoint::{CheckpointChoice, CheckpointManager},
    predictions::SlidePrediction,
};
use crate::ml::{kappa::predict_grades, model::MilModel};

pub struct SlidePredictor<B: Backend> {
    model:  MilModel<B>,
    config: TrainConfig,
    device: B::Device,
}

impl<B: Backend> SlidePredictor<B> {
    pub fn from_checkpoint(
        ckpt:   &CheckpointManager,
        choice: CheckpointChoice,
        device: &B::Device,
    ) -> Result<Self> {
        let config = ckpt.load_config()?;
        let model_cfg = config.model.clone().with_dropout(0.0).with_pretrained(None);
        let model = ckpt.load_model(model_cfg.init::<B>(device)?, choice, device)?;
        tracing::info!(
            "Model loaded: backbone={} arch={} loss={}",
            config.model.backbone, config.model.arch, config.model.loss_type,
        );
        Ok(Self { model, config, device: device.clone() })
    }

    pub fn new(model: MilModel<B>, config: TrainConfig, device: B::Device) -> Self {
        Self { model, config, device }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// One prediction per slide. With workers, rows come in batch
    /// completion order rather than dataset order.
    pub fn predict<D>(&self, dataset: D, batch_size: usize, num_workers: usize) -> Result<Vec<SlidePrediction>>
    where
        D: Dataset<SlideItem> + 'static,
    {
        let total  = dataset.len();
        let mut builder = DataLoaderBuilder::new(SlideBatcher::<B>::new(self.device.clone(), self.config.input_size))
            .batch_size(batch_size.max(1));
        if num_workers > 0 {
            builder = builder.num_workers(num_workers);
        }
        let loader = builder.build(dataset);

        let n_classes = self.config.model.n_slide_classes;
        let mut rows  = Vec::with_capacity(total);
        for batch in loader.iter() {
            let out    = self.model.forward(batch.tiles, batch.tile_mask);
            let grades = predict_grades(out.slide_logits, self.config.model.loss_type, n_classes)?;
            rows.extend(
                batch
                    .image_ids
                    .into_iter()
                    .zip(grades)
                    .map(|(image_id, isup_grade)| SlidePrediction { image_id, isup_grade }),
            );
            tracing::debug!("Predicted {}/{} slides", rows.len(), total);
        }
        Ok(rows)
    }
}
