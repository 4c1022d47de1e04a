// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Train + validation loop for one fold, using Burn's DataLoader
// and Adam.
//
//   for epoch in 1..=epochs
//     TRAIN   autodiff backend, dropout active
//             loss → backward → clip grads at 1.0 → Adam step
//             LR schedule stepped once per update
//             running averages logged every `log_every` updates
//     VAL     model.valid() on the inner backend, no gradients
//             loss + quadratic weighted kappa over the whole fold
//     SAVE    metrics row, model_epoch_{n}, model_best on a new
//             best kappa
//
// Key Burn insight:
//   - model.valid() returns the model on B::InnerBackend
//   - the validation batcher must build tensors on that backend
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam
//            Ilse et al. (2018) Attention-based Deep MIL

use anyhow::{bail, Result};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    grad_clipping::GradientClippingConfig,
    lr_scheduler::{
        cosine::{CosineAnnealingLrScheduler, CosineAnnealingLrSchedulerConfig},
        linear::{LinearLrScheduler, LinearLrSchedulerConfig},
        LrScheduler,
    },
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Instant};

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    batcher::{SlideBatch, SlideBatcher},
    dataset::SlideItem,
};
use crate::infra::{
    checkpoint::{BestCheckpoint, CheckpointManager},
    metrics::{AverageMeter, EpochMetrics, MeterSet, MetricsLogger},
};
use crate::ml::{
    kappa::{predict_grades, quadratic_weighted_kappa},
    loss::MilLoss,
    model::MilModel,
};

/// Gradient values are clipped to ±1.0 before every Adam step.
const GRAD_CLIP_VALUE: f32 = 1.0;

/// Linear and cosine schedules decay to this fraction of the base LR.
const FINAL_LR_FRACTION: f64 = 0.01;

// ─── LR schedule ──────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedule {
    #[default]
    Constant,
    Linear,
    Cosine,
}

impl FromStr for LrSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(LrSchedule::Constant),
            "linear"   => Ok(LrSchedule::Linear),
            "cosine"   => Ok(LrSchedule::Cosine),
            other => Err(format!("unknown schedule '{other}' (expected constant, linear or cosine)")),
        }
    }
}

impl fmt::Display for LrSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LrSchedule::Constant => "constant",
            LrSchedule::Linear   => "linear",
            LrSchedule::Cosine   => "cosine",
        })
    }
}

enum LrPlan {
    Constant(f64),
    Linear(LinearLrScheduler),
    Cosine(CosineAnnealingLrScheduler),
}

impl LrPlan {
    /// burn's schedulers return the base LR on the first step and
    /// reach the final LR after `iters + 1` steps, so the last of
    /// `total_updates` updates runs at the final LR.
    fn new(schedule: LrSchedule, lr: f64, total_updates: usize) -> Result<Self> {
        let iters = total_updates.saturating_sub(1).max(1);
        let final_lr = lr * FINAL_LR_FRACTION;
        Ok(match schedule {
            LrSchedule::Constant => LrPlan::Constant(lr),
            LrSchedule::Linear => LrPlan::Linear(
                LinearLrSchedulerConfig::new(lr, final_lr, iters)
                    .init()
                    .map_err(anyhow::Error::msg)?,
            ),
            LrSchedule::Cosine => LrPlan::Cosine(
                CosineAnnealingLrSchedulerConfig::new(lr, iters)
                    .with_min_lr(final_lr)
                    .init()
                    .map_err(anyhow::Error::msg)?,
            ),
        })
    }

    /// Learning rate for the next update.
    fn step(&mut self) -> f64 {
        match self {
            LrPlan::Constant(lr) => *lr,
            LrPlan::Linear(s)    => s.step(),
            LrPlan::Cosine(s)    => s.step(),
        }
    }
}

// ─── Results ──────────────────────────────────────────────────────────────────

/// Validation pass over one fold.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub loss:        f64,
    pub kappa:       f64,
    pub predictions: Vec<usize>,
    pub targets:     Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FoldSummary {
    pub fold:       usize,
    pub best_epoch: usize,
    pub best_kappa: f64,
    pub history:    Vec<EpochMetrics>,
}

// ─── Training ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub fn run_training<B, DT, DV>(
    cfg:           &TrainConfig,
    fold:          usize,
    train_dataset: DT,
    val_dataset:   DV,
    loss_fn:       MilLoss,
    ckpt:          &CheckpointManager,
    metrics:       &MetricsLogger,
    device:        &B::Device,
) -> Result<FoldSummary>
where
    B:  AutodiffBackend,
    DT: Dataset<SlideItem> + 'static,
    DV: Dataset<SlideItem> + 'static,
{
    if train_dataset.is_empty() {
        bail!("Fold {fold} has no training slides");
    }
    let n_classes = cfg.model.n_slide_classes;

    // ── Build model ───────────────────────────────────────────────────────────
    let mut model: MilModel<B> = cfg.model.init(device)?;
    tracing::info!(
        "Fold {}: backbone={} arch={} loss={} terms={:?}",
        fold, cfg.model.backbone, cfg.model.arch, cfg.model.loss_type, loss_fn.terms,
    );

    // ── Adam with weight decay and value clipping ─────────────────────────────
    let mut optim = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay as f32)))
        .with_grad_clipping(Some(GradientClippingConfig::Value(GRAD_CLIP_VALUE)))
        .init();

    let updates_per_epoch = train_dataset.len().div_ceil(cfg.batch_size);
    let mut schedule = LrPlan::new(cfg.schedule, cfg.lr, updates_per_epoch * cfg.epochs)?;

    // ── Data loaders ──────────────────────────────────────────────────────────
    let train_loader = DataLoaderBuilder::new(SlideBatcher::<B>::new(device.clone(), cfg.input_size))
        .batch_size(cfg.batch_size)
        .shuffle(cfg.seed)
        .num_workers(cfg.num_workers)
        .build(train_dataset);

    let val_loader = DataLoaderBuilder::new(SlideBatcher::<B::InnerBackend>::new(device.clone(), cfg.input_size))
        .batch_size(cfg.batch_size)
        .num_workers(cfg.num_workers)
        .build(val_dataset);

    // ── Epoch loop ────────────────────────────────────────────────────────────
    let mut best = BestCheckpoint { epoch: 0, kappa: f64::NEG_INFINITY };
    let mut history = Vec::with_capacity(cfg.epochs);
    let mut lr = cfg.lr;

    for epoch in 1..=cfg.epochs {
        let mut epoch_loss = AverageMeter::default();
        let mut fast_stats = MeterSet::default();
        let mut window     = Instant::now();

        for (step, batch) in train_loader.iter().enumerate() {
            let n   = batch.batch_size();
            let out = model.forward(batch.tiles, batch.tile_mask);
            let losses = loss_fn.forward(&out, batch.tile_labels, batch.slide_labels);

            let total: f64 = losses.total.clone().into_scalar().elem::<f64>();
            epoch_loss.update(total, n);
            fast_stats.update("loss", total, n);
            if let Some(slide) = losses.slide {
                fast_stats.update("slide_loss", slide.into_scalar().elem::<f64>(), n);
            }
            if let Some(tile) = losses.tile {
                fast_stats.update("tile_loss", tile.into_scalar().elem::<f64>(), n);
            }

            lr = schedule.step();
            let grads = GradientsParams::from_grads(losses.total.backward(), &model);
            model = optim.step(lr, model, grads);

            let done = step + 1;
            if done % cfg.log_every == 0 {
                let per_update = window.elapsed().as_secs_f64() / cfg.log_every as f64;
                tracing::info!(
                    "Fold {}, Epoch {}, Updates {}/{}, {}, lr={:.2e}, {:.3}s/update",
                    fold, epoch, done, updates_per_epoch, fast_stats.summary(), lr, per_update,
                );
                fast_stats.reset();
                window = Instant::now();
            }
        }

        // ── Validation phase ──────────────────────────────────────────────────
        let model_valid = model.valid();
        let outcome = evaluate(&model_valid, val_loader.as_ref(), &loss_fn, n_classes)?;

        let row = EpochMetrics {
            fold,
            epoch,
            train_loss: epoch_loss.average(),
            val_loss:   outcome.loss,
            kappa:      outcome.kappa,
            lr,
        };
        println!(
            "Fold {} Epoch {:>3}/{} | train_loss={:.4} | val_loss={:.4} | kappa={:.4} | lr={:.2e}",
            fold, epoch, cfg.epochs, row.train_loss, row.val_loss, row.kappa, row.lr,
        );
        metrics.log(&row)?;

        ckpt.save_model(&model_valid, epoch)?;
        if row.is_improvement(best.kappa) {
            best = BestCheckpoint { epoch, kappa: row.kappa };
            ckpt.save_best(&model_valid, best)?;
        }
        history.push(row);
    }

    tracing::info!("Fold {} complete: best kappa {:.4} at epoch {}", fold, best.kappa, best.epoch);
    Ok(FoldSummary { fold, best_epoch: best.epoch, best_kappa: best.kappa, history })
}

/// Loss and kappa over every batch of `loader`. Unlabelled slides
/// count towards the loss only if the loss does not need them;
/// they never count towards kappa.
pub fn evaluate<B: Backend>(
    model:     &MilModel<B>,
    loader:    &dyn DataLoader<SlideBatch<B>>,
    loss_fn:   &MilLoss,
    n_classes: usize,
) -> Result<EvalOutcome> {
    let mut loss_meter  = AverageMeter::default();
    let mut predictions = Vec::new();
    let mut targets     = Vec::new();

    for batch in loader.iter() {
        let n      = batch.batch_size();
        let out    = model.forward(batch.tiles, batch.tile_mask);
        let losses = loss_fn.forward(&out, batch.tile_labels, batch.slide_labels.clone());
        loss_meter.update(losses.total.into_scalar().elem::<f64>(), n);

        let grades = predict_grades(out.slide_logits, loss_fn.loss_type, n_classes)?;
        let labels = batch
            .slide_labels
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("Cannot read back slide labels: {e:?}"))?;
        for (pred, label) in grades.into_iter().zip(labels) {
            if label >= 0 {
                predictions.push(pred);
                targets.push(label as usize);
            }
        }
    }

    let kappa = quadratic_weighted_kappa(&predictions, &targets, n_classes);
    Ok(EvalOutcome { loss: loss_meter.average(), kappa, predictions, targets })
}
