// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that builds, trains or runs the network lives here.
//
//   backbone.rs   — registry of convolutional tile backbones
//   encoder.rs    — backbone + auxiliary tile head
//   mil.rs        — attention / pool aggregation of a bag
//   classifier.rs — bag embedding → slide outputs
//   model.rs      — the three above wired together, plus config
//   loss.rs       — slide / tile / mixed loss selection
//   kappa.rs      — quadratic weighted kappa, grade decoding
//   trainer.rs    — train + validation loop for one fold
//   inferencer.rs — checkpoint loading and slide grading
//   device.rs     — cpu / wgpu backend choice
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Ilse et al. (2018) Attention-based Deep Multiple Instance Learning

/// Backbone registry and conv blocks
pub mod backbone;

/// Tile encoder with auxiliary tile head
pub mod encoder;

/// Attention-based MIL aggregator
pub mod mil;

/// Slide-level classification head
pub mod classifier;

/// Full MIL model and its configuration
pub mod model;

/// Loss selection and masked tile loss
pub mod loss;

/// Quadratic weighted kappa
pub mod kappa;

/// Training loop with validation and checkpointing
pub mod trainer;

/// Slide predictor
pub mod inferencer;

/// Backend / device selection
pub mod device;
