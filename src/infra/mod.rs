// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches the disk outside of slide decoding:
//
//   tile_store.rs   — SQLite cache of extracted tiles plus the
//                     tiling parameters that produced them
//
//   checkpoint.rs   — model weights (CompactRecorder), best /
//                     latest pointers and the training config
//                     needed to rebuild the model for prediction
//
//   metrics.rs      — per-epoch metrics CSV and the running
//                     averages printed during training
//
//   predictions.rs  — the image_id,isup_grade output table
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// SQLite-backed tile cache
pub mod tile_store;

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Training metrics CSV logger
pub mod metrics;

/// Prediction CSV output
pub mod predictions;
