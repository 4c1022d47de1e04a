// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from slide files on disk all
// the way to device-ready tensor batches.
//
// The pipeline flows in this order:
//
//   <slides_dir>/<image_id>.tiff
//       │
//       ▼
//   SlideReader        → decodes one pyramid level to RGB
//       │
//       ▼
//   TileExtractor      → grid, score, keep the top_n tiles
//       │                (+ ReinhardNormalizer on real tiles)
//       ▼
//   TileStore          → optional on-disk cache (infra layer)
//       │
//       ▼
//   Slide datasets     → implement Burn's Dataset trait
//       │                (TileTransform: resize + normalize)
//       ▼
//   SlideBatcher       → stacks bags into tensor batches
//       │
//       ▼
//   DataLoader         → feeds batches to the training loop
//
// Label tables (CSV) and the fold splitter sit beside the chain.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Decodes TIFF pyramid levels
pub mod slide_reader;

/// Grid tiling and informative tile selection
pub mod tiler;

/// Reinhard stain normalization in Lab space
pub mod stain;

/// Tile → channel-first float buffer
pub mod transform;

/// Slide and tile label tables
pub mod labels;

/// Implements Burn's Dataset trait for bags
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Seeded splits and stratified folds
pub mod splitter;
