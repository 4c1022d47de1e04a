// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// One use case per CLI command. Each one only coordinates the
// other layers:
//
//   extract  slides → tiles → tile store
//   train    tile store → folds → trained checkpoints
//   predict  checkpoint + slides → predictions.csv
//
// No tensor code and no printing here; the backend arrives as a
// type parameter and the device as an argument.
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// Tiling slides into the tile store
pub mod extract_use_case;

// The training workflow
pub mod train_use_case;

// Grading slides with a trained checkpoint
pub mod predict_use_case;
