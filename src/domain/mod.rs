// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types for the concepts the pipeline moves around:
// slides with their grades, tiles cut out of them, and the bags
// of tiles the MIL model consumes.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only structs, enums, traits and small pure helpers
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// Slides, data providers and ISUP / Gleason grading
pub mod slide;

// Tiles, weak tile labels and bags
pub mod tile;

// Seams implemented by the data and infra layers
pub mod traits;
