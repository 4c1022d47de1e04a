// ============================================================
// Layer 6 — Prediction Table
// ============================================================
// The output of `predict`, one row per slide:
//
//   image_id,isup_grade
//   005e66f06bce9c2e49142536caf2f6ee,0
//   004dd32d9cd167d9cc31c13b704498af,3

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidePrediction {
    pub image_id:   String,
    pub isup_grade: usize,
}

pub fn write_predictions(path: impl AsRef<Path>, rows: &[SlidePrediction]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Cannot create '{}'", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    tracing::info!("Wrote {} predictions to '{}'", rows.len(), path.display());
    Ok(())
}

pub fn read_predictions(path: impl AsRef<Path>) -> Result<Vec<SlidePrediction>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    reader
        .deserialize()
        .map(|row| row.map_err(anyhow::Error::from))
        .collect()
}
