// ============================================================
// Layer 4 — Label Tables
// ============================================================
// Two CSV tables feed the pipeline:
//
//   slide table   image_id,data_provider,isup_grade,gleason_score
//                 (only image_id is required, e.g. for inference)
//
//   tile table    tile_name,tile_label
//                 (weak per-tile grades written by annotation
//                  tooling; missing or malformed values become
//                  the -1 sentinel)
//
// Unparseable cells never abort a load. They become None via
// csv::invalid_option and the row is kept.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::domain::{
    slide::{DataProvider, GleasonScore, Slide},
    tile::TileLabel,
    traits::SlideSource,
};

#[derive(Debug, Deserialize)]
struct SlideRow {
    image_id: String,
    #[serde(default)]
    data_provider: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    isup_grade: Option<i64>,
    #[serde(default)]
    gleason_score: Option<String>,
}

impl SlideRow {
    fn into_slide(self) -> Slide {
        let provider = self
            .data_provider
            .as_deref()
            .and_then(|p| p.parse::<DataProvider>().ok())
            .unwrap_or_default();
        let gleason = self
            .gleason_score
            .as_deref()
            .and_then(|g| g.parse::<GleasonScore>().ok());
        let isup_grade = self
            .isup_grade
            .and_then(|g| u8::try_from(g).ok());
        Slide { image_id: self.image_id, provider, isup_grade, gleason }
    }
}

/// Reads slides from a PANDA-style CSV table.
pub struct CsvSlideSource {
    path: PathBuf,
}

impl CsvSlideSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SlideSource for CsvSlideSource {
    fn load_slides(&self) -> Result<Vec<Slide>> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .with_context(|| format!("Cannot open slide table '{}'", self.path.display()))?;

        let mut slides = Vec::new();
        for (line, row) in reader.deserialize::<SlideRow>().enumerate() {
            let row = row.with_context(|| {
                format!("'{}' row {}", self.path.display(), line + 2)
            })?;
            slides.push(row.into_slide());
        }

        tracing::info!(
            "Loaded {} slides from '{}' ({} labelled)",
            slides.len(),
            self.path.display(),
            slides.iter().filter(|s| s.label().is_some()).count()
        );
        Ok(slides)
    }
}

#[derive(Debug, Deserialize)]
struct TileRow {
    tile_name: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    tile_label: Option<f64>,
}

/// tile_name → weak tile label.
#[derive(Debug, Clone, Default)]
pub struct TileLabelMap {
    labels: HashMap<String, TileLabel>,
}

impl TileLabelMap {
    pub fn load(path: impl AsRef<Path>, n_classes: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Cannot open tile label table '{}'", path.display()))?;

        let mut labels  = HashMap::new();
        let mut invalid = 0usize;
        for row in reader.deserialize::<TileRow>() {
            let row   = row.with_context(|| format!("Malformed row in '{}'", path.display()))?;
            let label = parse_tile_label(row.tile_label, n_classes);
            if !label.is_valid() {
                invalid += 1;
            }
            labels.insert(row.tile_name, label);
        }

        tracing::info!(
            "Loaded {} tile labels from '{}' ({} invalid)",
            labels.len(), path.display(), invalid
        );
        Ok(Self { labels })
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, TileLabel)>,
        S: Into<String>,
    {
        Self { labels: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }

    /// Unknown tiles get the sentinel.
    pub fn get(&self, tile_name: &str) -> TileLabel {
        self.labels.get(tile_name).copied().unwrap_or(TileLabel::INVALID)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Whole-number values inside the class range are kept; anything
/// else (NaN, fractions, out of range, missing) is the sentinel.
fn parse_tile_label(value: Option<f64>, n_classes: usize) -> TileLabel {
    match value {
        Some(v) if v.is_finite() && v.fract() == 0.0 => TileLabel::checked(v as i64, n_classes),
        _ => TileLabel::INVALID,
    }
}
