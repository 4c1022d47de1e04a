// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Records one CSV row per fold and epoch:
//
//   fold,epoch,train_loss,val_loss,kappa,lr
//   0,1,1.702311,1.655020,0.412008,0.000100
//   0,2,1.520934,1.601173,0.498315,0.000095
//
// The header is only written when the file is new, so several
// folds (or resumed runs) append to the same log.
//
// Also holds the running-average meters the training loop prints
// every `log_every` updates.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

/// One row of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub fold:       usize,
    pub epoch:      usize,
    pub train_loss: f64,
    pub val_loss:   f64,
    /// Quadratic weighted kappa on the validation fold
    pub kappa:      f64,
    /// Learning rate at the end of the epoch
    pub lr:         f64,
}

impl EpochMetrics {
    /// Model selection is on kappa, higher is better.
    pub fn is_improvement(&self, best_kappa: f64) -> bool {
        self.kappa > best_kappa
    }
}

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create '{}'", dir.display()))?;
        Ok(Self { csv_path: dir.join("metrics.csv") })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let is_new = !self.csv_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer.serialize(Rounded::from(m))?;
        writer.flush()?;

        tracing::debug!(
            "Logged fold {} epoch {}: train_loss={:.4} val_loss={:.4} kappa={:.4}",
            m.fold, m.epoch, m.train_loss, m.val_loss, m.kappa,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Read every row back, e.g. to summarise folds.
    pub fn read_all(&self) -> Result<Vec<EpochMetrics>> {
        let mut reader = csv::Reader::from_path(&self.csv_path)
            .with_context(|| format!("Cannot read '{}'", self.csv_path.display()))?;
        reader
            .deserialize()
            .map(|row| row.map_err(anyhow::Error::from))
            .collect()
    }
}

/// Six decimals per float column keeps the log readable.
#[derive(Serialize)]
struct Rounded {
    fold:       usize,
    epoch:      usize,
    train_loss: String,
    val_loss:   String,
    kappa:      String,
    lr:         String,
}

impl From<&EpochMetrics> for Rounded {
    fn from(m: &EpochMetrics) -> Self {
        Self {
            fold:       m.fold,
            epoch:      m.epoch,
            train_loss: format!("{:.6}", m.train_loss),
            val_loss:   format!("{:.6}", m.val_loss),
            kappa:      format!("{:.6}", m.kappa),
            lr:         format!("{:.6e}", m.lr),
        }
    }
}

// ─── Running averages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMeter {
    sum:   f64,
    count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum   += value * n as f64;
        self.count += n;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 { f64::NAN } else { self.sum / self.count as f64 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Named meters, printed in name order.
#[derive(Debug, Clone, Default)]
pub struct MeterSet {
    meters: BTreeMap<&'static str, AverageMeter>,
}

impl MeterSet {
    pub fn update(&mut self, name: &'static str, value: f64, n: usize) {
        self.meters.entry(name).or_default().update(value, n);
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(AverageMeter::average)
    }

    pub fn reset(&mut self) {
        self.meters.values_mut().for_each(AverageMeter::reset);
    }

    pub fn summary(&self) -> String {
        self.meters
            .iter()
            .filter(|(_, m)| m.count() > 0)
            .map(|(name, m)| format!("{name}={:.4}", m.average()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn row(fold: usize, epoch: usize, kappa: f64) -> EpochMetrics {
        EpochMetrics { fold, epoch, train_loss: 1.5, val_loss: 1.25, kappa, lr: 1e-4 }
    }

    #[test]
    fn test_is_improvement() {
        let m = row(0, 2, 0.6);
        assert!(m.is_improvement(0.5));
        assert!(!m.is_improvement(0.6));
    }

    #[test]
    fn test_header_written_once_and_rows_append() {
        let dir    = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&row(0, 1, 0.25)).unwrap();
        logger.log(&row(0, 2, 0.5)).unwrap();

        // a second logger on the same dir keeps appending
        MetricsLogger::new(dir.path()).unwrap().log(&row(1, 1, 0.75)).unwrap();

        let text = fs::read_to_string(logger.csv_path()).unwrap();
        assert_eq!(text.lines().next(), Some("fold,epoch,train_loss,val_loss,kappa,lr"));
        assert_eq!(text.lines().count(), 4);

        let rows = logger.read_all().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].fold, 1);
        assert!((rows[1].kappa - 0.5).abs() < 1e-9);
        assert!((rows[0].lr - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_meters() {
        let mut meters = MeterSet::default();
        assert!(meters.summary().is_empty());
        meters.update("loss", 2.0, 1);
        meters.update("loss", 4.0, 3);
        meters.update("tile_loss", 1.0, 2);
        assert_eq!(meters.average("loss"), Some(3.5));
        assert_eq!(meters.summary(), "loss=3.5000 tile_loss=1.0000");

        meters.reset();
        assert!(meters.average("loss").unwrap().is_nan());
        assert!(meters.summary().is_empty());
    }
}
