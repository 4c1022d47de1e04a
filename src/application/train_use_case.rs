// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates training over one or all folds:
//
//   Step 1: Validate the configuration
//   Step 2: Open the tile store           (Layer 6 - infra)
//   Step 3: Load labelled slides          (Layer 4 - data)
//   Step 4: Per fold: stratified split    (Layer 4 - data)
//   Step 5:           class weights, loss (Layer 5 - ml)
//   Step 6:           datasets            (Layer 4 - data)
//   Step 7:           save config         (Layer 6 - infra)
//   Step 8:           training loop       (Layer 5 - ml)
//
// The store manifest is copied into the saved config so that
// prediction can tile new slides exactly like the training tiles.
//
// Reference: Burn Book §5 (Training)

use anyhow::{bail, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}, sync::Arc};

use crate::data::{
    dataset::{BagShape, StoredSlideDataset},
    labels::CsvSlideSource,
    splitter::fold_split,
    transform::TileTransform,
};
use crate::domain::{slide::Slide, traits::SlideSource};
use crate::error::ConfigError;
use crate::infra::{
    checkpoint::CheckpointManager,
    metrics::MetricsLogger,
    tile_store::{StoreManifest, TileStore},
};
use crate::ml::{
    loss::{class_weights, LossTerms, LossType, MilLoss},
    model::MilModelConfig,
    trainer::{run_training, FoldSummary, LrSchedule},
};

// ─── Training Configuration ──────────────────────────────────────────────────
// Serialisable so it can be saved next to the checkpoints and
// reloaded by `predict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub slide_table:    PathBuf,
    pub tile_store:     PathBuf,
    pub checkpoint_dir: PathBuf,
    pub model:          MilModelConfig,
    /// Weight of the tile loss; see LossTerms::select.
    pub alpha:          f64,
    /// Inverse-frequency class weights for the slide CE loss.
    pub class_weighted: bool,
    pub epochs:         usize,
    pub batch_size:     usize,
    pub lr:             f64,
    pub weight_decay:   f64,
    pub schedule:       LrSchedule,
    pub log_every:      usize,
    /// Network input edge; tiles are resized to this.
    pub input_size:     u32,
    pub n_folds:        usize,
    /// Train a single fold; None trains every fold.
    pub fold:           Option<usize>,
    pub num_workers:    usize,
    pub seed:           u64,
    /// How the training tiles were made. Filled in from the store.
    #[serde(default)]
    pub manifest:       Option<StoreManifest>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            slide_table:    "data/train.csv".into(),
            tile_store:     "data/tiles.sqlite".into(),
            checkpoint_dir: "checkpoints".into(),
            model:          MilModelConfig::new("resnet-lite-4".into()),
            alpha:          0.0,
            class_weighted: false,
            epochs:         30,
            batch_size:     4,
            lr:             3e-4,
            weight_decay:   1e-4,
            schedule:       LrSchedule::Constant,
            log_every:      50,
            input_size:     256,
            n_folds:        4,
            fold:           None,
            num_workers:    4,
            seed:           42,
            manifest:       None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::out_of_range("alpha", self.alpha, "in [0, 1]"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::out_of_range("batch_size", self.batch_size, "> 0"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::out_of_range("epochs", self.epochs, "> 0"));
        }
        if !(self.lr > 0.0 && self.lr <= 1.0) {
            return Err(ConfigError::out_of_range("lr", self.lr, "in (0, 1]"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::out_of_range("weight_decay", self.weight_decay, ">= 0"));
        }
        if self.log_every == 0 {
            return Err(ConfigError::out_of_range("log_every", self.log_every, "> 0"));
        }
        if self.input_size == 0 {
            return Err(ConfigError::out_of_range("input_size", self.input_size, "> 0"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::out_of_range("num_workers", self.num_workers, ">= 1"));
        }
        if self.n_folds < 2 {
            return Err(ConfigError::InvalidFold { fold: self.fold.unwrap_or(0), n_folds: self.n_folds });
        }
        if let Some(fold) = self.fold {
            if fold >= self.n_folds {
                return Err(ConfigError::InvalidFold { fold, n_folds: self.n_folds });
            }
        }
        if let Some(manifest) = &self.manifest {
            manifest.tiling.validate()?;
        }
        Ok(())
    }

    /// Overlay the keys present in a JSON file on top of `self`.
    /// Nested objects (e.g. "model") are merged key by key.
    pub fn with_overrides(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file '{}'", path.display()))?;
        let overrides: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("'{}' is not valid JSON", path.display()))?;

        let mut base = serde_json::to_value(&self)?;
        merge_json(&mut base, overrides);
        let merged = serde_json::from_value(base)
            .with_context(|| format!("Invalid training config in '{}'", path.display()))?;
        tracing::info!("Applied config overrides from '{}'", path.display());
        Ok(merged)
    }

    pub fn loss_terms(&self) -> LossTerms {
        LossTerms::select(self.model.arch, self.alpha)
    }

    pub fn fold_dir(&self, fold: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("fold_{fold}"))
    }
}

fn merge_json(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute<B: AutodiffBackend>(&self, device: &B::Device) -> Result<Vec<FoldSummary>> {
        let cfg = &self.config;

        // ── Step 1: Validate ──────────────────────────────────────────────────
        cfg.validate()?;

        // ── Step 2: Tile store ────────────────────────────────────────────────
        let store    = Arc::new(TileStore::open(&cfg.tile_store)?);
        let manifest = store.manifest()?;
        let shape = BagShape {
            top_n:          manifest.tiling.top_n,
            tile_size:      manifest.tiling.tile_size,
            n_tile_classes: cfg.model.n_tile_classes,
        };

        // ── Step 3: Labelled slides present in the store ──────────────────────
        let slides = self.training_slides(&store)?;

        let folds: Vec<usize> = match cfg.fold {
            Some(fold) => vec![fold],
            None => (0..cfg.n_folds).collect(),
        };

        let metrics = MetricsLogger::new(&cfg.checkpoint_dir)?;
        let mut summaries = Vec::with_capacity(folds.len());

        for fold in folds {
            // ── Step 4: Split ─────────────────────────────────────────────────
            let (train, val) = fold_split(slides.clone(), cfg.n_folds, fold, cfg.seed, |s: &Slide| s.label())?;
            tracing::info!("Fold {}: {} training, {} validation slides", fold, train.len(), val.len());

            // ── Step 5: Loss ──────────────────────────────────────────────────
            let weights = (cfg.class_weighted && cfg.model.loss_type == LossType::Ce).then(|| {
                let grades: Vec<u8> = train.iter().filter_map(Slide::label).collect();
                class_weights(&grades, cfg.model.n_slide_classes)
            });
            if let Some(w) = &weights {
                tracing::info!("Class weights: {:?}", w);
            }
            let loss_fn = MilLoss::new(cfg.model.loss_type, cfg.loss_terms()).with_class_weights(weights);

            // ── Step 6: Datasets ──────────────────────────────────────────────
            let transform = TileTransform::new(cfg.input_size);
            let train_ds  = StoredSlideDataset::new(store.clone(), train, transform.clone(), shape.clone());
            let val_ds    = StoredSlideDataset::new(store.clone(), val, transform, shape.clone());

            // ── Step 7: Config for prediction ─────────────────────────────────
            let fold_cfg = TrainConfig {
                fold:     Some(fold),
                manifest: Some(manifest.clone()),
                ..cfg.clone()
            };
            let ckpt = CheckpointManager::new(cfg.fold_dir(fold))?;
            ckpt.save_config(&fold_cfg)?;

            // ── Step 8: Train ─────────────────────────────────────────────────
            let summary = run_training::<B, _, _>(
                &fold_cfg, fold, train_ds, val_ds, loss_fn, &ckpt, &metrics, device,
            )?;
            summaries.push(summary);
        }

        if summaries.len() > 1 {
            let mean = summaries.iter().map(|s| s.best_kappa).sum::<f64>() / summaries.len() as f64;
            tracing::info!("Mean best kappa over {} folds: {:.4}", summaries.len(), mean);
        }
        Ok(summaries)
    }

    fn training_slides(&self, store: &TileStore) -> Result<Vec<Slide>> {
        let all = CsvSlideSource::new(&self.config.slide_table).load_slides()?;
        let total = all.len();
        let stored: std::collections::HashSet<String> = store.slide_ids()?.into_iter().collect();
        let n_classes = self.config.model.n_slide_classes;

        let mut out_of_range = 0usize;
        let slides: Vec<Slide> = all
            .into_iter()
            .filter(|s| stored.contains(&s.image_id))
            .filter(|s| match s.label() {
                Some(grade) if (grade as usize) < n_classes => true,
                Some(_) => {
                    out_of_range += 1;
                    false
                }
                None => false,
            })
            .collect();
        if out_of_range > 0 {
            tracing::warn!(
                "Dropped {} slides graded outside the {} slide classes",
                out_of_range, n_classes,
            );
        }
        if slides.len() < total {
            tracing::warn!(
                "Dropped {} of {} slides (no grade, grade out of range or no stored tiles)",
                total - slides.len(), total,
            );
        }
        if slides.len() < self.config.n_folds {
            bail!(
                "Only {} usable slides for {} folds",
                slides.len(), self.config.n_folds
            );
        }
        Ok(slides)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tiler::TilingConfig;
    use crate::domain::tile::{Tile, TileLabel};
    use crate::infra::tile_store::TileStoreWriter;
    use crate::data::slide_reader::PyramidLevel;
    use crate::ml::{device::CpuTrainBackend, mil::MilArch};
    use image::{Rgb, RgbImage};

    fn small_model() -> MilModelConfig {
        MilModelConfig::new("cnn-4".into())
            .with_bag_embed_dim(8)
            .with_bag_hidden_dim(4)
            .with_classifier_hidden_dim(4)
    }

    #[test]
    fn test_validate_ranges() {
        let ok = TrainConfig { model: small_model(), ..TrainConfig::default() };
        assert!(ok.validate().is_ok());

        let bad_alpha = TrainConfig { alpha: 1.5, ..ok.clone() };
        assert!(matches!(bad_alpha.validate(), Err(ConfigError::OutOfRange { field: "alpha", .. })));

        let bad_batch = TrainConfig { batch_size: 0, ..ok.clone() };
        assert!(matches!(bad_batch.validate(), Err(ConfigError::OutOfRange { field: "batch_size", .. })));

        let bad_fold = TrainConfig { fold: Some(4), n_folds: 4, ..ok.clone() };
        assert!(matches!(bad_fold.validate(), Err(ConfigError::InvalidFold { fold: 4, n_folds: 4 })));

        let bad_backbone = TrainConfig { model: MilModelConfig::new("alexnet".into()), ..ok };
        assert!(matches!(bad_backbone.validate(), Err(ConfigError::UnsupportedBackbone { .. })));
    }

    #[test]
    fn test_json_overrides_merge_nested_keys() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"epochs": 3, "schedule": "cosine", "model": {"arch": "pool"}}"#).unwrap();

        let cfg = TrainConfig { model: small_model(), ..TrainConfig::default() }
            .with_overrides(&path)
            .unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.schedule, LrSchedule::Cosine);
        assert_eq!(cfg.model.arch, MilArch::Pool);
        // untouched nested keys survive
        assert_eq!(cfg.model.backbone, "cnn-4");
        assert_eq!(cfg.model.bag_embed_dim, 8);
        assert_eq!(cfg.batch_size, 4);
    }

    #[test]
    fn test_bad_override_file_fails() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"epochs": "many"}"#).unwrap();
        assert!(TrainConfig::default().with_overrides(&path).is_err());
        assert!(TrainConfig::default().with_overrides(dir.path().join("none.json")).is_err());
    }

    /// Store with one tile per slide `s{i}` and a table grading it `grade(i)`.
    fn write_store(dir: &Path, n: usize, grade: impl Fn(usize) -> usize) -> (PathBuf, PathBuf, StoreManifest) {
        let tiling = TilingConfig { tile_size: 16, top_n: 3, ..TilingConfig::default() };
        let manifest = StoreManifest { tiling, level: PyramidLevel::Lowest, normalizer: None };

        let store_path = dir.join("tiles.sqlite");
        let mut writer = TileStoreWriter::create(&store_path, &manifest).unwrap();
        let mut table  = String::from("image_id,isup_grade\n");
        for i in 0..n {
            let id   = format!("s{i}");
            let tile = Tile {
                pixels:          RgbImage::from_pixel(16, 16, Rgb([100 + 20 * i as u8, 60, 150])),
                source_index:    Some(0),
                intensity_sum:   0,
                tissue_fraction: 1.0,
                label:           TileLabel::from_raw((i % 2) as i64),
            };
            writer.write_slide(&id, &[(format!("{id}_0"), &tile)]).unwrap();
            table.push_str(&format!("{id},{}\n", grade(i)));
        }
        // unlabelled slide is dropped
        table.push_str("s9,\n");
        drop(writer);

        let slide_table = dir.join("train.csv");
        fs::write(&slide_table, table).unwrap();
        (slide_table, store_path, manifest)
    }

    fn one_fold_config(dir: &Path, slide_table: PathBuf, tile_store: PathBuf) -> TrainConfig {
        TrainConfig {
            slide_table,
            tile_store,
            checkpoint_dir: dir.join("ckpt"),
            model:          small_model().with_arch(MilArch::AttentionPerSample),
            alpha:          0.5,
            class_weighted: true,
            epochs:         1,
            batch_size:     2,
            input_size:     16,
            n_folds:        2,
            fold:           Some(1),
            num_workers:    1,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_train_single_fold_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        // grades 0 and 1 only: the other four classes are absent
        let (slide_table, store_path, manifest) = write_store(dir.path(), 6, |i| i % 2);
        let cfg = one_fold_config(dir.path(), slide_table, store_path);

        let summaries = TrainUseCase::new(cfg.clone())
            .execute::<CpuTrainBackend>(&Default::default())
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].fold, 1);
        assert!(summaries[0].history.iter().all(|m| m.train_loss.is_finite()));

        let ckpt  = CheckpointManager::new(cfg.fold_dir(1)).unwrap();
        let saved = ckpt.load_config().unwrap();
        assert_eq!(saved.fold, Some(1));
        assert_eq!(saved.manifest, Some(manifest));
        assert!(cfg.checkpoint_dir.join("metrics.csv").exists());
    }

    #[test]
    fn test_grades_beyond_slide_classes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (slide_table, store_path, _) = write_store(dir.path(), 8, |i| i % 4);
        let mut cfg = one_fold_config(dir.path(), slide_table, store_path);
        cfg.model = cfg.model.with_n_slide_classes(2).with_n_tile_classes(2);

        let use_case = TrainUseCase::new(cfg);
        let store    = TileStore::open(&use_case.config.tile_store).unwrap();
        let slides   = use_case.training_slides(&store).unwrap();
        assert_eq!(slides.len(), 4);
        assert!(slides.iter().all(|s| s.label().is_some_and(|g| g < 2)));

        let summaries = use_case.execute::<CpuTrainBackend>(&Default::default()).unwrap();
        assert!(summaries[0].history.iter().all(|m| m.train_loss.is_finite()));
    }
}
