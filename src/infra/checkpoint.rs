// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores MIL model weights with Burn's CompactRecorder
// (named MessagePack, half precision).
//
//   checkpoints/fold_0/
//     model_epoch_1.mpk      weights after epoch 1
//     model_epoch_2.mpk
//     model_best.mpk         weights with the best validation kappa
//     latest_epoch.json      number of the last saved epoch
//     best.json              {"epoch": 2, "kappa": 0.71}
//     train_config.json      everything needed to rebuild the model
//                            and re-tile slides for prediction
//
// Loading fails if the record does not match the architecture
// rebuilt from train_config.json.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::application::train_use_case::TrainConfig;
use crate::ml::model::MilModel;

const LATEST_FILE: &str = "latest_epoch.json";
const BEST_FILE:   &str = "best.json";
const CONFIG_FILE: &str = "train_config.json";
const BEST_MODEL:  &str = "model_best";

/// Which weights to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointChoice {
    #[default]
    Best,
    Latest,
    Epoch(usize),
}

impl FromStr for CheckpointChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best"   => Ok(CheckpointChoice::Best),
            "latest" => Ok(CheckpointChoice::Latest),
            other => other
                .parse::<usize>()
                .map(CheckpointChoice::Epoch)
                .map_err(|_| format!("unknown checkpoint '{other}' (expected best, latest or an epoch)")),
        }
    }
}

impl fmt::Display for CheckpointChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointChoice::Best     => f.write_str("best"),
            CheckpointChoice::Latest   => f.write_str("latest"),
            CheckpointChoice::Epoch(e) => write!(f, "epoch {e}"),
        }
    }
}

/// Contents of best.json.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestCheckpoint {
    pub epoch: usize,
    pub kappa: f64,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates the directory if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint dir '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `model_epoch_{epoch}.mpk` and moves the latest pointer.
    pub fn save_model<B: Backend>(&self, model: &MilModel<B>, epoch: usize) -> Result<()> {
        self.record(model, &format!("model_epoch_{epoch}"))?;
        self.write_json(LATEST_FILE, &epoch)?;
        tracing::debug!("Saved checkpoint: epoch {}", epoch);
        Ok(())
    }

    /// Writes `model_best.mpk` plus best.json.
    pub fn save_best<B: Backend>(&self, model: &MilModel<B>, best: BestCheckpoint) -> Result<()> {
        self.record(model, BEST_MODEL)?;
        self.write_json(BEST_FILE, &best)?;
        tracing::info!("New best model: epoch {} kappa={:.4}", best.epoch, best.kappa);
        Ok(())
    }

    pub fn load_model<B: Backend>(
        &self,
        model:  MilModel<B>,
        choice: CheckpointChoice,
        device: &B::Device,
    ) -> Result<MilModel<B>> {
        let name = match choice {
            CheckpointChoice::Best     => BEST_MODEL.to_string(),
            CheckpointChoice::Latest   => format!("model_epoch_{}", self.latest_epoch()?),
            CheckpointChoice::Epoch(e) => format!("model_epoch_{e}"),
        };
        let path = self.dir.join(&name);
        tracing::info!("Loading {} checkpoint from '{}'", choice, path.display());

        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| {
                format!("Cannot load checkpoint '{}'. Have you trained the model first?", path.display())
            })?;
        Ok(model.load_record(record))
    }

    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        self.write_json(CONFIG_FILE, cfg)?;
        tracing::debug!("Saved training config to '{}'", self.dir.join(CONFIG_FILE).display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join(CONFIG_FILE);
        let json = fs::read_to_string(&path).with_context(|| {
            format!("Cannot read config from '{}'. Run 'train' before 'predict'.", path.display())
        })?;
        serde_json::from_str(&json).with_context(|| format!("Malformed '{}'", path.display()))
    }

    pub fn latest_epoch(&self) -> Result<usize> {
        let s = fs::read_to_string(self.dir.join(LATEST_FILE))
            .with_context(|| format!("Cannot find '{LATEST_FILE}'. Have you run 'train' first?"))?;
        Ok(serde_json::from_str::<usize>(&s)?)
    }

    pub fn best(&self) -> Result<Option<BestCheckpoint>> {
        let path = self.dir.join(BEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&s)?))
    }

    fn record<B: Backend>(&self, model: &MilModel<B>, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))
    }

    fn write_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.dir.join(file);
        fs::write(&path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("Cannot write '{}'", path.display()))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{loss::LossType, mil::MilArch, model::MilModelConfig};
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TB = NdArray<f32>;

    fn model_config() -> MilModelConfig {
        MilModelConfig::new("cnn-4".into())
            .with_arch(MilArch::AttentionBatched)
            .with_loss_type(LossType::Ce)
            .with_bag_embed_dim(8)
            .with_bag_hidden_dim(4)
            .with_classifier_hidden_dim(4)
            .with_dropout(0.0)
    }

    fn logits(model: &MilModel<TB>, tiles: Tensor<TB, 5>) -> Vec<f32> {
        let mask = Tensor::from_data(TensorData::new(vec![true; 2], [1, 2]), &Default::default());
        model.forward(tiles, mask).slide_logits.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_choice_parsing() {
        assert_eq!("best".parse::<CheckpointChoice>().unwrap(), CheckpointChoice::Best);
        assert_eq!("Latest".parse::<CheckpointChoice>().unwrap(), CheckpointChoice::Latest);
        assert_eq!("7".parse::<CheckpointChoice>().unwrap(), CheckpointChoice::Epoch(7));
        assert!("newest".parse::<CheckpointChoice>().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir    = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ckpt   = CheckpointManager::new(dir.path().join("fold_0")).unwrap();

        let trained = model_config().init::<TB>(&device).unwrap();
        ckpt.save_model(&trained, 1).unwrap();
        ckpt.save_best(&trained, BestCheckpoint { epoch: 1, kappa: 0.5 }).unwrap();
        assert_eq!(ckpt.latest_epoch().unwrap(), 1);
        assert_eq!(ckpt.best().unwrap(), Some(BestCheckpoint { epoch: 1, kappa: 0.5 }));
        for file in ["model_epoch_1.mpk", "model_best.mpk", "latest_epoch.json", "best.json"] {
            assert!(ckpt.dir().join(file).exists(), "{file} missing");
        }

        let tiles = Tensor::<TB, 5>::random([1, 2, 3, 16, 16], Distribution::Default, &device);
        let restored: Vec<Vec<f32>> = [CheckpointChoice::Best, CheckpointChoice::Latest, CheckpointChoice::Epoch(1)]
            .into_iter()
            .map(|choice| {
                let fresh = model_config().init::<TB>(&device).unwrap();
                logits(&ckpt.load_model(fresh, choice, &device).unwrap(), tiles.clone())
            })
            .collect();

        // records are half precision, so compare restored models with each other
        for other in &restored[1..] {
            for (a, b) in other.iter().zip(&restored[0]) {
                assert!((a - b).abs() < 1e-6, "{a} vs {b}");
            }
        }
        let untrained = logits(&model_config().init::<TB>(&device).unwrap(), tiles);
        assert!(untrained.iter().zip(&restored[0]).any(|(a, b)| (a - b).abs() > 1e-4));
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let dir  = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path()).unwrap();
        assert!(ckpt.latest_epoch().is_err());
        assert_eq!(ckpt.best().unwrap(), None);
        let model = model_config().init::<TB>(&Default::default()).unwrap();
        assert!(ckpt.load_model(model, CheckpointChoice::Best, &Default::default()).is_err());
        assert!(ckpt.load_config().is_err());
    }
}
