// ============================================================
// Configuration Errors
// ============================================================
// Everything that can be wrong with a configuration is caught
// when the configuration is loaded, before any slide is opened
// or any tensor is allocated. Runtime failures elsewhere use
// anyhow with context instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported backbone architecture '{name}' (available: {available})")]
    UnsupportedBackbone { name: String, available: String },

    #[error("pretrained weights '{}' not found", .0.display())]
    MissingPretrained(PathBuf),

    #[error("{field} = {value} is out of range, expected {expected}")]
    OutOfRange {
        field:    &'static str,
        value:    String,
        expected: &'static str,
    },

    #[error("fold {fold} is not in 0..{n_folds}")]
    InvalidFold { fold: usize, n_folds: usize },
}

impl ConfigError {
    pub fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        ConfigError::OutOfRange { field, value: value.to_string(), expected }
    }
}
