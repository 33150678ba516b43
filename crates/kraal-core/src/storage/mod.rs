//! On-disk model storage.
//!
//! The filesystem is the source of truth for the local model set: one
//! subdirectory per model holding `model.gguf` and an optional
//! `metadata.json`.

pub mod layout;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use layout::{dir_name_to_model, model_name_to_dir};

/// A locally available model record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    pub path: PathBuf,
    pub valid: bool,
}

/// Resolves model names to files under a fixed models directory.
#[derive(Debug, Clone)]
pub struct ModelStorage {
    models_dir: PathBuf,
}

impl ModelStorage {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Resolve a model name to its `model.gguf` path, if present.
    pub fn resolve(&self, model_name: &str) -> Option<PathBuf> {
        let path = layout::gguf_path(&self.models_dir, model_name);
        debug!(
            "resolve: model={} path={} exists={}",
            model_name,
            path.display(),
            path.exists()
        );
        path.exists().then_some(path)
    }

    /// Enumerate models on disk: immediate subdirectories that contain a
    /// `model.gguf`.
    pub fn list_available(&self) -> Vec<ModelRecord> {
        let mut out = Vec::new();

        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(_) => return out,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let gguf = path.join("model.gguf");
            if !gguf.exists() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            out.push(ModelRecord {
                name: layout::dir_name_to_model(&dir_name),
                path: gguf,
                valid: true,
            });
        }

        debug!("list_available: found {} models", out.len());
        out
    }

    /// Load the optional `metadata.json` for a model.
    pub fn load_metadata(&self, model_name: &str) -> Option<serde_json::Value> {
        let path = layout::metadata_path(&self.models_dir, model_name);
        if !path.exists() {
            return None;
        }
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                None
            }
        }
    }

    /// The stored chat template for a model, if any.
    pub fn chat_template(&self, model_name: &str) -> Option<String> {
        self.load_metadata(model_name)?
            .get("chat_template")?
            .as_str()
            .map(str::to_string)
    }

    /// Whether the model blob exists as a regular file.
    pub fn validate(&self, model_name: &str) -> bool {
        let path = layout::gguf_path(&self.models_dir, model_name);
        path.is_file()
    }
}
