//! Model-name to directory-name mapping.
//!
//! A model name is `<family>:<tag>` (a missing tag means `latest`). On disk
//! the colon becomes an underscore so names stay filesystem-safe.

use std::path::{Path, PathBuf};

/// Map a model name to its on-disk directory name.
///
/// `gpt-oss:7b` → `gpt-oss_7b`; an untagged name gains `_latest`.
pub fn model_name_to_dir(model_name: &str) -> String {
    if model_name.is_empty() {
        return "_latest".to_string();
    }

    let mut result = model_name.replace(':', "_");
    if !model_name.contains(':') {
        result.push_str("_latest");
    }
    result
}

/// Map a directory name back to a model name.
///
/// The rightmost underscore becomes the tag separator, so `foo_bar_7b` maps
/// to `foo_bar:7b`. This is lossy for family names that themselves contain
/// underscores; callers that need exact names take them from the router
/// catalog rather than from disk.
pub fn dir_name_to_model(dir_name: &str) -> String {
    match dir_name.rfind('_') {
        Some(pos) => {
            let mut result = dir_name.to_string();
            result.replace_range(pos..pos + 1, ":");
            result
        }
        None => dir_name.to_string(),
    }
}

/// Path of the model blob for a model name.
pub fn gguf_path(models_dir: &Path, model_name: &str) -> PathBuf {
    models_dir
        .join(model_name_to_dir(model_name))
        .join("model.gguf")
}

/// Path of the optional metadata file for a model name.
pub fn metadata_path(models_dir: &Path, model_name: &str) -> PathBuf {
    models_dir
        .join(model_name_to_dir(model_name))
        .join("metadata.json")
}
