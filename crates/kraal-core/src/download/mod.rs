//! Model downloading and catalog synchronization.

mod blob;
mod lock;
mod sync;

use serde::Deserialize;
use std::sync::Arc;

pub use blob::BlobDownloader;
pub use lock::FileLock;
pub use sync::{ModelOverrides, ModelSync, SyncOutcome, SyncState, SyncStatus};

/// Byte-level progress callback: `(downloaded, total)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Per-call download settings.
///
/// Resolved by the caller from per-file manifest entries, per-model
/// overrides and the global config, strongest first.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Expected lowercase hex SHA-256 of the finished file.
    pub expected_sha256: Option<String>,
    /// ETag for a conditional request; only set when a local file exists.
    pub if_none_match: Option<String>,
    /// Bandwidth cap override; `None` falls back to the global config.
    pub max_bytes_per_sec: Option<u64>,
    /// Chunk-size override; `None` falls back to the global config.
    pub chunk_size: Option<usize>,
    /// Progress observer.
    pub progress: Option<ProgressCallback>,
}

/// A model entry from the router catalog (`GET /v1/models`).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteModel {
    pub id: String,
    /// Shared-filesystem source; preferred over HTTP when present.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Per-model file manifest served by the registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    /// Absolute or registry-relative URL; omitted means `<registry>/<name>`.
    #[serde(default)]
    pub url: Option<String>,
    /// Lowercase hex SHA-256 of the file contents.
    #[serde(default)]
    pub digest: Option<String>,
    /// Scheduling class: `>= 0` is the high class, `< 0` the low class.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub chunk: Option<usize>,
    #[serde(default)]
    pub max_bps: Option<u64>,
}
