//! Catalog synchronization against the router.
//!
//! `sync()` diffs the router catalog against the local model directories,
//! eagerly satisfies missing models (shared-path copy, direct blob, or
//! manifest fan-out) and persists the ETag/size cache atomically so a
//! restarted node can short-circuit unchanged downloads without touching
//! the router.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::download::blob::BlobDownloader;
use crate::download::lock::FileLock;
use crate::download::{DownloadOptions, ManifestFile, ProgressCallback, RemoteModel};
use crate::error::{Error, Result};
use crate::storage::layout;

const ETAG_CACHE_FILE: &str = ".etag_cache.json";
const ETAG_LOCK_DIR: &str = ".etag_cache.lock";

/// Sync lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Running,
    Success,
    Failed,
}

/// Last observed sync status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub updated_at: DateTime<Utc>,
    pub last_to_download: Vec<String>,
    pub last_to_delete: Vec<String>,
}

/// Result of one sync pass: models we still need, and local models the
/// router no longer lists. Deletion is reported, never performed here.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub to_download: Vec<String>,
    pub to_delete: Vec<String>,
}

/// Per-model download overrides (weaker than per-file manifest settings).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelOverrides {
    pub chunk_size: Option<usize>,
    pub max_bps: Option<u64>,
}

#[derive(Default)]
struct Caches {
    etag: HashMap<String, String>,
    size: HashMap<String, u64>,
}

/// Synchronizes the local model set with the router catalog.
pub struct ModelSync {
    router_url: String,
    models_dir: PathBuf,
    client: reqwest::Client,
    config: DownloadConfig,
    status: Mutex<SyncStatus>,
    caches: Mutex<Caches>,
    overrides: Mutex<HashMap<String, ModelOverrides>>,
    remote: Mutex<HashMap<String, RemoteModel>>,
}

#[derive(Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    data: Vec<RemoteModel>,
}

impl ModelSync {
    pub fn new(
        router_url: impl Into<String>,
        models_dir: impl Into<PathBuf>,
        config: DownloadConfig,
    ) -> Self {
        let models_dir = models_dir.into();
        let sync = Self {
            router_url: router_url.into(),
            models_dir,
            client: reqwest::Client::new(),
            config,
            status: Mutex::new(SyncStatus {
                state: SyncState::Idle,
                updated_at: Utc::now(),
                last_to_download: Vec::new(),
                last_to_delete: Vec::new(),
            }),
            caches: Mutex::new(Caches::default()),
            overrides: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
        };
        sync.load_etag_cache();
        sync
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().unwrap().clone()
    }

    fn set_state(&self, state: SyncState) {
        let mut status = self.status.lock().unwrap();
        status.state = state;
        status.updated_at = Utc::now();
    }

    /// Fetch the router catalog. Entries carrying `etag` or `size` update
    /// the in-memory caches as a side effect.
    pub async fn fetch_remote(&self) -> Result<Vec<RemoteModel>> {
        let url = format!("{}/v1/models", self.router_url.trim_end_matches('/'));
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::DownloadFailed(format!(
                "catalog fetch HTTP {}",
                resp.status()
            )));
        }
        let body: CatalogResponse = resp.json().await?;

        {
            let mut caches = self.caches.lock().unwrap();
            for model in &body.data {
                if let Some(etag) = &model.etag {
                    caches.etag.insert(model.id.clone(), etag.clone());
                }
                if let Some(size) = model.size {
                    caches.size.insert(model.id.clone(), size);
                }
            }
        }
        {
            let mut remote = self.remote.lock().unwrap();
            for model in &body.data {
                remote.insert(model.id.clone(), model.clone());
            }
        }

        Ok(body.data)
    }

    /// Snapshot of the last fetched catalog.
    pub fn remote_models(&self) -> Vec<RemoteModel> {
        self.remote.lock().unwrap().values().cloned().collect()
    }

    /// Model names present on disk (directories containing anything).
    pub fn list_local(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.models_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                let dir_name = entry.file_name().to_string_lossy().to_string();
                // Dot-directories are bookkeeping (lock dirs), not models.
                if dir_name.starts_with('.') {
                    continue;
                }
                out.push(layout::dir_name_to_model(&dir_name));
            }
        }
        out
    }

    /// One full sync pass. Transitions Idle → Running → Success/Failed.
    pub async fn sync(&self, downloader: &BlobDownloader) -> Result<SyncOutcome> {
        self.set_state(SyncState::Running);

        let remote = match self.fetch_remote().await {
            Ok(remote) => remote,
            Err(err) => {
                self.set_state(SyncState::Failed);
                return Err(err);
            }
        };

        self.persist_etag_cache();

        let local: HashSet<String> = self.list_local().into_iter().collect();
        let remote_ids: HashSet<String> = remote.iter().map(|m| m.id.clone()).collect();

        let mut outcome = SyncOutcome::default();

        for model in &remote {
            if local.contains(&model.id) {
                continue;
            }
            match self.acquire_model(downloader, model, None).await {
                Ok(()) => info!("Synced model {}", model.id),
                Err(err) => {
                    warn!("Failed to sync model {}: {}", model.id, err);
                    outcome.to_download.push(model.id.clone());
                }
            }
        }

        for name in &local {
            if !remote_ids.contains(name) {
                outcome.to_delete.push(name.clone());
            }
        }
        outcome.to_delete.sort();

        {
            let mut status = self.status.lock().unwrap();
            status.state = SyncState::Success;
            status.updated_at = Utc::now();
            status.last_to_download = outcome.to_download.clone();
            status.last_to_delete = outcome.to_delete.clone();
        }

        Ok(outcome)
    }

    /// Serve a router pull request: bring one model local and record its
    /// chat template, reporting byte progress through `progress`.
    pub async fn pull(
        &self,
        downloader: &BlobDownloader,
        model: &RemoteModel,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        self.acquire_model(downloader, model, progress).await
    }

    /// Bring one catalog entry local: shared-path copy when offered, then a
    /// direct blob URL, then the registry manifest.
    async fn acquire_model(
        &self,
        downloader: &BlobDownloader,
        model: &RemoteModel,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let dir_name = layout::model_name_to_dir(&model.id);
        let mut acquired = false;

        if let Some(src) = model.path.as_deref().filter(|p| !p.is_empty()) {
            let src = Path::new(src);
            if src.is_file() {
                let dest_dir = self.models_dir.join(&dir_name);
                std::fs::create_dir_all(&dest_dir)?;
                let dest = dest_dir.join("model.gguf");
                match std::fs::copy(src, &dest) {
                    Ok(_) => acquired = true,
                    Err(err) => {
                        // A racing copy may have produced the file already.
                        if dest.exists() {
                            acquired = true;
                        } else {
                            warn!("Shared-path copy failed for {}: {}", model.id, err);
                        }
                    }
                }
            }
        }

        if !acquired {
            if let Some(url) = model.download_url.as_deref().filter(|u| !u.is_empty()) {
                let filename = format!("{}/model.gguf", dir_name);
                let opts = DownloadOptions {
                    progress: progress.clone(),
                    ..Default::default()
                };
                self.download_with_hint(downloader, &model.id, url, &filename, opts)
                    .await?;
                acquired = true;
            }
        }

        if !acquired {
            self.download_model(downloader, &model.id, progress).await?;
        }

        if let Some(template) = model.chat_template.as_deref().filter(|t| !t.is_empty()) {
            let meta_path = self.models_dir.join(&dir_name).join("metadata.json");
            let meta = serde_json::json!({ "chat_template": template });
            std::fs::write(meta_path, serde_json::to_vec(&meta)?)?;
        }

        Ok(())
    }

    /// Download every file in a model's manifest, scheduled in two priority
    /// classes: high (`priority >= 0`) runs first at full concurrency in
    /// descending priority; low (`priority < 0`) runs only afterwards, with
    /// concurrency and bandwidth derated by how negative it is.
    pub async fn download_model(
        &self,
        downloader: &BlobDownloader,
        model_id: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let manifest = downloader.fetch_manifest(model_id).await?;
        if manifest.files.is_empty() {
            return Err(Error::DownloadFailed(format!(
                "manifest for {} lists no files",
                model_id
            )));
        }

        let model_cfg = self
            .overrides
            .lock()
            .unwrap()
            .get(model_id)
            .copied()
            .unwrap_or_default();

        let dir_name = layout::model_name_to_dir(model_id);
        let mut high: Vec<(i32, ManifestFile)> = Vec::new();
        let mut low: Vec<(i32, ManifestFile)> = Vec::new();

        for file in manifest.files {
            if file.name.is_empty() {
                return Err(Error::DownloadFailed(format!(
                    "manifest for {} has a file without a name",
                    model_id
                )));
            }
            if file.priority >= 0 {
                high.push((file.priority, file));
            } else {
                low.push((file.priority, file));
            }
        }

        let base_conc = self.config.max_concurrency.max(1);

        if !high.is_empty() {
            high.sort_by(|a, b| b.0.cmp(&a.0));
            let conc = base_conc.min(high.len());
            self.run_class(downloader, model_id, &dir_name, high, &model_cfg, conc, &progress)
                .await?;
        }

        if !low.is_empty() {
            low.sort_by(|a, b| b.0.cmp(&a.0));
            let most_negative = low.iter().map(|(p, _)| *p).min().unwrap_or(0);
            let divisor = 1 + most_negative.unsigned_abs() as usize;
            let conc = (base_conc / divisor).max(1).min(low.len());
            self.run_class(downloader, model_id, &dir_name, low, &model_cfg, conc, &progress)
                .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_class(
        &self,
        downloader: &BlobDownloader,
        model_id: &str,
        dir_name: &str,
        files: Vec<(i32, ManifestFile)>,
        model_cfg: &ModelOverrides,
        concurrency: usize,
        progress: &Option<ProgressCallback>,
    ) -> Result<()> {
        let tasks = files.into_iter().map(|(priority, file)| {
            let url = file
                .url
                .clone()
                .unwrap_or_else(|| file.name.clone());
            let filename = format!("{}/{}", dir_name, file.name);

            // Per-file settings beat per-model overrides beat global config;
            // negative priority additionally derates the bandwidth cap.
            let chunk_size = file.chunk.or(model_cfg.chunk_size);
            let mut max_bps = file.max_bps.or(model_cfg.max_bps);
            if priority < 0 {
                let factor = 1 + priority.unsigned_abs() as u64;
                let base = max_bps.unwrap_or(self.config.max_bytes_per_sec);
                if base > 0 {
                    max_bps = Some((base / factor).max(1));
                }
            }

            let opts_progress = progress.clone();
            async move {
                debug!(
                    "download task model={} file={} priority={}",
                    model_id, file.name, priority
                );
                self.download_with_hint(
                    downloader,
                    model_id,
                    &url,
                    &filename,
                    DownloadOptions {
                        expected_sha256: file.digest.clone(),
                        if_none_match: None,
                        max_bytes_per_sec: max_bps,
                        chunk_size,
                        progress: opts_progress,
                    },
                )
                .await
                .map(|_| ())
            }
        });

        // First failure drops the stream, cancelling the rest of the class.
        let mut stream = futures::stream::iter(tasks).buffer_unordered(concurrency);
        while let Some(result) = stream.next().await {
            result?;
        }
        Ok(())
    }

    /// Download one blob, consulting the persisted ETag/size hints first:
    /// a local file whose size matches the cached size is taken as current
    /// without any HTTP; otherwise the cached ETag rides along as
    /// `If-None-Match`, but only when a local file exists.
    pub async fn download_with_hint(
        &self,
        downloader: &BlobDownloader,
        model_id: &str,
        blob_url: &str,
        filename: &str,
        mut opts: DownloadOptions,
    ) -> Result<PathBuf> {
        let full_path = downloader.models_dir().join(filename);
        let exists = full_path.exists();

        if let Some(cached_size) = self.cached_size(model_id) {
            if exists {
                if let Ok(meta) = std::fs::metadata(&full_path) {
                    if meta.len() == cached_size {
                        debug!(
                            "Skipping {}: size matches cached {} bytes",
                            filename, cached_size
                        );
                        return Ok(full_path);
                    }
                }
            }
        }

        opts.if_none_match = if exists {
            self.cached_etag(model_id)
        } else {
            None
        };

        downloader.download_blob(blob_url, filename, &opts).await
    }

    pub fn cached_etag(&self, model_id: &str) -> Option<String> {
        self.caches.lock().unwrap().etag.get(model_id).cloned()
    }

    pub fn set_cached_etag(&self, model_id: &str, etag: impl Into<String>) {
        self.caches
            .lock()
            .unwrap()
            .etag
            .insert(model_id.to_string(), etag.into());
    }

    pub fn cached_size(&self, model_id: &str) -> Option<u64> {
        self.caches.lock().unwrap().size.get(model_id).copied()
    }

    pub fn set_cached_size(&self, model_id: &str, size: u64) {
        self.caches
            .lock()
            .unwrap()
            .size
            .insert(model_id.to_string(), size);
    }

    pub fn set_model_overrides(&self, overrides: HashMap<String, ModelOverrides>) {
        *self.overrides.lock().unwrap() = overrides;
    }

    /// Load the persisted ETag cache, discarding anything unreadable.
    fn load_etag_cache(&self) {
        let cache_path = self.models_dir.join(ETAG_CACHE_FILE);
        if !cache_path.exists() {
            return;
        }

        let _lock = FileLock::acquire(&cache_path);
        let Ok(text) = std::fs::read_to_string(&cache_path) else {
            return;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            warn!("Discarding unreadable ETag cache at {}", cache_path.display());
            return;
        };
        let Some(object) = value.as_object() else {
            return;
        };

        let mut caches = self.caches.lock().unwrap();
        for (name, entry) in object {
            match entry {
                serde_json::Value::Object(fields) => {
                    if let Some(etag) = fields.get("etag").and_then(|v| v.as_str()) {
                        caches.etag.insert(name.clone(), etag.to_string());
                    }
                    if let Some(size) = fields.get("size").and_then(|v| v.as_u64()) {
                        caches.size.insert(name.clone(), size);
                    }
                }
                // Older nodes wrote a bare ETag string per model.
                serde_json::Value::String(etag) => {
                    caches.etag.insert(name.clone(), etag.clone());
                }
                _ => {}
            }
        }
    }

    /// Persist the ETag cache as `{temp file; fsync; rename}` under a file
    /// lock, falling back to a `mkdir` lock when file locking fails.
    fn persist_etag_cache(&self) {
        let cache_path = self.models_dir.join(ETAG_CACHE_FILE);
        let temp_path = self.models_dir.join(format!("{}.tmp", ETAG_CACHE_FILE));

        if std::fs::create_dir_all(&self.models_dir).is_err() {
            return;
        }

        let payload = {
            let caches = self.caches.lock().unwrap();
            let mut map = BTreeMap::new();
            for (name, etag) in &caches.etag {
                let mut entry = serde_json::Map::new();
                entry.insert("etag".to_string(), serde_json::Value::String(etag.clone()));
                if let Some(size) = caches.size.get(name) {
                    entry.insert("size".to_string(), serde_json::Value::from(*size));
                }
                map.insert(name.clone(), serde_json::Value::Object(entry));
            }
            match serde_json::to_vec(&map) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        };

        let write_and_rename = |payload: &[u8]| -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(payload)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &cache_path)
        };

        let lock = FileLock::acquire(&cache_path);
        if lock.locked() {
            if let Err(err) = write_and_rename(&payload) {
                warn!("Failed to persist ETag cache: {}", err);
            }
            return;
        }
        drop(lock);

        let lock_dir = self.models_dir.join(ETAG_LOCK_DIR);
        if std::fs::create_dir(&lock_dir).is_ok() {
            if let Err(err) = write_and_rename(&payload) {
                warn!("Failed to persist ETag cache: {}", err);
            }
            let _ = std::fs::remove_dir(&lock_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;

    #[test]
    fn etag_cache_round_trips_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let sync = ModelSync::new("http://router", tmp.path(), DownloadConfig::default());
        sync.set_cached_etag("gpt-oss:7b", "\"etag-1\"");
        sync.set_cached_size("gpt-oss:7b", 3);
        sync.persist_etag_cache();

        let reloaded = ModelSync::new("http://router", tmp.path(), DownloadConfig::default());
        assert_eq!(reloaded.cached_etag("gpt-oss:7b").as_deref(), Some("\"etag-1\""));
        assert_eq!(reloaded.cached_size("gpt-oss:7b"), Some(3));
    }

    #[test]
    fn etag_cache_accepts_legacy_string_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(ETAG_CACHE_FILE),
            r#"{"old:model":"\"legacy\""}"#,
        )
        .unwrap();

        let sync = ModelSync::new("http://router", tmp.path(), DownloadConfig::default());
        assert_eq!(sync.cached_etag("old:model").as_deref(), Some("\"legacy\""));
        assert_eq!(sync.cached_size("old:model"), None);
    }

    #[test]
    fn corrupt_etag_cache_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(ETAG_CACHE_FILE), b"{truncated").unwrap();

        let sync = ModelSync::new("http://router", tmp.path(), DownloadConfig::default());
        assert_eq!(sync.cached_etag("anything"), None);
    }

    #[test]
    fn local_listing_maps_dir_names_back() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("gpt-oss_7b")).unwrap();
        std::fs::create_dir_all(tmp.path().join("llama3_latest")).unwrap();

        let sync = ModelSync::new("http://router", tmp.path(), DownloadConfig::default());
        let mut local = sync.list_local();
        local.sort();
        assert_eq!(local, vec!["gpt-oss:7b", "llama3:latest"]);
    }
}
