//! Loaded-model cache.
//!
//! Keeps (model, context) pairs keyed by canonical path and enforces the
//! cache policies: LRU eviction under count and memory pressure, idle
//! reclamation, and at most one concurrent native load per path. The slow
//! native load runs without the map mutex so lookups stay fast; an
//! in-flight set plus condvar serializes loaders of the same path, and
//! waiters observe the loader's outcome rather than racing their own load.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{Backend, ContextParams, LoadedModel, ModelContext};
use crate::error::{Error, Result};

/// Borrowed access to a loaded model for the duration of one inference
/// call. The context mutex serializes generations per entry; parallelism
/// across distinct models is unaffected.
#[derive(Clone)]
pub struct ModelLease {
    pub model: Arc<dyn LoadedModel>,
    pub context: Arc<Mutex<Box<dyn ModelContext>>>,
}

struct LoadedEntry {
    model: Arc<dyn LoadedModel>,
    context: Arc<Mutex<Box<dyn ModelContext>>>,
    #[allow(dead_code)]
    gpu_layers: u32,
    bytes: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PathBuf, LoadedEntry>,
    last_access: HashMap<PathBuf, Instant>,
    loading: HashSet<PathBuf>,
    load_failures: HashMap<PathBuf, String>,
    loaded_bytes: u64,
    gpu_layers: u32,
    max_loaded: usize,
    max_memory_bytes: u64,
    idle_timeout: Option<Duration>,
}

/// The model cache. All public operations are linearizable under one mutex.
pub struct LlamaManager {
    models_dir: PathBuf,
    backend: Arc<dyn Backend>,
    inner: Mutex<Inner>,
    load_done: Condvar,
}

impl LlamaManager {
    pub fn new(models_dir: impl Into<PathBuf>, backend: Arc<dyn Backend>) -> Self {
        Self {
            models_dir: models_dir.into(),
            backend,
            inner: Mutex::new(Inner::default()),
            load_done: Condvar::new(),
        }
    }

    /// Canonicalize a model path: relative paths resolve against the models
    /// directory, symlinks are followed when the file exists, and the
    /// result is lexically normalized otherwise.
    pub fn canonicalize(&self, path: &Path) -> PathBuf {
        let absolute = if path.is_relative() {
            self.models_dir.join(path)
        } else {
            path.to_path_buf()
        };
        std::fs::canonicalize(&absolute).unwrap_or_else(|_| normalize_lexically(&absolute))
    }

    /// Idempotent acquire: load the model unless it is already resident.
    pub fn load_if_needed(&self, path: &Path) -> Result<()> {
        let canonical = self.canonicalize(path);

        let filename = canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_gguf = canonical.extension().is_some_and(|ext| ext == "gguf");
        if !is_gguf && !is_blob_name(&filename) {
            return Err(Error::InvalidFormat(format!(
                "expected .gguf or sha256-<digest> blob: {}",
                canonical.display()
            )));
        }
        if !canonical.exists() {
            return Err(Error::ModelNotFound(canonical.display().to_string()));
        }

        let mut inner = self.inner.lock().unwrap();
        let mut waited = false;
        loop {
            if inner.entries.contains_key(&canonical) {
                inner.last_access.insert(canonical.clone(), Instant::now());
                return Ok(());
            }
            if !inner.loading.contains(&canonical) {
                break;
            }
            waited = true;
            inner = self.load_done.wait(inner).unwrap();
        }

        // A waiter shares the outcome of the load it waited on.
        if waited {
            if let Some(message) = inner.load_failures.get(&canonical) {
                return Err(Error::LoadFailed(message.clone()));
            }
        }
        inner.load_failures.remove(&canonical);

        if inner.max_loaded > 0 && inner.entries.len() >= inner.max_loaded {
            if let Some(lru) = lru_path(&inner) {
                info!("Unloading LRU model to make room: {}", lru.display());
                evict(&mut inner, &lru);
            }
        }

        if inner.max_memory_bytes > 0 {
            let estimate = std::fs::metadata(&canonical).map(|m| m.len()).unwrap_or(0);
            while inner.loaded_bytes + estimate > inner.max_memory_bytes
                && !inner.entries.is_empty()
            {
                let Some(lru) = lru_path(&inner) else { break };
                info!(
                    "Unloading LRU model for memory pressure: {}",
                    lru.display()
                );
                evict(&mut inner, &lru);
            }
        }

        let gpu_layers = inner.gpu_layers;
        inner.loading.insert(canonical.clone());
        drop(inner);

        info!(
            "Loading model: {} (gpu_layers={})",
            canonical.display(),
            gpu_layers
        );
        let loaded = self.native_load(&canonical, gpu_layers);

        let mut inner = self.inner.lock().unwrap();
        inner.loading.remove(&canonical);
        let result = match loaded {
            Ok((model, context)) => {
                let bytes = model.size_bytes();
                info!(
                    "Model loaded successfully: {} ({} bytes)",
                    canonical.display(),
                    bytes
                );
                inner.loaded_bytes += bytes;
                inner.entries.insert(
                    canonical.clone(),
                    LoadedEntry {
                        model,
                        context,
                        gpu_layers,
                        bytes,
                    },
                );
                inner.last_access.insert(canonical, Instant::now());
                Ok(())
            }
            Err(err) => {
                warn!("Failed to load model {}: {}", canonical.display(), err);
                inner
                    .load_failures
                    .insert(canonical, err.to_string());
                Err(err)
            }
        };
        self.load_done.notify_all();
        result
    }

    fn native_load(
        &self,
        canonical: &Path,
        gpu_layers: u32,
    ) -> Result<(Arc<dyn LoadedModel>, Arc<Mutex<Box<dyn ModelContext>>>)> {
        let model = self
            .backend
            .load_model(canonical, gpu_layers)
            .map_err(|err| Error::LoadFailed(err.to_string()))?;
        // On context failure the partial model handle drops here.
        let context = model
            .new_context(&ContextParams::default())
            .map_err(|err| Error::LoadFailed(err.to_string()))?;
        Ok((model, Arc::new(Mutex::new(context))))
    }

    /// Load if needed, then lease the entry for one inference call.
    pub fn acquire(&self, path: &Path) -> Result<ModelLease> {
        self.load_if_needed(path)?;
        let canonical = self.canonicalize(path);
        let mut inner = self.inner.lock().unwrap();
        inner.last_access.insert(canonical.clone(), Instant::now());
        let entry = inner
            .entries
            .get(&canonical)
            .ok_or_else(|| Error::LoadFailed(canonical.display().to_string()))?;
        Ok(ModelLease {
            model: entry.model.clone(),
            context: entry.context.clone(),
        })
    }

    pub fn is_loaded(&self, path: &Path) -> bool {
        let canonical = self.canonicalize(path);
        self.inner.lock().unwrap().entries.contains_key(&canonical)
    }

    pub fn model_of(&self, path: &Path) -> Option<Arc<dyn LoadedModel>> {
        let canonical = self.canonicalize(path);
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&canonical).map(|e| e.model.clone())
    }

    pub fn context_of(&self, path: &Path) -> Option<Arc<Mutex<Box<dyn ModelContext>>>> {
        let canonical = self.canonicalize(path);
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&canonical).map(|e| e.context.clone())
    }

    /// Unload a model, releasing its native resources.
    pub fn unload(&self, path: &Path) -> bool {
        let canonical = self.canonicalize(path);
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(&canonical) {
            return false;
        }
        info!("Unloading model: {}", canonical.display());
        evict(&mut inner, &canonical);
        true
    }

    pub fn loaded_models(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().entries.keys().cloned().collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn memory_bytes(&self) -> u64 {
        self.inner.lock().unwrap().loaded_bytes
    }

    pub fn set_gpu_layers(&self, layers: u32) {
        self.inner.lock().unwrap().gpu_layers = layers;
    }

    pub fn gpu_layers(&self) -> u32 {
        self.inner.lock().unwrap().gpu_layers
    }

    pub fn set_max_loaded(&self, max: usize) {
        self.inner.lock().unwrap().max_loaded = max;
    }

    pub fn set_max_memory_bytes(&self, max: u64) {
        self.inner.lock().unwrap().max_memory_bytes = max;
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().unwrap().idle_timeout = timeout;
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().idle_timeout
    }

    /// Unload entries idle for at least the configured timeout. Returns how
    /// many were unloaded. Entries mid-load are untouched by construction:
    /// they are not in the map yet.
    pub fn unload_idle(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Some(timeout) = inner.idle_timeout else {
            return 0;
        };
        let now = Instant::now();
        let stale: Vec<PathBuf> = inner
            .entries
            .keys()
            .filter(|path| {
                inner
                    .last_access
                    .get(*path)
                    .is_some_and(|at| now.duration_since(*at) >= timeout)
            })
            .cloned()
            .collect();
        for path in &stale {
            info!("Unloading idle model: {}", path.display());
            evict(&mut inner, path);
        }
        stale.len()
    }

    pub fn last_access(&self, path: &Path) -> Option<Instant> {
        let canonical = self.canonicalize(path);
        let inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(&canonical) {
            return None;
        }
        inner.last_access.get(&canonical).copied()
    }

    /// Oldest entry by last access; entries with no recorded access count
    /// as oldest.
    pub fn lru(&self) -> Option<PathBuf> {
        lru_path(&self.inner.lock().unwrap())
    }
}

fn evict(inner: &mut Inner, path: &Path) {
    if let Some(entry) = inner.entries.remove(path) {
        inner.loaded_bytes = inner.loaded_bytes.saturating_sub(entry.bytes);
    }
    inner.last_access.remove(path);
}

fn lru_path(inner: &Inner) -> Option<PathBuf> {
    if inner.entries.is_empty() {
        return None;
    }
    let mut oldest: Option<(PathBuf, Instant)> = None;
    for path in inner.entries.keys() {
        match inner.last_access.get(path) {
            Some(at) => {
                if oldest.as_ref().map_or(true, |(_, best)| at < best) {
                    oldest = Some((path.clone(), *at));
                }
            }
            // No recorded access counts as oldest.
            None => return Some(path.clone()),
        }
    }
    oldest.map(|(path, _)| path)
}

/// Legacy content-addressed blob names: `sha256-<64 hex>`.
fn is_blob_name(filename: &str) -> bool {
    let Some(digest) = filename.strip_prefix("sha256-") else {
        return false;
    };
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
