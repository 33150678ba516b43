//! Shared application state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};

use kraal_core::storage::layout;
use kraal_core::{
    BlobDownloader, LlamaManager, ModelStorage, ModelSync, NodeConfig, RemoteModel,
    RequestCoordinator,
};

use crate::logging::LogLevel;
use crate::metrics::NodeMetrics;
use crate::router_client::RouterClient;

/// Shared state behind every handler. Arc-heavy so clones stay cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub storage: Arc<ModelStorage>,
    pub manager: Arc<LlamaManager>,
    pub sync: Arc<ModelSync>,
    pub downloader: Arc<BlobDownloader>,
    pub coordinator: Arc<RequestCoordinator>,
    pub router: Arc<RouterClient>,
    pub metrics: Arc<NodeMetrics>,
    pub log_level: Arc<LogLevel>,
    /// Models the router says this node serves; set after each sync.
    pub registry: Arc<RwLock<Vec<RemoteModel>>>,
    pub request_semaphore: Arc<Semaphore>,
    pub active_requests: Arc<AtomicU32>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        storage: Arc<ModelStorage>,
        manager: Arc<LlamaManager>,
        sync: Arc<ModelSync>,
        downloader: Arc<BlobDownloader>,
        coordinator: Arc<RequestCoordinator>,
        router: Arc<RouterClient>,
        metrics: Arc<NodeMetrics>,
        log_level: Arc<LogLevel>,
    ) -> Self {
        let max_concurrent = std::env::var("MAX_CONCURRENT_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        Self {
            config,
            storage,
            manager,
            sync,
            downloader,
            coordinator,
            router,
            metrics,
            log_level,
            registry: Arc::new(RwLock::new(Vec::new())),
            request_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active_requests: Arc::new(AtomicU32::new(0)),
        }
    }

    pub async fn acquire_permit(&self) -> SemaphorePermit<'_> {
        self.request_semaphore
            .acquire()
            .await
            .expect("request semaphore closed")
    }

    /// Track one in-flight request for the heartbeat gauge.
    pub fn begin_request(&self) -> ActiveRequestGuard {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        ActiveRequestGuard {
            counter: self.active_requests.clone(),
        }
    }

    pub async fn set_registry(&self, models: Vec<RemoteModel>) {
        *self.registry.write().await = models;
    }

    pub async fn has_model(&self, model_id: &str) -> bool {
        self.registry
            .read()
            .await
            .iter()
            .any(|m| m.id == model_id)
    }

    pub async fn model_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    /// Names of currently loaded models, derived from their directories.
    pub fn loaded_model_names(&self) -> Vec<String> {
        self.manager
            .loaded_models()
            .into_iter()
            .filter_map(|path| {
                let dir = path.parent()?.file_name()?.to_string_lossy().to_string();
                Some(layout::dir_name_to_model(&dir))
            })
            .collect()
    }
}

/// Decrements the active-request counter on drop.
pub struct ActiveRequestGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
