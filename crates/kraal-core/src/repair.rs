//! Auto-repair of corrupt model files.
//!
//! A model whose blob is missing, implausibly small, or lacking the GGUF
//! magic gets re-downloaded through the sync engine. Concurrent repairs of
//! the same model deduplicate: exactly one caller performs the download,
//! the rest wait on its completion and share its result. A waiter that
//! times out gives up, but the in-flight repair keeps running and stays
//! visible through `is_repairing`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};

use crate::download::{BlobDownloader, ModelSync, ProgressCallback};

/// Minimum plausible size for a GGUF file.
const MIN_MODEL_BYTES: u64 = 1024;

/// State of a repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Idle,
    InProgress,
    Success,
    Failed,
}

/// Outcome of a repair call.
#[derive(Debug, Clone)]
pub struct RepairResult {
    pub status: RepairStatus,
    pub model: String,
    pub error: Option<String>,
    pub elapsed: Duration,
}

struct RepairTask {
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
    result: Mutex<Option<RepairResult>>,
    completed: watch::Sender<bool>,
}

impl RepairTask {
    fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }
}

/// Whether a model file needs repair: missing, under 1 KiB, or not GGUF.
pub fn needs_repair(model_path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(model_path) else {
        return true;
    };
    if !meta.is_file() || meta.len() < MIN_MODEL_BYTES {
        return true;
    }
    !has_gguf_magic(model_path)
}

fn has_gguf_magic(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => &magic == b"GGUF",
        Err(_) => false,
    }
}

/// Deduplicating repair coordinator.
pub struct RepairCoordinator {
    sync: Arc<ModelSync>,
    downloader: Arc<BlobDownloader>,
    tasks: Mutex<HashMap<String, Arc<RepairTask>>>,
    default_timeout: Mutex<Duration>,
}

impl RepairCoordinator {
    pub fn new(sync: Arc<ModelSync>, downloader: Arc<BlobDownloader>) -> Self {
        Self {
            sync,
            downloader,
            tasks: Mutex::new(HashMap::new()),
            default_timeout: Mutex::new(Duration::from_secs(300)),
        }
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.default_timeout.lock().unwrap() = timeout;
    }

    pub fn default_timeout(&self) -> Duration {
        *self.default_timeout.lock().unwrap()
    }

    /// Repair a model by re-downloading it, or wait for a repair already in
    /// flight. Elapsed time covers the whole call, waiting included.
    pub async fn repair(
        &self,
        model_name: &str,
        timeout: Duration,
        progress: Option<ProgressCallback>,
    ) -> RepairResult {
        let started = Instant::now();
        info!("Starting auto-repair for model: {}", model_name);

        enum Role {
            Owner(Arc<RepairTask>),
            Waiter(Arc<RepairTask>, watch::Receiver<bool>),
        }

        let role = {
            let mut tasks = self.tasks.lock().unwrap();
            let existing = tasks
                .get(model_name)
                .filter(|task| !task.is_completed())
                .cloned();
            match existing {
                Some(task) => {
                    let rx = task.completed.subscribe();
                    Role::Waiter(task, rx)
                }
                None => {
                    let (completed, _) = watch::channel(false);
                    let task = Arc::new(RepairTask {
                        started_at: Utc::now(),
                        result: Mutex::new(None),
                        completed,
                    });
                    tasks.insert(model_name.to_string(), task.clone());
                    Role::Owner(task)
                }
            }
        };

        match role {
            Role::Waiter(task, mut rx) => {
                info!("Model {} is already being repaired, waiting...", model_name);
                let wait = async {
                    while !*rx.borrow_and_update() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(timeout, wait).await.is_err() {
                    return RepairResult {
                        status: RepairStatus::Failed,
                        model: model_name.to_string(),
                        error: Some(
                            "Repair timeout while waiting for existing repair".to_string(),
                        ),
                        elapsed: started.elapsed(),
                    };
                }
                let result = task.result.lock().unwrap().clone();
                result.unwrap_or(RepairResult {
                    status: RepairStatus::Failed,
                    model: model_name.to_string(),
                    error: Some("Repair task vanished".to_string()),
                    elapsed: started.elapsed(),
                })
            }
            Role::Owner(task) => {
                let outcome = self
                    .sync
                    .download_model(&self.downloader, model_name, progress)
                    .await;

                let result = match outcome {
                    Ok(()) => {
                        info!(
                            "Auto-repair completed: {} (elapsed: {}ms)",
                            model_name,
                            started.elapsed().as_millis()
                        );
                        RepairResult {
                            status: RepairStatus::Success,
                            model: model_name.to_string(),
                            error: None,
                            elapsed: started.elapsed(),
                        }
                    }
                    Err(err) => {
                        error!("Auto-repair failed: {} - {}", model_name, err);
                        RepairResult {
                            status: RepairStatus::Failed,
                            model: model_name.to_string(),
                            error: Some(format!("Failed to download model: {}", err)),
                            elapsed: started.elapsed(),
                        }
                    }
                };

                *task.result.lock().unwrap() = Some(result.clone());
                let _ = task.completed.send(true);
                result
            }
        }
    }

    /// Whether a repair for this model is currently in flight.
    pub fn is_repairing(&self, model_name: &str) -> bool {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .get(model_name)
            .is_some_and(|task| !task.is_completed())
    }

    /// Wait for an in-flight repair to finish. Returns `true` when no repair
    /// is pending or it completed within the timeout.
    pub async fn wait_for_repair(&self, model_name: &str, timeout: Duration) -> bool {
        let rx = {
            let tasks = self.tasks.lock().unwrap();
            match tasks.get(model_name) {
                Some(task) if !task.is_completed() => Some(task.completed.subscribe()),
                _ => None,
            }
        };
        let Some(mut rx) = rx else {
            return true;
        };
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
