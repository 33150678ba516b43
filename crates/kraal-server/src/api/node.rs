//! Node-control endpoints: health, readiness, metrics, pulls, log level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use tracing::{info, warn};

use kraal_core::{ProgressCallback, RemoteModel};

use crate::runtime;
use crate::state::AppState;

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// `GET /startup` - 200 once initialization finished, 503 before.
pub async fn startup() -> impl IntoResponse {
    if runtime::is_ready() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "starting"})),
        )
    }
}

/// `GET /metrics` - JSON counters.
pub async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "uptime_seconds": state.metrics.uptime_secs(),
        "pull_count": state.metrics.pull_total.get(),
    }))
}

/// `GET /metrics/prom` - Prometheus text exposition.
pub async fn metrics_prom(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub model: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub chat_template: Option<String>,
}

/// `POST /pull` - accept a router-dispatched download and run it in the
/// background, reporting progress against the task.
pub async fn pull(
    State(state): State<AppState>,
    Json(req): Json<PullRequest>,
) -> impl IntoResponse {
    state.metrics.pull_total.inc();

    if req.model.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "model_required", "message": "model is required"})),
        );
    }

    let remote = RemoteModel {
        id: req.model.clone(),
        path: req.path,
        download_url: req.download_url,
        chat_template: req.chat_template,
        etag: None,
        size: None,
    };

    let progress = req
        .task_id
        .clone()
        .map(|task_id| progress_reporter(&state, task_id));

    let task_state = state.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        match task_state
            .sync
            .pull(&task_state.downloader, &remote, progress)
            .await
        {
            Ok(()) => {
                info!(
                    "Pull of {} finished in {:?}",
                    remote.id,
                    started.elapsed()
                );
                if let Some(task_id) = &req.task_id {
                    task_state.router.report_progress(task_id, 1.0, None).await;
                }
                // The registry gains the model so it can be served at once.
                let mut registry = task_state.registry.write().await;
                if !registry.iter().any(|m| m.id == remote.id) {
                    registry.push(remote);
                }
            }
            Err(err) => warn!("Pull of {} failed: {}", remote.id, err),
        }
    });

    (StatusCode::OK, Json(serde_json::json!({"status": "accepted"})))
}

/// Progress callback posting to the router in 5% steps.
fn progress_reporter(state: &AppState, task_id: String) -> ProgressCallback {
    let router = state.router.clone();
    let last_step = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    Arc::new(move |downloaded, total| {
        if total == 0 {
            return;
        }
        let step = downloaded * 20 / total; // 5% granularity
        let previous = last_step.swap(step, Ordering::SeqCst);
        if step <= previous {
            return;
        }
        let progress = downloaded as f64 / total as f64;
        let speed = match started.elapsed().as_secs_f64() {
            secs if secs > 0.0 => Some(downloaded as f64 / secs),
            _ => None,
        };
        let router = router.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            router.report_progress(&task_id, progress, speed).await;
        });
    })
}

/// `GET /log/level`
pub async fn get_log_level(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"level": state.log_level.get()}))
}

#[derive(Debug, Deserialize)]
pub struct LogLevelRequest {
    pub level: String,
}

/// `POST /log/level`
pub async fn set_log_level(
    State(state): State<AppState>,
    body: Option<Json<LogLevelRequest>>,
) -> impl IntoResponse {
    let Some(Json(req)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "level required"})),
        );
    };
    match state.log_level.set(&req.level) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"level": state.log_level.get()})),
        ),
        Err(message) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": message})),
        ),
    }
}
