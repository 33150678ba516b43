//! kraal-node - GGUF inference worker for an llm-router fleet.

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod error;
mod gpu;
mod logging;
mod metrics;
mod router_client;
mod runtime;
mod state;
mod sysstat;

use kraal_core::backend::stub::StubBackend;
use kraal_core::{
    Backend, BlobDownloader, InferencePipeline, LlamaManager, ModelStorage, ModelSync, NodeConfig,
    RepairCoordinator, RequestCoordinator, SyncOutcome,
};

use gpu::GpuInventory;
use logging::LogLevel;
use metrics::NodeMetrics;
use router_client::{HeartbeatPayload, NodeIdentity, NodeInfo, RouterClient};
use state::AppState;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = logging::init();
    info!("kraal-node v{} starting...", env!("CARGO_PKG_VERSION"));

    match run(log_level).await {
        Ok(()) => {
            info!("Node shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Fatal error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(log_level: Arc<LogLevel>) -> anyhow::Result<()> {
    runtime::set_ready(false);

    let config = Arc::new(NodeConfig::load());
    info!("Router URL: {}", config.router_url);
    info!("Models directory: {}", config.models_dir.display());
    std::fs::create_dir_all(&config.models_dir)?;

    let gpu = GpuInventory::detect();
    if config.require_gpu && !gpu.available() {
        anyhow::bail!(
            "No GPU detected. GPU is required for node operation \
             (set LLM_NODE_ALLOW_NO_GPU=1 to override)"
        );
    }
    info!(
        "GPU inventory: {} devices, {} bytes total memory",
        gpu.device_count(),
        gpu.total_memory()
    );

    // The backend handle is created once here and owned by the cache. The
    // stub backend serves until a native llama backend is linked in.
    let backend: Arc<dyn Backend> = Arc::new(StubBackend::new());
    info!("Inference backend: {}", backend.name());

    let storage = Arc::new(ModelStorage::new(&config.models_dir));
    let manager = Arc::new(LlamaManager::new(&config.models_dir, backend));

    if config.cache.gpu_layers > 0 {
        manager.set_gpu_layers(config.cache.gpu_layers);
    } else if gpu.available() {
        // Offload everything; models have fewer layers than this.
        manager.set_gpu_layers(99);
        info!("GPU offloading enabled with 99 layers");
    }
    if config.cache.idle_timeout_secs > 0 {
        manager.set_idle_timeout(Some(Duration::from_secs(config.cache.idle_timeout_secs)));
        info!(
            "Model idle timeout set to {} seconds",
            config.cache.idle_timeout_secs
        );
    }
    if config.cache.max_loaded > 0 {
        manager.set_max_loaded(config.cache.max_loaded);
        info!("Max loaded models set to {}", config.cache.max_loaded);
    }
    if config.cache.max_memory_bytes > 0 {
        manager.set_max_memory_bytes(config.cache.max_memory_bytes);
        info!(
            "Max memory limit set to {} bytes",
            config.cache.max_memory_bytes
        );
    }

    let sync = Arc::new(ModelSync::new(
        &config.router_url,
        &config.models_dir,
        config.download.clone(),
    ));
    let downloader = Arc::new(BlobDownloader::new(
        &config.router_url,
        &config.models_dir,
        config.download.clone(),
    )?);

    let pipeline = Arc::new(InferencePipeline::new(storage.clone(), manager.clone()));
    let mut coordinator = RequestCoordinator::new(storage.clone(), pipeline);
    if config.auto_repair {
        info!("Auto-repair enabled");
        let repair = Arc::new(RepairCoordinator::new(sync.clone(), downloader.clone()));
        let timeout = Duration::from_secs(config.repair_timeout_secs);
        repair.set_default_timeout(timeout);
        coordinator = coordinator.with_repair(repair, timeout);
    }
    let coordinator = Arc::new(coordinator);

    let router = Arc::new(RouterClient::new(&config.router_url));
    let metrics = Arc::new(NodeMetrics::new());
    metrics.gpu_devices.set(i64::from(gpu.device_count()));
    metrics.gpu_memory_bytes.set(gpu.total_memory() as i64);
    metrics.gpu_capability.set(gpu.capability);

    let state = AppState::new(
        config.clone(),
        storage,
        manager.clone(),
        sync.clone(),
        downloader.clone(),
        coordinator,
        router.clone(),
        metrics,
        log_level,
    );

    // The HTTP server comes up before registration: the router probes
    // /v1/models as part of admitting the node.
    let app = api::create_router(state.clone());
    let addr = format!("{}:{}", config.bind_address, config.node_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // Register with the router, retrying a few times with a short backoff.
    let node_info = NodeInfo {
        machine_name: sysstat::hostname(),
        ip_address: node_ip(&config),
        runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_port: config.node_port,
        gpu_available: gpu.available(),
        gpu_devices: gpu.devices.clone(),
        gpu_count: gpu.available().then(|| gpu.device_count()),
        gpu_model: gpu.primary_model(),
    };

    let mut identity: Option<NodeIdentity> = None;
    for attempt in 0..3u64 {
        match router.register(&node_info).await {
            Ok(id) => {
                identity = Some(id);
                break;
            }
            Err(err) => {
                warn!("Registration attempt {} failed: {}", attempt + 1, err);
                tokio::time::sleep(Duration::from_millis(200 * (attempt + 1))).await;
            }
        }
    }
    let Some(identity) = identity else {
        runtime::request_shutdown();
        anyhow::bail!("Router registration failed after retries");
    };
    info!("Registered with router as node {}", identity.node_id);

    // Initial model sync. When nothing came down and nothing is local,
    // retry once: the router may still be warming up.
    info!("Syncing models from router...");
    let mut outcome = run_sync(&state).await;
    if outcome.to_download.is_empty() && outcome.to_delete.is_empty() && sync.list_local().is_empty()
    {
        tokio::time::sleep(Duration::from_millis(200)).await;
        outcome = run_sync(&state).await;
    }
    if !outcome.to_download.is_empty() {
        warn!("Models still missing after sync: {:?}", outcome.to_download);
    }

    runtime::set_ready(true);
    info!("Node initialized successfully, ready to serve requests");

    tokio::spawn(heartbeat_loop(
        state.clone(),
        identity,
        config.heartbeat_interval_sec.max(1),
    ));
    tokio::spawn(idle_sweep_loop(manager));

    server.await??;
    runtime::request_shutdown();
    Ok(())
}

async fn run_sync(state: &AppState) -> SyncOutcome {
    let outcome = match state.sync.sync(&state.downloader).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("Model sync failed: {}", err);
            SyncOutcome::default()
        }
    };
    state.set_registry(state.sync.remote_models()).await;
    outcome
}

async fn heartbeat_loop(state: AppState, identity: NodeIdentity, interval_secs: u64) {
    let sampler = sysstat::SystemSampler::new();
    let interval = Duration::from_secs(interval_secs);

    while runtime::is_running() {
        let sample = sampler.sample();
        let payload = HeartbeatPayload {
            node_id: identity.node_id.clone(),
            cpu_usage: sample.cpu_usage,
            memory_usage: sample.memory_usage,
            active_requests: state.active_requests.load(Ordering::SeqCst),
            loaded_models: state.loaded_model_names(),
            initializing: !runtime::is_ready(),
            gpu_usage: None,
        };
        state
            .router
            .heartbeat(&identity.agent_token, &payload, 2)
            .await;
        tokio::time::sleep(interval).await;
    }
}

async fn idle_sweep_loop(manager: Arc<LlamaManager>) {
    while runtime::is_running() {
        tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
        let unloaded = manager.unload_idle();
        if unloaded > 0 {
            info!("Idle sweep unloaded {} models", unloaded);
        }
    }
}

/// The address the router should reach us at: explicit config, else the
/// interface facing the router, approximated by the router URL's host.
fn node_ip(config: &NodeConfig) -> String {
    if !config.ip_address.is_empty() {
        return config.ip_address.clone();
    }
    let mut host = config.router_url.as_str();
    if let Some((_, rest)) = host.split_once("://") {
        host = rest;
    }
    let host = host.split([':', '/']).next().unwrap_or("127.0.0.1");
    if host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(router_url: &str, ip: &str) -> NodeConfig {
        NodeConfig {
            router_url: router_url.to_string(),
            ip_address: ip.to_string(),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn explicit_ip_wins() {
        let cfg = config_with("http://192.168.1.10:8081", "10.0.0.5");
        assert_eq!(node_ip(&cfg), "10.0.0.5");
    }

    #[test]
    fn ip_derives_from_router_host() {
        let cfg = config_with("http://192.168.1.10:8081/api", "");
        assert_eq!(node_ip(&cfg), "192.168.1.10");
    }

    #[test]
    fn localhost_router_maps_to_loopback() {
        let cfg = config_with("http://localhost:11434", "");
        assert_eq!(node_ip(&cfg), "127.0.0.1");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
    runtime::request_shutdown();
}
