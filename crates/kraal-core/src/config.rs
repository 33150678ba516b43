//! Configuration types for the kraal node.
//!
//! Settings come from three layers, weakest first: built-in defaults, the
//! JSON config file at `~/.llm-router/config.json` (path overridable via
//! `LLM_NODE_CONFIG`), and per-field environment variables. A field that
//! fails to parse is skipped with a warning and keeps its previous value.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Node-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Router base URL.
    #[serde(default = "default_router_url")]
    pub router_url: String,

    /// Directory holding model subdirectories.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Port the node's HTTP server listens on.
    #[serde(default = "default_node_port")]
    pub node_port: u16,

    /// Bind address for the HTTP server.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Seconds between heartbeats to the router.
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,

    /// Refuse to start without a GPU.
    #[serde(default = "default_require_gpu")]
    pub require_gpu: bool,

    /// IP address reported to the router; empty means derive it.
    #[serde(default)]
    pub ip_address: String,

    /// Re-download corrupt models automatically.
    #[serde(default)]
    pub auto_repair: bool,

    /// Timeout for waiting on a repair, in seconds.
    #[serde(default = "default_repair_timeout_secs")]
    pub repair_timeout_secs: u64,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            router_url: default_router_url(),
            models_dir: default_models_dir(),
            node_port: default_node_port(),
            bind_address: default_bind_address(),
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            require_gpu: default_require_gpu(),
            ip_address: String::new(),
            auto_repair: false,
            repair_timeout_secs: default_repair_timeout_secs(),
            download: DownloadConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Downloader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed backoff between attempts, in milliseconds.
    #[serde(default = "default_backoff_ms", rename = "backoff_ms")]
    pub backoff_ms: u64,

    /// Concurrent download tasks per model.
    #[serde(default = "default_max_concurrency", rename = "concurrency")]
    pub max_concurrency: usize,

    /// Bandwidth cap in bytes per second; 0 means unlimited.
    #[serde(default, rename = "max_bps")]
    pub max_bytes_per_sec: u64,

    /// Streaming chunk size in bytes.
    #[serde(default = "default_chunk_size", rename = "chunk")]
    pub chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_concurrency: default_max_concurrency(),
            max_bytes_per_sec: 0,
            chunk_size: default_chunk_size(),
        }
    }
}

impl DownloadConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Model-cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Unload models idle for longer than this many seconds; 0 disables.
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Maximum number of loaded models; 0 means unlimited.
    #[serde(default)]
    pub max_loaded: usize,

    /// Maximum bytes of loaded model weights; 0 means unlimited.
    #[serde(default)]
    pub max_memory_bytes: u64,

    /// Layers to offload to the GPU.
    #[serde(default)]
    pub gpu_layers: u32,
}

fn default_router_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_models_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llm-router")
        .join("models")
}

fn default_node_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_heartbeat_interval_sec() -> u64 {
    10
}

fn default_require_gpu() -> bool {
    true
}

fn default_repair_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_max_concurrency() -> usize {
    4
}

fn default_chunk_size() -> usize {
    4096
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LLM_NODE_CONFIG") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir().map(|home| home.join(".llm-router").join("config.json"))
}

impl NodeConfig {
    /// Load configuration from the config file and environment.
    pub fn load() -> Self {
        let mut cfg = Self::from_file().unwrap_or_default();
        cfg.apply_env();
        cfg
    }

    fn from_file() -> Option<Self> {
        let path = config_file_path()?;
        if !path.exists() {
            return None;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!("Failed to read config file {}: {}", path.display(), err);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(cfg) => Some(cfg),
            Err(err) => {
                warn!("Ignoring invalid config file {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Apply environment variable overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("LLM_ROUTER_URL") {
            self.router_url = v;
        }
        if let Some(v) = env_string("LLM_NODE_MODELS_DIR") {
            self.models_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parsed::<u16>("LLM_NODE_PORT") {
            self.node_port = v;
        }
        if let Some(v) = env_string("LLM_NODE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = env_parsed::<u64>("LLM_NODE_HEARTBEAT_SECS") {
            self.heartbeat_interval_sec = v;
        }
        if env_truthy("LLM_NODE_ALLOW_NO_GPU") {
            self.require_gpu = false;
        }
        if let Some(v) = env_string("LLM_NODE_IP") {
            self.ip_address = v;
        }
        if env_truthy("LLM_NODE_AUTO_REPAIR") {
            self.auto_repair = true;
        }
        if let Some(v) = env_parsed::<u64>("LLM_NODE_REPAIR_TIMEOUT_SECS") {
            self.repair_timeout_secs = v;
        }

        if let Some(v) = env_parsed::<u32>("LLM_DL_MAX_RETRIES") {
            self.download.max_retries = v;
        }
        if let Some(v) = env_parsed::<u64>("LLM_DL_BACKOFF_MS") {
            self.download.backoff_ms = v;
        }
        if let Some(v) = env_parsed::<usize>("LLM_DL_CONCURRENCY") {
            if v > 0 && v < 64 {
                self.download.max_concurrency = v;
            }
        }
        if let Some(v) = env_parsed::<u64>("LLM_DL_MAX_BPS") {
            self.download.max_bytes_per_sec = v;
        }
        if let Some(v) = env_parsed::<usize>("LLM_DL_CHUNK") {
            if v > 0 && v <= 1 << 20 {
                self.download.chunk_size = v;
            }
        }

        if let Some(v) = env_parsed::<u64>("LLM_MODEL_IDLE_TIMEOUT") {
            self.cache.idle_timeout_secs = v;
        }
        if let Some(v) = env_parsed::<usize>("LLM_MAX_LOADED_MODELS") {
            self.cache.max_loaded = v;
        }
        if let Some(v) = env_parsed::<u64>("LLM_MAX_MEMORY_BYTES") {
            self.cache.max_memory_bytes = v;
        }
        if let Some(v) = env_parsed::<u32>("LLM_GPU_LAYERS") {
            self.cache.gpu_layers = v;
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}='{}'", name, raw);
            None
        }
    }
}

fn env_truthy(name: &str) -> bool {
    matches!(
        env_string(name).as_deref().map(str::to_ascii_lowercase),
        Some(ref v) if v == "1" || v == "true" || v == "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.router_url, "http://127.0.0.1:11434");
        assert_eq!(cfg.node_port, 8080);
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert_eq!(cfg.heartbeat_interval_sec, 10);
        assert!(cfg.require_gpu);
        assert!(!cfg.auto_repair);
        assert_eq!(cfg.repair_timeout_secs, 300);
        assert_eq!(cfg.download.max_retries, 2);
        assert_eq!(cfg.download.backoff(), Duration::from_millis(200));
        assert_eq!(cfg.download.max_concurrency, 4);
        assert_eq!(cfg.download.max_bytes_per_sec, 0);
        assert_eq!(cfg.download.chunk_size, 4096);
        assert_eq!(cfg.cache.max_loaded, 0);
        assert_eq!(cfg.cache.max_memory_bytes, 0);
        assert_eq!(cfg.cache.gpu_layers, 0);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{"router_url":"http://router:9000","node_port":9001}"#)
                .unwrap();
        assert_eq!(cfg.router_url, "http://router:9000");
        assert_eq!(cfg.node_port, 9001);
        assert_eq!(cfg.heartbeat_interval_sec, 10);
        assert_eq!(cfg.download.max_concurrency, 4);
    }

    #[test]
    fn download_config_accepts_wire_names() {
        let cfg: DownloadConfig = serde_json::from_str(
            r#"{"max_retries":5,"backoff_ms":50,"concurrency":2,"max_bps":1024,"chunk":512}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.backoff_ms, 50);
        assert_eq!(cfg.max_concurrency, 2);
        assert_eq!(cfg.max_bytes_per_sec, 1024);
        assert_eq!(cfg.chunk_size, 512);
    }
}
