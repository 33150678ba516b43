//! Declared GPU inventory.
//!
//! Vendor probing lives outside this node; deployments declare their
//! hardware through `LLM_NODE_GPU_SPEC`, a JSON array of
//! `{"model": "...", "count": N, "memory": bytes}` objects, plus an
//! optional `LLM_NODE_GPU_CAPABILITY` score. The inventory feeds router
//! registration, the `require_gpu` startup check and the Prometheus gauges.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub model: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct GpuInventory {
    pub devices: Vec<GpuDevice>,
    pub capability: f64,
}

impl GpuInventory {
    /// Read the declared inventory from the environment.
    pub fn detect() -> Self {
        let devices = match std::env::var("LLM_NODE_GPU_SPEC") {
            Ok(raw) if !raw.trim().is_empty() => match serde_json::from_str(&raw) {
                Ok(devices) => devices,
                Err(err) => {
                    warn!("Ignoring invalid LLM_NODE_GPU_SPEC: {}", err);
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        let capability = std::env::var("LLM_NODE_GPU_CAPABILITY")
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .unwrap_or(0.0);

        Self {
            devices,
            capability,
        }
    }

    pub fn available(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn device_count(&self) -> u32 {
        self.devices.iter().map(|d| d.count).sum()
    }

    pub fn total_memory(&self) -> u64 {
        self.devices
            .iter()
            .map(|d| d.memory.unwrap_or(0) * u64::from(d.count))
            .sum()
    }

    pub fn primary_model(&self) -> Option<String> {
        self.devices.first().map(|d| d.model.clone())
    }
}
