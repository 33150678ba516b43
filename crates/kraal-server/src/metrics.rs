//! Prometheus metrics for the node-control surface.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::Instant;

/// Node-level metrics exposed at `/metrics` and `/metrics/prom`.
pub struct NodeMetrics {
    registry: Registry,
    started: Instant,
    uptime_seconds: Gauge,
    pub pull_total: IntCounter,
    pub gpu_devices: IntGauge,
    pub gpu_memory_bytes: IntGauge,
    pub gpu_capability: Gauge,
}

impl NodeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let uptime_seconds =
            Gauge::new("kraal_node_uptime_seconds", "Node uptime in seconds").unwrap();
        let pull_total =
            IntCounter::new("kraal_node_pull_total", "Number of pull requests received").unwrap();
        let gpu_devices = IntGauge::new("kraal_node_gpu_devices", "Detected GPU devices").unwrap();
        let gpu_memory_bytes =
            IntGauge::new("kraal_node_gpu_memory_bytes", "Total GPU memory bytes").unwrap();
        let gpu_capability =
            Gauge::new("kraal_node_gpu_capability", "Aggregated GPU capability score").unwrap();

        registry.register(Box::new(uptime_seconds.clone())).unwrap();
        registry.register(Box::new(pull_total.clone())).unwrap();
        registry.register(Box::new(gpu_devices.clone())).unwrap();
        registry.register(Box::new(gpu_memory_bytes.clone())).unwrap();
        registry.register(Box::new(gpu_capability.clone())).unwrap();

        Self {
            registry,
            started: Instant::now(),
            uptime_seconds,
            pull_total,
            gpu_devices,
            gpu_memory_bytes,
            gpu_capability,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        self.uptime_seconds.set(self.started.elapsed().as_secs_f64());
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_series() {
        let metrics = NodeMetrics::new();
        metrics.pull_total.inc();
        metrics.gpu_devices.set(2);
        metrics.gpu_memory_bytes.set(1024);
        metrics.gpu_capability.set(8.9);

        let text = metrics.render();
        assert!(text.contains("kraal_node_uptime_seconds"));
        assert!(text.contains("kraal_node_pull_total 1"));
        assert!(text.contains("kraal_node_gpu_devices 2"));
        assert!(text.contains("kraal_node_gpu_memory_bytes 1024"));
        assert!(text.contains("kraal_node_gpu_capability 8.9"));
    }
}
