//! Host statistics for heartbeats.

use std::sync::Mutex;
use sysinfo::System;

/// One heartbeat's worth of host metrics. Both values are percentages.
#[derive(Debug, Clone, Copy)]
pub struct SystemSample {
    pub cpu_usage: f32,
    pub memory_usage: f32,
}

/// Samples CPU and memory utilization via sysinfo.
pub struct SystemSampler {
    sys: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> SystemSample {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_usage = sys.global_cpu_info().cpu_usage();
        let total = sys.total_memory();
        // Heartbeats report memory as a percentage of total, not bytes.
        let memory_usage = if total > 0 {
            (sys.used_memory() as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        SystemSample {
            cpu_usage,
            memory_usage,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_usage_is_a_percentage() {
        let sampler = SystemSampler::new();
        let sample = sampler.sample();
        assert!((0.0..=100.0).contains(&sample.memory_usage));
    }
}
