//! Fixed-length rolling telemetry history

use std::collections::VecDeque;

use serde::Serialize;

use super::metrics::{HostMetrics, PlatformMetrics, gigabytes};

/// Sliding window over the most recent `capacity` values
#[derive(Debug, Clone)]
pub struct RollingHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { values: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in the order they were pushed
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

/// Plain copy of all four channels
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistorySeries {
    pub gpu_util: Vec<f64>,
    pub vram_used: Vec<f64>,
    pub cpu_util: Vec<f64>,
    pub ram_used: Vec<f64>,
}

/// Rolling histories for accelerator utilization, accelerator memory (GB),
/// host CPU and host RAM (GB)
#[derive(Debug, Clone)]
pub struct MetricHistory {
    gpu_util: RollingHistory,
    vram_used: RollingHistory,
    cpu_util: RollingHistory,
    ram_used: RollingHistory,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            gpu_util: RollingHistory::new(capacity),
            vram_used: RollingHistory::new(capacity),
            cpu_util: RollingHistory::new(capacity),
            ram_used: RollingHistory::new(capacity),
        }
    }

    /// Record one tick. Unknown readings are charted as zero.
    pub fn record(&mut self, device: &PlatformMetrics, host: &HostMetrics) {
        self.gpu_util.push(device.utilization_percent.map_or(0.0, f64::from));
        self.vram_used.push(device.memory_used_bytes.map_or(0.0, gigabytes));
        self.cpu_util.push(f64::from(host.cpu_percent));
        self.ram_used.push(gigabytes(host.ram_used_bytes));
    }

    pub fn series(&self) -> HistorySeries {
        HistorySeries {
            gpu_util: self.gpu_util.to_vec(),
            vram_used: self.vram_used.to_vec(),
            cpu_util: self.cpu_util.to_vec(),
            ram_used: self.ram_used.to_vec(),
        }
    }
}
