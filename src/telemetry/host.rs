//! Host CPU and RAM sampling

use sysinfo::System;

use super::metrics::HostMetrics;

/// Keeps one `System` around so CPU usage is measured between calls
pub struct HostSampler {
    system: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // First CPU reading is always zero; prime it
        system.refresh_cpu_usage();
        Self { system }
    }

    pub fn sample(&mut self) -> HostMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        HostMetrics {
            cpu_percent: self.system.global_cpu_usage(),
            ram_used_bytes: self.system.used_memory(),
            ram_total_bytes: self.system.total_memory(),
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}
