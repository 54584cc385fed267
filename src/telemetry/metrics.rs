//! Telemetry readings and the snapshot published to subscribers

use serde::Serialize;

use super::history::HistorySeries;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One accelerator reading. `None` means the backend cannot measure the
/// field, which is different from a measured zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformMetrics {
    pub device_name: Option<String>,
    pub utilization_percent: Option<f32>,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub temperature_c: Option<f32>,
    pub power_w: Option<f32>,
}

impl PlatformMetrics {
    /// Placeholder used when the backend is unavailable
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn memory_percent(&self) -> Option<f32> {
        match (self.memory_used_bytes, self.memory_total_bytes) {
            (Some(used), Some(total)) if total > 0 => {
                Some((used as f64 / total as f64 * 100.0) as f32)
            }
            _ => None,
        }
    }
}

/// Host CPU and RAM reading, shared by every backend
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub ram_used_bytes: u64,
    pub ram_total_bytes: u64,
}

impl HostMetrics {
    pub fn ram_percent(&self) -> f32 {
        if self.ram_total_bytes == 0 {
            return 0.0;
        }
        (self.ram_used_bytes as f64 / self.ram_total_bytes as f64 * 100.0) as f32
    }
}

pub(crate) fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Payload of a `gpu_stats` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub platform: String,
    pub gpu_name: String,
    pub gpu_percent: Option<f32>,
    pub vram_used_gb: Option<f64>,
    pub vram_total_gb: Option<f64>,
    pub vram_percent: Option<f32>,
    pub temp_c: Option<f32>,
    pub power_w: Option<f32>,
    pub cpu_percent: f32,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub ram_percent: f32,
    pub history: HistorySeries,
}

impl TelemetrySnapshot {
    pub fn new(
        platform: &str,
        device: &PlatformMetrics,
        host: &HostMetrics,
        history: HistorySeries,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            gpu_name: device.device_name.clone().unwrap_or_else(|| "N/A".to_string()),
            gpu_percent: device.utilization_percent,
            vram_used_gb: device.memory_used_bytes.map(gigabytes),
            vram_total_gb: device.memory_total_bytes.map(gigabytes),
            vram_percent: device.memory_percent(),
            temp_c: device.temperature_c,
            power_w: device.power_w,
            cpu_percent: host.cpu_percent,
            ram_used_gb: gigabytes(host.ram_used_bytes),
            ram_total_gb: gigabytes(host.ram_total_bytes),
            ram_percent: host.ram_percent(),
            history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_serialize_as_null() {
        let snapshot = TelemetrySnapshot::new(
            "CPU only",
            &PlatformMetrics::unknown(),
            &HostMetrics { cpu_percent: 12.5, ram_used_bytes: 1 << 30, ram_total_bytes: 4 << 30 },
            HistorySeries::default(),
        );
        let value = serde_json::to_value(&snapshot).expect("json");

        assert_eq!(value["gpu_name"], "N/A");
        assert!(value["gpu_percent"].is_null());
        assert!(value["vram_percent"].is_null());
        assert!(value["temp_c"].is_null());
        assert_eq!(value["ram_used_gb"], 1.0);
        assert_eq!(value["ram_percent"], 25.0);
    }

    #[test]
    fn measured_zero_is_not_unknown() {
        let device = PlatformMetrics {
            utilization_percent: Some(0.0),
            memory_used_bytes: Some(0),
            memory_total_bytes: Some(8 << 30),
            ..PlatformMetrics::default()
        };
        assert_eq!(device.memory_percent(), Some(0.0));
        assert_eq!(PlatformMetrics::unknown().memory_percent(), None);
    }
}
