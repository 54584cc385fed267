//! Hardware telemetry
//!
//! A [`TelemetrySampler`] polls one [`TelemetryBackend`] plus the host's CPU
//! and RAM on a fixed interval and publishes `gpu_stats` events.

mod backend;
mod history;
mod host;
mod metrics;
mod sampler;

pub use backend::{JetsonSysfs, NvidiaSmi, PlatformKind, TelemetryBackend};
pub use history::{HistorySeries, MetricHistory, RollingHistory};
pub use host::HostSampler;
pub use metrics::{HostMetrics, PlatformMetrics, TelemetrySnapshot};
pub use sampler::TelemetrySampler;
