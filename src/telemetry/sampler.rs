//! Periodic telemetry sampling

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backend::{PlatformKind, TelemetryBackend};
use super::history::{HistorySeries, MetricHistory};
use super::host::HostSampler;
use super::metrics::{HostMetrics, PlatformMetrics, TelemetrySnapshot};
use crate::broadcast::{Broadcaster, Event};
use crate::config::TelemetryConfig;

/// Samples the accelerator and host, keeping a rolling history.
///
/// Sampling never fails: an unavailable backend yields an all-unknown
/// reading for that tick.
pub struct TelemetrySampler {
    backend: TelemetryBackend,
    host: HostSampler,
    history: MetricHistory,
    degraded: bool,
}

impl TelemetrySampler {
    pub fn new(backend: TelemetryBackend, history_size: usize) -> Self {
        Self {
            backend,
            host: HostSampler::new(),
            history: MetricHistory::new(history_size),
            degraded: false,
        }
    }

    /// Probe the platform (or use the configured one). Blocking.
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(TelemetryBackend::probe(config.platform), config.history_size)
    }

    pub fn platform(&self) -> PlatformKind {
        self.backend.kind()
    }

    /// Take one reading (blocking)
    pub fn sample(&mut self) -> TelemetrySnapshot {
        let device = match self.backend.sample() {
            Ok(device) => {
                if std::mem::take(&mut self.degraded) {
                    info!("Telemetry backend {} recovered", self.backend.label());
                }
                device
            }
            Err(e) => {
                // Warn once per outage
                if !std::mem::replace(&mut self.degraded, true) {
                    warn!("{}", e);
                }
                PlatformMetrics::unknown()
            }
        };
        let host = self.host.sample();
        self.record(&device, &host)
    }

    /// Fold a reading into the history and build the snapshot
    pub fn record(&mut self, device: &PlatformMetrics, host: &HostMetrics) -> TelemetrySnapshot {
        self.history.record(device, host);
        TelemetrySnapshot::new(self.backend.label(), device, host, self.history.series())
    }

    pub fn history(&self) -> HistorySeries {
        self.history.series()
    }

    pub fn shutdown(&mut self) {
        self.backend.shutdown();
    }

    /// Publish one `gpu_stats` event per `interval` until `cancel` fires
    pub fn spawn(
        self,
        interval: Duration,
        broadcaster: Broadcaster,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(interval, broadcaster, cancel).await;
        })
    }

    async fn run(self, interval: Duration, broadcaster: Broadcaster, cancel: CancellationToken) {
        info!("Telemetry sampler started ({:?} interval)", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sampler = self;
        let mut ticks = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Backends shell out or read sysfs; keep them off the runtime
            let sampling = tokio::task::spawn_blocking(move || {
                let snapshot = sampler.sample();
                (sampler, snapshot)
            });
            let result = tokio::select! {
                result = sampling => result,
                _ = cancel.cancelled() => {
                    // The blocking read finishes on its own and drops the sampler
                    info!("Telemetry sampler stopped mid-sample after {} samples", ticks);
                    return;
                }
            };

            let snapshot = match result {
                Ok((returned, snapshot)) => {
                    sampler = returned;
                    snapshot
                }
                Err(e) => {
                    error!("Telemetry sampling panicked: {}", e);
                    return;
                }
            };

            ticks += 1;
            let delivered = broadcaster.publish(&Event::GpuStats { stats: snapshot });
            debug!(ticks, delivered, "Published telemetry");
        }

        sampler.shutdown();
        info!("Telemetry sampler stopped after {} samples", ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keeps_last_sixty() {
        let mut sampler = TelemetrySampler::new(TelemetryBackend::Cpu, 60);
        let host = HostMetrics { cpu_percent: 0.0, ram_used_bytes: 0, ram_total_bytes: 1 };

        let mut snapshot = None;
        for i in 0..75 {
            let device = PlatformMetrics {
                utilization_percent: Some(i as f32),
                ..PlatformMetrics::unknown()
            };
            snapshot = Some(sampler.record(&device, &host));
        }

        let expected: Vec<f64> = (15..75).map(f64::from).collect();
        assert_eq!(sampler.history().gpu_util, expected);
        assert_eq!(snapshot.expect("recorded").history.gpu_util, expected);
    }

    #[test]
    fn unavailable_backend_degrades_to_unknown() {
        let backend = TelemetryBackend::probe(Some(PlatformKind::Cpu));
        let mut sampler = TelemetrySampler::new(backend, 60);
        let snapshot = sampler.sample();
        assert_eq!(snapshot.platform, "CPU only");
        assert_eq!(snapshot.gpu_percent, None);
        assert_eq!(sampler.history().gpu_util, vec![0.0]);
    }

    #[tokio::test]
    async fn publishes_until_cancelled() {
        let broadcaster = Broadcaster::new(16);
        let mut subscription = broadcaster.subscribe();
        let cancel = CancellationToken::new();

        let sampler = TelemetrySampler::new(TelemetryBackend::Cpu, 60);
        let task = sampler.spawn(Duration::from_millis(10), broadcaster.clone(), cancel.clone());

        // Skip the greeting, then wait for two ticks
        let greeting = subscription.recv().await.expect("status");
        assert!(greeting.contains("\"type\":\"status\""));
        for _ in 0..2 {
            let message = subscription.recv().await.expect("telemetry");
            assert!(message.contains("\"type\":\"gpu_stats\""));
        }

        cancel.cancel();
        task.await.expect("sampler task");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_does_not_wait_for_a_hung_sample() {
        use crate::telemetry::NvidiaSmi;
        use crate::telemetry::backend::fake_nvidia_smi;

        let script = fake_nvidia_smi("sampler-hung", "exec sleep 30");
        let backend =
            TelemetryBackend::Nvidia(NvidiaSmi::with_program(0, &script, Duration::from_secs(1)));
        let broadcaster = Broadcaster::new(16);
        let cancel = CancellationToken::new();

        let task = TelemetrySampler::new(backend, 60).spawn(
            Duration::from_millis(10),
            broadcaster,
            cancel.clone(),
        );

        // Let the first sample get stuck in the subprocess
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("sampler stops promptly")
            .expect("sampler task");
        let _ = std::fs::remove_file(script);
    }
}
