//! Accelerator telemetry backends
//!
//! The backend is chosen once at startup by probing the platform and never
//! re-probed. Each backend is blocking and is only called from the blocking
//! thread pool.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::metrics::PlatformMetrics;
use crate::{PipelineError, Result};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Hardware families with a telemetry backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Discrete NVIDIA GPU (desktop, DGX, Jetson Thor)
    Nvidia,
    /// Jetson Orin family, read from sysfs
    #[serde(alias = "jetson_orin")]
    Jetson,
    /// No accelerator, host metrics only
    Cpu,
}

/// Closed set of telemetry backends
#[derive(Debug)]
pub enum TelemetryBackend {
    Nvidia(NvidiaSmi),
    Jetson(JetsonSysfs),
    Cpu,
}

impl TelemetryBackend {
    /// Pick a backend, honouring `forced` if given
    pub fn probe(forced: Option<PlatformKind>) -> Self {
        let backend = match forced {
            Some(PlatformKind::Nvidia) => Self::Nvidia(NvidiaSmi::new(0)),
            Some(PlatformKind::Jetson) => Self::Jetson(JetsonSysfs::new()),
            Some(PlatformKind::Cpu) => Self::Cpu,
            None => {
                if let Some(nvidia) = NvidiaSmi::detect(0) {
                    Self::Nvidia(nvidia)
                } else if JetsonSysfs::detect() {
                    Self::Jetson(JetsonSysfs::new())
                } else {
                    warn!("No GPU detected, reporting host metrics only");
                    Self::Cpu
                }
            }
        };
        info!("Telemetry backend: {}", backend.label());
        backend
    }

    pub fn kind(&self) -> PlatformKind {
        match self {
            Self::Nvidia(_) => PlatformKind::Nvidia,
            Self::Jetson(_) => PlatformKind::Jetson,
            Self::Cpu => PlatformKind::Cpu,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Nvidia(_) => "NVIDIA (nvidia-smi)",
            Self::Jetson(_) => "Jetson (sysfs)",
            Self::Cpu => "CPU only",
        }
    }

    /// Read the accelerator (blocking)
    pub fn sample(&mut self) -> Result<PlatformMetrics> {
        let reading = match self {
            Self::Nvidia(nvidia) => nvidia.sample(),
            Self::Jetson(jetson) => jetson.sample(),
            Self::Cpu => return Ok(PlatformMetrics::unknown()),
        };
        reading.map_err(|e| PipelineError::telemetry_unavailable(self.label(), format!("{e:#}")))
    }

    pub fn shutdown(&mut self) {
        debug!("Telemetry backend {} shut down", self.label());
    }
}

/// Longest a single `nvidia-smi` query may run before it is killed
pub const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(2);

const NVIDIA_SMI_POLL: Duration = Duration::from_millis(10);

const NVIDIA_SMI_FIELDS: &str =
    "name,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw";

/// NVIDIA GPU queried through `nvidia-smi`
#[derive(Debug)]
pub struct NvidiaSmi {
    device_index: u32,
    program: PathBuf,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(device_index: u32) -> Self {
        Self { device_index, program: PathBuf::from("nvidia-smi"), timeout: NVIDIA_SMI_TIMEOUT }
    }

    /// Query through another executable with the same command line
    pub fn with_program(device_index: u32, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { device_index, program: program.into(), timeout }
    }

    /// `Some` if `nvidia-smi` answers for this device
    pub fn detect(device_index: u32) -> Option<Self> {
        let nvidia = Self::new(device_index);
        match nvidia.sample() {
            Ok(metrics) => {
                let name = metrics.device_name.as_deref().unwrap_or("unknown");
                info!("Detected NVIDIA GPU: {}", name);
                Some(nvidia)
            }
            Err(e) => {
                debug!("nvidia-smi unavailable: {:#}", e);
                None
            }
        }
    }

    fn sample(&self) -> anyhow::Result<PlatformMetrics> {
        let mut child = Command::new(&self.program)
            .arg(format!("--query-gpu={NVIDIA_SMI_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .arg(format!("--id={}", self.device_index))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        // The output is one short line, so the pipe cannot fill while we poll
        let deadline = Instant::now() + self.timeout;
        while child.try_wait()?.is_none() {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!("{} did not answer within {:?}", self.program.display(), self.timeout);
            }
            std::thread::sleep(NVIDIA_SMI_POLL);
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!("nvidia-smi exited with {}", output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().ok_or_else(|| anyhow!("nvidia-smi printed nothing"))?;
        parse_nvidia_smi(line)
    }
}

/// Parse one `--format=csv,noheader,nounits` line
pub(crate) fn parse_nvidia_smi(line: &str) -> anyhow::Result<PlatformMetrics> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let &[name, util, used, total, temp, power] = fields.as_slice() else {
        bail!("expected 6 fields, got {}: {:?}", fields.len(), line);
    };

    let mib = |field: &str, what: &str| -> anyhow::Result<Option<u64>> {
        Ok(optional_number(field, what)?.map(|v| (v * BYTES_PER_MIB as f64) as u64))
    };

    Ok(PlatformMetrics {
        device_name: Some(name.to_string()),
        utilization_percent: optional_number(util, "utilization")?.map(|v| v as f32),
        memory_used_bytes: mib(used, "memory.used")?,
        memory_total_bytes: mib(total, "memory.total")?,
        temperature_c: optional_number(temp, "temperature")?.map(|v| v as f32),
        power_w: optional_number(power, "power")?.map(|v| v as f32),
    })
}

/// `[N/A]` and `[Not Supported]` mean the field is unknown
fn optional_number(field: &str, what: &str) -> anyhow::Result<Option<f64>> {
    if field.starts_with('[') || field.is_empty() {
        return Ok(None);
    }
    field.parse::<f64>().map(Some).with_context(|| format!("invalid {what}: {field:?}"))
}

/// Jetson integrated GPU read from sysfs
#[derive(Debug)]
pub struct JetsonSysfs {
    load_path: PathBuf,
    thermal_root: PathBuf,
    model: Option<String>,
}

const JETSON_GPU_LOAD: &str = "/sys/devices/gpu.0/load";
const THERMAL_ROOT: &str = "/sys/class/thermal";
const DEVICE_MODEL: &str = "/proc/device-tree/model";

impl JetsonSysfs {
    pub fn new() -> Self {
        let model = std::fs::read_to_string(DEVICE_MODEL)
            .ok()
            .map(|m| m.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
            .filter(|m| !m.is_empty());
        Self {
            load_path: PathBuf::from(JETSON_GPU_LOAD),
            thermal_root: PathBuf::from(THERMAL_ROOT),
            model,
        }
    }

    pub fn detect() -> bool {
        Path::new(JETSON_GPU_LOAD).exists()
    }

    fn sample(&self) -> anyhow::Result<PlatformMetrics> {
        let load = std::fs::read_to_string(&self.load_path)
            .with_context(|| format!("failed to read {}", self.load_path.display()))?;

        Ok(PlatformMetrics {
            device_name: Some(self.model.clone().unwrap_or_else(|| "Jetson".to_string())),
            utilization_percent: Some(parse_gpu_load(&load)?),
            // Unified memory has no separate GPU pool
            memory_used_bytes: None,
            memory_total_bytes: None,
            temperature_c: self.gpu_temperature(),
            power_w: None,
        })
    }

    fn gpu_temperature(&self) -> Option<f32> {
        let zones = std::fs::read_dir(&self.thermal_root).ok()?;
        for zone in zones.flatten() {
            let path = zone.path();
            let Ok(kind) = std::fs::read_to_string(path.join("type")) else {
                continue;
            };
            if kind.trim().to_ascii_lowercase().starts_with("gpu") {
                let raw = std::fs::read_to_string(path.join("temp")).ok()?;
                return parse_millidegrees(&raw);
            }
        }
        None
    }
}

impl Default for JetsonSysfs {
    fn default() -> Self {
        Self::new()
    }
}

/// The load file reports per-mille
pub(crate) fn parse_gpu_load(raw: &str) -> anyhow::Result<f32> {
    let per_mille: u32 = raw.trim().parse().with_context(|| format!("invalid GPU load {raw:?}"))?;
    Ok(per_mille.min(1000) as f32 / 10.0)
}

pub(crate) fn parse_millidegrees(raw: &str) -> Option<f32> {
    raw.trim().parse::<i32>().ok().map(|milli| milli as f32 / 1000.0)
}

/// Executable script standing in for `nvidia-smi`
#[cfg(all(test, unix))]
pub(crate) fn fake_nvidia_smi(name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!("livevlm-{}-{}", name, std::process::id()));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}
