//! Accelerator and host probing
//!
//! Detection uses filesystem probes and `nvidia-smi` rather than linking to
//! GPU libraries, so the worker builds and tests on machines without CUDA.

use serde::{Deserialize, Serialize};
use sonic_kernel::config::{DeviceConfig, ModelsConfig};
use sonic_kernel::error::ModelLoadError;
use sonic_kernel::model::DeviceId;
use std::path::Path;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::{info, warn};

const MIB: u64 = 1024 * 1024;

/// Device memory assumed when the node exists but `nvidia-smi` cannot report it.
pub const UNKNOWN_VRAM_BYTES: u64 = 16 * 1024 * MIB;

/// What the worker found at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProbe {
    pub device: DeviceId,
    /// Device memory available to the bundle and its jobs.
    pub memory_bytes: u64,
    pub total_ram_bytes: u64,
    pub available_ram_bytes: u64,
}

/// Probe the configured device and check host memory.
///
/// Runs synchronously; call from a blocking context.
pub fn probe(device: &DeviceConfig, models: &ModelsConfig) -> Result<DeviceProbe, ModelLoadError> {
    let (total_ram_bytes, available_ram_bytes) = host_memory();
    let required = models.min_host_memory_mb.saturating_mul(MIB);
    if available_ram_bytes < required {
        return Err(ModelLoadError::InsufficientMemory(format!(
            "{} MiB available, {} MiB required",
            available_ram_bytes / MIB,
            models.min_host_memory_mb
        )));
    }

    let limit = device.memory_limit_mb.map(|mb| mb.saturating_mul(MIB));

    let (device_id, memory_bytes) = match detect_cuda(device.index) {
        Some(vram) => {
            let vram = if vram == 0 {
                warn!(
                    device = device.index,
                    "nvidia-smi did not report memory, assuming {} MiB",
                    UNKNOWN_VRAM_BYTES / MIB
                );
                UNKNOWN_VRAM_BYTES
            } else {
                vram
            };
            (DeviceId::Cuda(device.index), limit.unwrap_or(vram).min(vram))
        }
        None if device.allow_cpu_fallback => {
            warn!(
                device = device.index,
                "CUDA device not found, falling back to CPU"
            );
            (DeviceId::Cpu, limit.unwrap_or(available_ram_bytes / 2))
        }
        None => {
            return Err(ModelLoadError::DeviceUnavailable(format!(
                "/dev/nvidia{} not present",
                device.index
            )));
        }
    };

    info!(
        device = %device_id,
        memory_mb = memory_bytes / MIB,
        host_ram_mb = total_ram_bytes / MIB,
        host_available_mb = available_ram_bytes / MIB,
        "Hardware probe complete"
    );

    Ok(DeviceProbe {
        device: device_id,
        memory_bytes,
        total_ram_bytes,
        available_ram_bytes,
    })
}

fn host_memory() -> (u64, u64) {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    (sys.total_memory(), sys.available_memory())
}

/// Returns device memory in bytes if CUDA device `index` is present.
///
/// 1. `/dev/nvidia<index>` must exist (kernel module loaded)
/// 2. `nvidia-smi --id=<index> --query-gpu=memory.total` reports MiB;
///    `Some(0)` when the node exists but the query fails
fn detect_cuda(index: u32) -> Option<u64> {
    if !Path::new(&format!("/dev/nvidia{index}")).exists() {
        return None;
    }

    let output = match std::process::Command::new("nvidia-smi")
        .arg(format!("--id={index}"))
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => return Some(0),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    Some(parse_smi_mib(&stdout).map(|mib| mib * MIB).unwrap_or(0))
}

fn parse_smi_mib(stdout: &str) -> Option<u64> {
    stdout.trim().lines().next()?.trim().parse().ok()
}
