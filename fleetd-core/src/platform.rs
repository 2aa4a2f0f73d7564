use std::path::Path;
use sysinfo::{Disks, System};

use crate::types::{SystemInfo, SystemStats};

/// Platform probe results used for capability detection and telemetry.
///
/// Detection is best-effort: unsupported platforms or probe failures fall
/// back to conservative defaults instead of erroring, so the agent always
/// comes up with a usable (if pessimistic) capability tier.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub cpu_cores: usize,
}

/// Conservative fallbacks when the platform cannot be probed
pub const FALLBACK_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const FALLBACK_DISK_BYTES: u64 = 1024 * 1024 * 1024;

impl PlatformInfo {
    /// Probe the local platform. `data_dir` selects which mount's disk
    /// capacity counts toward the tier decision.
    pub fn detect(data_dir: &Path) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_memory_bytes = match sys.total_memory() {
            0 => FALLBACK_MEMORY_BYTES,
            bytes => bytes,
        };

        let cpu_cores = match sys.cpus().len() {
            0 => 1,
            n => n,
        };

        Self {
            os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: std::env::consts::ARCH.to_string(),
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            total_memory_bytes,
            total_disk_bytes: disk_capacity_for(data_dir),
            cpu_cores,
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            os: self.os.clone(),
            arch: self.arch.clone(),
            hostname: self.hostname.clone(),
            total_memory_bytes: self.total_memory_bytes,
            total_disk_bytes: self.total_disk_bytes,
            cpu_cores: self.cpu_cores,
        }
    }

    /// Live usage snapshot for device info responses and telemetry.
    pub fn sample_stats(&self) -> SystemStats {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpu_percent = if sys.cpus().is_empty() {
            0.0
        } else {
            sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_used_bytes = disks
            .list()
            .iter()
            .map(|d| d.total_space().saturating_sub(d.available_space()))
            .max()
            .unwrap_or(0);

        SystemStats {
            cpu_percent,
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
            disk_used_bytes,
            uptime_secs: System::uptime(),
        }
    }
}

/// Capacity of the disk holding `data_dir`, falling back to the largest
/// mounted disk, then to the conservative default.
fn disk_capacity_for(data_dir: &Path) -> u64 {
    let disks = Disks::new_with_refreshed_list();
    let mut best_match: Option<(usize, u64)> = None;
    let mut largest: u64 = 0;

    for disk in disks.list() {
        let total = disk.total_space();
        largest = largest.max(total);
        let mount = disk.mount_point();
        if data_dir.starts_with(mount) {
            let depth = mount.components().count();
            // Deepest matching mount point wins
            if best_match.map_or(true, |(d, _)| depth > d) {
                best_match = Some((depth, total));
            }
        }
    }

    match best_match {
        Some((_, total)) if total > 0 => total,
        _ if largest > 0 => largest,
        _ => FALLBACK_DISK_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_never_reports_zero_resources() {
        let info = PlatformInfo::detect(Path::new("/"));
        assert!(info.total_memory_bytes > 0);
        assert!(info.total_disk_bytes > 0);
        assert!(info.cpu_cores >= 1);
        assert!(!info.arch.is_empty());
    }
}
