use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::platform::PlatformInfo;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Coarse capability class of a device. Drives all resource policy and is
/// immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minimal,
    Constrained,
    Full,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Minimal => write!(f, "minimal"),
            Tier::Constrained => write!(f, "constrained"),
            Tier::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = crate::error::FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "minimal" => Ok(Tier::Minimal),
            "constrained" => Ok(Tier::Constrained),
            "full" => Ok(Tier::Full),
            other => Err(crate::error::FleetError::Config(format!(
                "unknown tier {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// Device capability and the resource policy derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub tier: Tier,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub cpu_cores: usize,

    // Derived policy
    pub has_embedded_store: bool,
    pub local_storage_cap_bytes: u64,
    pub max_metrics_in_memory: usize,
    pub sync_interval_secs: u64,
    pub batch_size: usize,
    pub compression: Compression,
    pub supports_http2: bool,
}

impl Capability {
    /// Classify the device and derive its policy. The same platform
    /// readings always produce the same capability; `FLEETD_TIER` forces
    /// the tier regardless of the probed resources.
    pub fn detect(platform: &PlatformInfo) -> Self {
        let forced = std::env::var("FLEETD_TIER")
            .ok()
            .and_then(|value| value.parse::<Tier>().ok());

        let ram = platform.total_memory_bytes;
        let disk = platform.total_disk_bytes;
        let tier = forced.unwrap_or(if disk > GB && ram > 512 * MB {
            Tier::Full
        } else if disk > 10 * MB && ram > 64 * MB {
            Tier::Constrained
        } else {
            Tier::Minimal
        });

        Self::for_tier(tier, platform)
    }

    /// Policy table for a given tier.
    pub fn for_tier(tier: Tier, platform: &PlatformInfo) -> Self {
        let ram = platform.total_memory_bytes;
        let disk = platform.total_disk_bytes;

        let mut capability = match tier {
            Tier::Full => Self {
                tier,
                total_memory_bytes: ram,
                total_disk_bytes: disk,
                cpu_cores: platform.cpu_cores,
                has_embedded_store: true,
                local_storage_cap_bytes: 100 * MB,
                max_metrics_in_memory: 10_000,
                sync_interval_secs: 300,
                batch_size: 1000,
                compression: Compression::Zstd,
                supports_http2: true,
            },
            Tier::Constrained => Self {
                tier,
                total_memory_bytes: ram,
                total_disk_bytes: disk,
                cpu_cores: platform.cpu_cores,
                has_embedded_store: true,
                local_storage_cap_bytes: 5 * MB,
                max_metrics_in_memory: 1_000,
                sync_interval_secs: 60,
                batch_size: 100,
                compression: Compression::Gzip,
                supports_http2: true,
            },
            Tier::Minimal => Self {
                tier,
                total_memory_bytes: ram,
                total_disk_bytes: disk,
                cpu_cores: platform.cpu_cores,
                has_embedded_store: false,
                local_storage_cap_bytes: 0,
                max_metrics_in_memory: 100,
                sync_interval_secs: 10,
                batch_size: 10,
                compression: Compression::None,
                supports_http2: false,
            },
        };

        // Single-core devices stay on HTTP/1.1
        if capability.cpu_cores <= 1 {
            capability.supports_http2 = false;
        }

        capability
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Feature gating: heavier features require the Full tier.
    pub fn supports_feature(&self, feature: &str) -> bool {
        match feature {
            "local-analytics" | "edge-compute" => self.tier == Tier::Full,
            "local-storage" => self.has_embedded_store,
            _ => true,
        }
    }
}
