use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

/// Polled resource ceilings for a supervised child. Exceeding either limit
/// kills the process; enforcement is sampling-based, not in-kernel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_cpu_percent: Option<f32>,
    pub max_memory_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.max_cpu_percent.is_none() && self.max_memory_bytes.is_none()
    }

    /// Violation message for a sample, if any.
    pub fn violation(&self, sample: &ResourceSample) -> Option<String> {
        if let Some(max_memory) = self.max_memory_bytes {
            if sample.memory_bytes > max_memory {
                return Some(format!(
                    "memory {} bytes exceeds limit {} bytes",
                    sample.memory_bytes, max_memory
                ));
            }
        }
        if let Some(max_cpu) = self.max_cpu_percent {
            if sample.cpu_percent > max_cpu {
                return Some(format!(
                    "cpu {:.1}% exceeds limit {:.1}%",
                    sample.cpu_percent, max_cpu
                ));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// CPU/RSS sampler for one child pid. CPU usage is meaningful from the
/// second sample onward, so the monitor keeps one sampler per child.
pub struct ResourceSampler {
    sys: System,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    pub fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        let pid = Pid::from_u32(pid);
        if !self.sys.refresh_process(pid) {
            return None;
        }
        let process = self.sys.process(pid)?;
        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_reports_memory_first() {
        let limits = ResourceLimits {
            max_cpu_percent: Some(50.0),
            max_memory_bytes: Some(32 * 1024 * 1024),
        };
        let sample = ResourceSample { cpu_percent: 90.0, memory_bytes: 64 * 1024 * 1024 };
        let reason = limits.violation(&sample).unwrap();
        assert!(reason.contains("memory"));
        assert!(reason.contains("exceeds limit"));
    }

    #[test]
    fn within_limits_is_clean() {
        let limits = ResourceLimits {
            max_cpu_percent: Some(80.0),
            max_memory_bytes: Some(128 * 1024 * 1024),
        };
        let sample = ResourceSample { cpu_percent: 10.0, memory_bytes: 1024 };
        assert!(limits.violation(&sample).is_none());
    }

    #[test]
    fn no_limits_never_violates() {
        let limits = ResourceLimits::default();
        assert!(limits.is_unlimited());
        let sample = ResourceSample { cpu_percent: 400.0, memory_bytes: u64::MAX };
        assert!(limits.violation(&sample).is_none());
    }
}
