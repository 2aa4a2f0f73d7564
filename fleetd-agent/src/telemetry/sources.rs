use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::supervisor::Supervisor;
use fleetd_core::platform::PlatformInfo;
use fleetd_core::types::Metric;

/// A producer of telemetry samples.
#[async_trait]
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;
    async fn collect(&self) -> Result<Vec<Metric>>;
}

/// Host-level metrics: CPU, memory, disk, uptime.
pub struct SystemMetricsSource {
    platform: PlatformInfo,
}

impl SystemMetricsSource {
    pub fn new(platform: PlatformInfo) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl MetricSource for SystemMetricsSource {
    fn name(&self) -> &str {
        "system"
    }

    async fn collect(&self) -> Result<Vec<Metric>> {
        let stats = self.platform.sample_stats();
        let host = self.platform.hostname.clone();
        let tag = |metric: Metric| metric.with_label("host", host.clone());

        Ok(vec![
            tag(Metric::new("system.cpu_percent", stats.cpu_percent as f64)),
            tag(Metric::new("system.memory_used_bytes", stats.memory_used_bytes as f64)),
            tag(Metric::new("system.memory_total_bytes", stats.memory_total_bytes as f64)),
            tag(Metric::new("system.disk_used_bytes", stats.disk_used_bytes as f64)),
            tag(Metric::new("system.uptime_secs", stats.uptime_secs as f64)),
        ])
    }
}

/// Per-child liveness gauges from the process supervisor.
pub struct SupervisorMetricsSource {
    supervisor: Arc<Supervisor>,
}

impl SupervisorMetricsSource {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl MetricSource for SupervisorMetricsSource {
    fn name(&self) -> &str {
        "supervisor"
    }

    async fn collect(&self) -> Result<Vec<Metric>> {
        let running = self.supervisor.list().await;
        let mut metrics = Vec::with_capacity(running.len() + 1);
        metrics.push(Metric::new("supervisor.processes_running", running.len() as f64));
        for name in running {
            let uptime = self
                .supervisor
                .uptime(&name)
                .await
                .map(|d| d.num_seconds().max(0) as f64)
                .unwrap_or(0.0);
            metrics.push(
                Metric::new("supervisor.process_uptime_secs", uptime).with_label("process", name),
            );
        }
        Ok(metrics)
    }
}
