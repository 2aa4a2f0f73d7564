use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{MetricStorage, StorageInfo, StoredMetric};
use crate::error::FleetResult;
use crate::types::{Metric, UpdateRecord};

/// Volatile metric buffer for Minimal-tier devices. Bounded; the oldest
/// entry is dropped on overflow. Nothing survives a restart.
pub struct MemoryRing {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: i64,
    metrics: VecDeque<StoredMetric>,
    bytes_used: u64,
    history: Vec<UpdateRecord>,
    state_snapshot: Option<String>,
}

impl MemoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                next_id: 1,
                metrics: VecDeque::new(),
                bytes_used: 0,
                history: Vec::new(),
                state_snapshot: None,
            }),
        }
    }
}

fn metric_size(metric: &Metric) -> u64 {
    serde_json::to_vec(metric).map(|v| v.len() as u64).unwrap_or(64)
}

#[async_trait]
impl MetricStorage for MemoryRing {
    async fn store_metric(&self, metric: &Metric) -> FleetResult<()> {
        let size = metric_size(metric);
        let mut inner = self.inner.lock().expect("metric ring poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.metrics.push_back(StoredMetric { id, metric: metric.clone() });
        inner.bytes_used += size;
        while inner.metrics.len() > self.capacity {
            if let Some(dropped) = inner.metrics.pop_front() {
                inner.bytes_used = inner.bytes_used.saturating_sub(metric_size(&dropped.metric));
            }
        }
        Ok(())
    }

    async fn unsynced_metrics(&self, limit: usize) -> FleetResult<Vec<StoredMetric>> {
        let inner = self.inner.lock().expect("metric ring poisoned");
        Ok(inner.metrics.iter().take(limit).cloned().collect())
    }

    async fn mark_synced(&self, ids: &[i64]) -> FleetResult<()> {
        let mut inner = self.inner.lock().expect("metric ring poisoned");
        inner.metrics.retain(|stored| !ids.contains(&stored.id));
        inner.bytes_used = inner.metrics.iter().map(|s| metric_size(&s.metric)).sum();
        Ok(())
    }

    async fn record_update(&self, record: &UpdateRecord) -> FleetResult<()> {
        let mut inner = self.inner.lock().expect("metric ring poisoned");
        inner.history.push(record.clone());
        Ok(())
    }

    async fn update_history(&self, limit: usize) -> FleetResult<Vec<UpdateRecord>> {
        let inner = self.inner.lock().expect("metric ring poisoned");
        Ok(inner.history.iter().rev().take(limit).cloned().collect())
    }

    async fn save_state_snapshot(&self, state_json: &str) -> FleetResult<()> {
        let mut inner = self.inner.lock().expect("metric ring poisoned");
        inner.state_snapshot = Some(state_json.to_string());
        Ok(())
    }

    async fn load_state_snapshot(&self) -> FleetResult<Option<String>> {
        let inner = self.inner.lock().expect("metric ring poisoned");
        Ok(inner.state_snapshot.clone())
    }

    async fn info(&self) -> StorageInfo {
        let inner = self.inner.lock().expect("metric ring poisoned");
        StorageInfo {
            unsynced_count: inner.metrics.len() as u64,
            bytes_used: inner.bytes_used,
            degraded: false,
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let ring = MemoryRing::new(3);
        for i in 0..5 {
            ring.store_metric(&Metric::new(format!("m{}", i), i as f64))
                .await
                .unwrap();
        }
        let unsynced = ring.unsynced_metrics(10).await.unwrap();
        assert_eq!(unsynced.len(), 3);
        assert_eq!(unsynced[0].metric.name, "m2");
        assert_eq!(unsynced[2].metric.name, "m4");
    }

    #[tokio::test]
    async fn mark_synced_removes_entries() {
        let ring = MemoryRing::new(10);
        for i in 0..4 {
            ring.store_metric(&Metric::new(format!("m{}", i), 0.0)).await.unwrap();
        }
        let batch = ring.unsynced_metrics(2).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|s| s.id).collect();
        ring.mark_synced(&ids).await.unwrap();

        let remaining = ring.unsynced_metrics(10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        // Synced metrics never reappear
        assert!(remaining.iter().all(|s| !ids.contains(&s.id)));
    }

    #[tokio::test]
    async fn unsynced_metrics_reappear_until_synced() {
        let ring = MemoryRing::new(10);
        ring.store_metric(&Metric::new("m", 1.0)).await.unwrap();
        let first = ring.unsynced_metrics(10).await.unwrap();
        let second = ring.unsynced_metrics(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
    }
}
