use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::capability::Capability;
use crate::error::FleetResult;
use crate::types::{Metric, UpdateRecord};

mod memory;
mod sqlite;

pub use memory::MemoryRing;
pub use sqlite::SqliteStore;

/// A buffered metric with its storage-assigned id. Ids are only meaningful
/// to the store that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMetric {
    pub id: i64,
    pub metric: Metric,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    pub unsynced_count: u64,
    pub bytes_used: u64,
    /// True when the persistent store failed and writes fell back to an
    /// in-memory buffer. The agent reports unhealthy but keeps running.
    pub degraded: bool,
}

/// Tiered durable buffer for metrics plus agent metadata.
///
/// Two variants implement this: an in-memory ring for Minimal devices and
/// an embedded SQLite store for Constrained/Full devices.
#[async_trait]
pub trait MetricStorage: Send + Sync {
    async fn store_metric(&self, metric: &Metric) -> FleetResult<()>;

    /// Oldest-first batch of metrics not yet acknowledged by a sink.
    async fn unsynced_metrics(&self, limit: usize) -> FleetResult<Vec<StoredMetric>>;

    /// Metrics marked synced never reappear in `unsynced_metrics`.
    async fn mark_synced(&self, ids: &[i64]) -> FleetResult<()>;

    async fn record_update(&self, record: &UpdateRecord) -> FleetResult<()>;

    async fn update_history(&self, limit: usize) -> FleetResult<Vec<UpdateRecord>>;

    /// Mirror of the agent state document, kept for post-mortem inspection.
    async fn save_state_snapshot(&self, state_json: &str) -> FleetResult<()>;

    async fn load_state_snapshot(&self) -> FleetResult<Option<String>>;

    async fn info(&self) -> StorageInfo;

    async fn close(&self);
}

/// Open the storage variant the capability tier calls for.
pub async fn open(capability: &Capability, data_dir: &Path) -> FleetResult<Arc<dyn MetricStorage>> {
    if capability.has_embedded_store {
        let db_path = data_dir.join("fleet.db");
        let store = SqliteStore::open(
            &db_path,
            capability.max_metrics_in_memory,
            capability.local_storage_cap_bytes,
        )
        .await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(MemoryRing::new(capability.max_metrics_in_memory)))
    }
}
