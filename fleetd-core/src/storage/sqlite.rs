use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{MetricStorage, StorageInfo, StoredMetric};
use crate::error::{FleetError, FleetResult};
use crate::types::{Metric, UpdateRecord};

/// Embedded store for Constrained/Full devices. Single writer, WAL mode,
/// bounded by row count and byte cap with oldest-first eviction.
///
/// Writes that fail to persist degrade to an in-memory overflow buffer and
/// raise the `degraded` flag; the agent stays up and reports unhealthy.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    max_retained: i64,
    cap_bytes: u64,
    degraded: AtomicBool,
    overflow: Mutex<Overflow>,
}

struct Overflow {
    next_id: i64,
    metrics: VecDeque<StoredMetric>,
}

impl SqliteStore {
    pub async fn open(db_path: &Path, max_retained: usize, cap_bytes: u64) -> FleetResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Ensure the database file exists by touching it
        if !db_path.exists() {
            tokio::fs::write(db_path, "").await?;
        }

        let db_url = format!("sqlite:{}", db_path.display());
        tracing::debug!("Opening embedded store at {}", db_url);
        let pool = SqlitePool::connect(&db_url).await?;

        // Single-writer WAL mode so metric inserts survive power loss
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL;").execute(&pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics_buffer (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                payload TEXT NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS agent_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS update_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_metrics_sent ON metrics_buffer (sent, id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            max_retained: max_retained.max(1) as i64,
            cap_bytes,
            degraded: AtomicBool::new(false),
            overflow: Mutex::new(Overflow { next_id: -1, metrics: VecDeque::new() }),
        })
    }

    fn push_overflow(&self, metric: &Metric) {
        let mut overflow = self.overflow.lock().expect("overflow buffer poisoned");
        let id = overflow.next_id;
        overflow.next_id -= 1;
        overflow.metrics.push_back(StoredMetric { id, metric: metric.clone() });
        let cap = self.max_retained as usize;
        while overflow.metrics.len() > cap {
            overflow.metrics.pop_front();
        }
        self.degraded.store(true, Ordering::SeqCst);
    }

    async fn persist(&self, metric: &Metric) -> FleetResult<()> {
        let payload = serde_json::to_string(metric)?;
        sqlx::query("INSERT INTO metrics_buffer (timestamp, payload, sent) VALUES (?, ?, 0)")
            .bind(metric.timestamp_ns)
            .bind(payload)
            .execute(&self.pool)
            .await?;

        // Retention: keep the newest max_retained rows
        sqlx::query(
            "DELETE FROM metrics_buffer WHERE id NOT IN \
             (SELECT id FROM metrics_buffer ORDER BY id DESC LIMIT ?)",
        )
        .bind(self.max_retained)
        .execute(&self.pool)
        .await?;

        // Byte-cap eviction, oldest first
        if self.cap_bytes > 0 {
            let bytes: Option<i64> =
                sqlx::query_scalar("SELECT SUM(LENGTH(payload)) FROM metrics_buffer")
                    .fetch_one(&self.pool)
                    .await?;
            if bytes.unwrap_or(0) as u64 > self.cap_bytes {
                sqlx::query(
                    "DELETE FROM metrics_buffer WHERE id IN \
                     (SELECT id FROM metrics_buffer ORDER BY id ASC LIMIT \
                      (SELECT COUNT(*) / 10 + 1 FROM metrics_buffer))",
                )
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetricStorage for SqliteStore {
    async fn store_metric(&self, metric: &Metric) -> FleetResult<()> {
        match self.persist(metric).await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Metric persist failed, degrading to memory buffer: {}", err);
                self.push_overflow(metric);
                Ok(())
            }
        }
    }

    async fn unsynced_metrics(&self, limit: usize) -> FleetResult<Vec<StoredMetric>> {
        let mut batch: Vec<StoredMetric> = {
            let overflow = self.overflow.lock().expect("overflow buffer poisoned");
            overflow.metrics.iter().take(limit).cloned().collect()
        };

        if batch.len() < limit {
            let remaining = (limit - batch.len()) as i64;
            let rows = sqlx::query_as::<_, (i64, String)>(
                "SELECT id, payload FROM metrics_buffer WHERE sent = 0 ORDER BY id ASC LIMIT ?",
            )
            .bind(remaining)
            .fetch_all(&self.pool)
            .await?;

            for (id, payload) in rows {
                match serde_json::from_str::<Metric>(&payload) {
                    Ok(metric) => batch.push(StoredMetric { id, metric }),
                    Err(err) => {
                        tracing::warn!("Dropping undecodable metric row {}: {}", id, err);
                        sqlx::query("UPDATE metrics_buffer SET sent = 1 WHERE id = ?")
                            .bind(id)
                            .execute(&self.pool)
                            .await?;
                    }
                }
            }
        }
        Ok(batch)
    }

    async fn mark_synced(&self, ids: &[i64]) -> FleetResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        // Negative ids live in the overflow buffer
        {
            let mut overflow = self.overflow.lock().expect("overflow buffer poisoned");
            overflow.metrics.retain(|stored| !ids.contains(&stored.id));
            if overflow.metrics.is_empty() {
                self.degraded.store(false, Ordering::SeqCst);
            }
        }

        let db_ids: Vec<i64> = ids.iter().copied().filter(|id| *id > 0).collect();
        if db_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; db_ids.len()].join(", ");
        let sql = format!("UPDATE metrics_buffer SET sent = 1 WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in &db_ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn record_update(&self, record: &UpdateRecord) -> FleetResult<()> {
        sqlx::query(
            "INSERT INTO update_history (version, updated_at, success, error) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.version)
        .bind(record.updated_at.to_rfc3339())
        .bind(record.success as i64)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_history(&self, limit: usize) -> FleetResult<Vec<UpdateRecord>> {
        let rows = sqlx::query_as::<_, (String, String, i64, Option<String>)>(
            "SELECT version, updated_at, success, error FROM update_history \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (version, updated_at, success, error) in rows {
            let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| FleetError::Storage(format!("bad update_history timestamp: {}", e)))?
                .with_timezone(&Utc);
            records.push(UpdateRecord { version, updated_at, success: success != 0, error });
        }
        Ok(records)
    }

    async fn save_state_snapshot(&self, state_json: &str) -> FleetResult<()> {
        sqlx::query(
            "INSERT INTO agent_state (id, payload, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, \
             updated_at = excluded.updated_at",
        )
        .bind(state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state_snapshot(&self) -> FleetResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM agent_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(payload,)| payload))
    }

    async fn info(&self) -> StorageInfo {
        let overflow_count = {
            let overflow = self.overflow.lock().expect("overflow buffer poisoned");
            overflow.metrics.len() as u64
        };

        let db_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM metrics_buffer WHERE sent = 0")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);
        let bytes: Option<i64> =
            sqlx::query_scalar("SELECT SUM(LENGTH(payload)) FROM metrics_buffer")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(None);

        StorageInfo {
            unsynced_count: overflow_count + db_count as u64,
            bytes_used: bytes.unwrap_or(0) as u64,
            degraded: self.degraded.load(Ordering::SeqCst),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
