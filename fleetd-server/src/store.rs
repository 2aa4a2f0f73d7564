use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use crate::campaign::{CampaignStatus, DeviceUpdateState, DeviceUpdateStatus};
use fleetd_core::types::{Metric, SystemInfo, Update};

/// A registered device as the control plane sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub device_type: String,
    pub version: String,
    pub hardware_id: Option<String>,
    pub api_key_hash: String,
    pub status: String,
    pub agent_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRow {
    pub id: String,
    pub update: Update,
    pub status: CampaignStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// SQLite persistence for the control plane: devices, campaigns, and
/// uploaded metrics. Campaign device transitions are written through
/// before workers advance, so a restarted orchestrator can resume.
#[derive(Clone)]
pub struct ServerStore {
    pool: Pool<Sqlite>,
}

impl ServerStore {
    pub async fn open(db_path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(db_path).to_string();
        if let Some(parent) = Path::new(&expanded).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !Path::new(&expanded).exists() {
            tokio::fs::write(&expanded, "").await?;
        }

        let db_url = format!("sqlite:{}", expanded);
        tracing::debug!("Opening server store at {}", db_url);
        let pool = SqlitePool::connect(&db_url).await?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                device_type TEXT NOT NULL,
                version TEXT NOT NULL,
                hardware_id TEXT,
                api_key_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                agent_url TEXT,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                system_info TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                update_json TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS campaign_devices (
                campaign_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_check_in TEXT,
                PRIMARY KEY (campaign_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS device_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                labels TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_hardware
                ON devices (device_type, hardware_id)
                WHERE hardware_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_metrics_device ON device_metrics (device_id, timestamp);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    // --- devices ---

    pub async fn insert_device(&self, device: &DeviceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_id, name, device_type, version, hardware_id, \
             api_key_hash, status, agent_url, first_seen, last_seen, system_info) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&device.device_id)
        .bind(&device.name)
        .bind(&device.device_type)
        .bind(&device.version)
        .bind(&device.hardware_id)
        .bind(&device.api_key_hash)
        .bind(&device.status)
        .bind(&device.agent_url)
        .bind(device.first_seen.to_rfc3339())
        .bind(device.last_seen.to_rfc3339())
        .bind(serde_json::to_string(&device.system_info)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, name, device_type, version, hardware_id, api_key_hash, \
             status, agent_url, first_seen, last_seen, system_info \
             FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeviceRow::into_record).transpose()
    }

    pub async fn find_by_hardware(
        &self,
        device_type: &str,
        hardware_id: &str,
    ) -> Result<Option<DeviceRecord>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, name, device_type, version, hardware_id, api_key_hash, \
             status, agent_url, first_seen, last_seen, system_info \
             FROM devices WHERE device_type = ? AND hardware_id = ?",
        )
        .bind(device_type)
        .bind(hardware_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeviceRow::into_record).transpose()
    }

    pub async fn list_devices(
        &self,
        type_filter: Option<&str>,
        status_filter: Option<&str>,
    ) -> Result<Vec<DeviceRecord>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, name, device_type, version, hardware_id, api_key_hash, \
             status, agent_url, first_seen, last_seen, system_info \
             FROM devices \
             WHERE (? IS NULL OR device_type = ?) AND (? IS NULL OR status = ?) \
             ORDER BY first_seen ASC",
        )
        .bind(type_filter)
        .bind(type_filter)
        .bind(status_filter)
        .bind(status_filter)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeviceRow::into_record).collect()
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_device_registration(
        &self,
        device_id: &str,
        api_key_hash: &str,
        version: &str,
        agent_url: Option<&str>,
        system_info: &SystemInfo,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET api_key_hash = ?, version = ?, agent_url = ?, \
             system_info = ?, status = 'online', last_seen = ? WHERE device_id = ?",
        )
        .bind(api_key_hash)
        .bind(version)
        .bind(agent_url)
        .bind(serde_json::to_string(system_info)?)
        .bind(Utc::now().to_rfc3339())
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh last_seen and flip the device online. Returns false for an
    /// unknown device.
    pub async fn touch_last_seen(&self, device_id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE devices SET last_seen = ?, status = 'online' WHERE device_id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(device_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Devices silent since `cutoff` go offline. Returns how many flipped.
    pub async fn mark_offline_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE devices SET status = 'offline' WHERE status = 'online' AND last_seen < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_metrics(&self, device_id: &str, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            sqlx::query(
                "INSERT INTO device_metrics (device_id, name, value, timestamp, labels) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(device_id)
            .bind(&metric.name)
            .bind(metric.value)
            .bind(metric.timestamp_ns)
            .bind(serde_json::to_string(&metric.labels)?)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn metrics_count(&self, device_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM device_metrics WHERE device_id = ?")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    // --- campaigns ---

    pub async fn save_campaign(&self, campaign: &CampaignRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaigns (id, update_json, status, started_at, completed_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, \
             completed_at = excluded.completed_at",
        )
        .bind(&campaign.id)
        .bind(serde_json::to_string(&campaign.update)?)
        .bind(campaign.status.to_string())
        .bind(campaign.started_at.to_rfc3339())
        .bind(campaign.completed_at.map(|at| at.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_device_state(
        &self,
        campaign_id: &str,
        state: &DeviceUpdateState,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_devices (campaign_id, device_id, status, progress, \
             started_at, completed_at, error, retry_count, last_check_in) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(campaign_id, device_id) DO UPDATE SET \
             status = excluded.status, progress = excluded.progress, \
             started_at = excluded.started_at, completed_at = excluded.completed_at, \
             error = excluded.error, retry_count = excluded.retry_count, \
             last_check_in = excluded.last_check_in",
        )
        .bind(campaign_id)
        .bind(&state.device_id)
        .bind(state.status.to_string())
        .bind(state.progress as i64)
        .bind(state.started_at.map(|at| at.to_rfc3339()))
        .bind(state.completed_at.map(|at| at.to_rfc3339()))
        .bind(&state.error)
        .bind(state.retry_count as i64)
        .bind(state.last_check_in.map(|at| at.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_campaign(&self, id: &str) -> Result<Option<CampaignRow>> {
        let row = sqlx::query_as::<_, (String, String, String, String, Option<String>)>(
            "SELECT id, update_json, status, started_at, completed_at FROM campaigns WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(campaign_from_row).transpose()
    }

    /// Campaigns that were not terminal when the process last stopped.
    pub async fn load_active_campaigns(&self) -> Result<Vec<CampaignRow>> {
        let rows = sqlx::query_as::<_, (String, String, String, String, Option<String>)>(
            "SELECT id, update_json, status, started_at, completed_at FROM campaigns \
             WHERE status IN ('running', 'paused')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(campaign_from_row).collect()
    }

    pub async fn load_device_states(&self, campaign_id: &str) -> Result<Vec<DeviceUpdateState>> {
        let rows = sqlx::query_as::<
            _,
            (String, String, i64, Option<String>, Option<String>, Option<String>, i64, Option<String>),
        >(
            "SELECT device_id, status, progress, started_at, completed_at, error, \
             retry_count, last_check_in FROM campaign_devices WHERE campaign_id = ? \
             ORDER BY device_id ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(device_id, status, progress, started_at, completed_at, error, retry_count, last_check_in)| {
                Ok(DeviceUpdateState {
                    device_id,
                    status: status.parse::<DeviceUpdateStatus>()?,
                    progress: progress as u8,
                    started_at: parse_opt_ts(started_at)?,
                    completed_at: parse_opt_ts(completed_at)?,
                    error,
                    retry_count: retry_count as u32,
                    last_check_in: parse_opt_ts(last_check_in)?,
                })
            })
            .collect()
    }
}

fn campaign_from_row(
    (id, update_json, status, started_at, completed_at): (
        String,
        String,
        String,
        String,
        Option<String>,
    ),
) -> Result<CampaignRow> {
    Ok(CampaignRow {
        id,
        update: serde_json::from_str(&update_json)?,
        status: status.parse::<CampaignStatus>()?,
        started_at: parse_ts(&started_at)?,
        completed_at: parse_opt_ts(completed_at)?,
    })
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .context("invalid stored timestamp")?
        .with_timezone(&Utc))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

type DeviceRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
);

trait IntoRecord {
    fn into_record(self) -> Result<DeviceRecord>;
}

impl IntoRecord for DeviceRow {
    fn into_record(self) -> Result<DeviceRecord> {
        let (
            device_id,
            name,
            device_type,
            version,
            hardware_id,
            api_key_hash,
            status,
            agent_url,
            first_seen,
            last_seen,
            system_info,
        ) = self;
        Ok(DeviceRecord {
            device_id,
            name,
            device_type,
            version,
            hardware_id,
            api_key_hash,
            status,
            agent_url,
            first_seen: parse_ts(&first_seen)?,
            last_seen: parse_ts(&last_seen)?,
            system_info: serde_json::from_str(&system_info)?,
        })
    }
}
