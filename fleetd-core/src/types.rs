use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Stable identity of a device. Created once at registration; only the
/// `api_key` may rotate afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub api_key: String,
    pub architecture: String,
    pub os: String,
    /// Optional device-supplied stable hardware id, used for idempotent
    /// registration on the control plane.
    pub hardware_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A single telemetry sample. Timestamps are unix nanoseconds so ordering
/// survives serialization round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub timestamp_ns: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp_ns: Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_else(|| Utc::now().timestamp_millis() * 1_000_000),
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryStatus {
    Deployed,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for BinaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryStatus::Deployed => write!(f, "deployed"),
            BinaryStatus::Running => write!(f, "running"),
            BinaryStatus::Stopped => write!(f, "stopped"),
            BinaryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A binary deployed to the device and managed by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryInfo {
    pub name: String,
    pub version: String,
    pub status: BinaryStatus,
    pub deployed_at: DateTime<Utc>,
    pub last_started: Option<DateTime<Utc>>,
}

/// One entry of the device's update history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Archive payload extracted to a scratch dir, optionally self-installed
    /// by an embedded update.sh
    Application,
    /// Single executable swapped atomically
    Binary,
    Firmware,
    Config,
    /// Agent self-update; handled as an atomic binary swap plus service restart
    System,
}

/// An update manifest sent by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub id: String,
    pub version: String,
    pub kind: UpdateKind,
    #[serde(default)]
    pub priority: u32,
    pub url: String,
    /// Expected payload size in bytes; zero means unknown. The checksum,
    /// not the size, is authoritative.
    #[serde(default)]
    pub size: u64,
    /// Lowercase hex SHA-256 of the payload
    pub checksum: String,
    /// Detached signature tag, verified when a signature key is configured
    pub signature: Option<String>,
    #[serde(default)]
    pub manifest: serde_json::Value,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    #[serde(default)]
    pub rollback_enabled: bool,
}

/// Manifest of a restorable snapshot captured before an update applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    /// Absolute paths captured in this backup
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Where each captured path is stored under the backup directory
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub source: PathBuf,
    /// Path relative to the backup directory
    pub stored: PathBuf,
    pub kind: BackupEntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupEntryKind {
    /// Stored as a plain copy
    File,
    /// Stored as a tar.gz archive of the directory tree
    Archive,
}

/// Point-in-time system description reported at registration and in
/// device info responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub cpu_cores: usize,
}

/// Live resource usage snapshot for device info responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub uptime_secs: u64,
}

// --- Control-plane protocol types (shared by agent client and server) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub version: String,
    pub hardware_id: Option<String>,
    pub system_info: SystemInfo,
    /// Address of the agent's local RPC server, used by the campaign
    /// orchestrator to reach the device.
    pub agent_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub device_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub has_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsUpload {
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_roundtrip_preserves_ns_and_labels() {
        let metric = Metric::new("cpu_percent", 42.5)
            .with_label("host", "edge-01")
            .with_label("core", "3");
        let encoded = serde_json::to_string(&metric).unwrap();
        let decoded: Metric = serde_json::from_str(&encoded).unwrap();
        assert_eq!(metric, decoded);
        assert_eq!(decoded.labels.len(), 2);
    }

    #[test]
    fn update_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&UpdateKind::Application).unwrap(),
            "\"application\""
        );
        assert_eq!(serde_json::to_string(&UpdateKind::System).unwrap(), "\"system\"");
        let kind: UpdateKind = serde_json::from_str("\"firmware\"").unwrap();
        assert_eq!(kind, UpdateKind::Firmware);
    }

    #[test]
    fn update_defaults_tolerate_sparse_manifests() {
        let update: Update = serde_json::from_str(
            r#"{
                "id": "u-1",
                "version": "1.2.0",
                "kind": "binary",
                "url": "http://example/u-1",
                "checksum": "ab"
            }"#,
        )
        .unwrap();
        assert_eq!(update.size, 0);
        assert!(!update.rollback_enabled);
        assert!(update.signature.is_none());
    }
}
