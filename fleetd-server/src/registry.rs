use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::store::{DeviceRecord, ServerStore};
use fleetd_core::types::{Metric, RegisterRequest, RegisterResponse, StatusReport};

const API_KEY_LEN: usize = 48;

/// Authentication failure modes, mapped to HTTP statuses at the API layer.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    UnknownDevice,
    InvalidKey,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::UnknownDevice => write!(f, "unknown device"),
            AuthError::InvalidKey => write!(f, "invalid api key"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Device registration, liveness, and API-key verification.
///
/// Registration is idempotent on `(type, hardware_id)` when a hardware id
/// is supplied: the device keeps its `device_id` and only the api key
/// rotates. Keys are stored as SHA-256 hex; plaintext leaves the process
/// exactly once, in the registration response.
pub struct DeviceRegistry {
    store: ServerStore,
}

impl DeviceRegistry {
    pub fn new(store: ServerStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let api_key = generate_api_key();
        let api_key_hash = hash_key(&api_key);

        if let Some(hardware_id) = &request.hardware_id {
            if let Some(existing) =
                self.store.find_by_hardware(&request.device_type, hardware_id).await?
            {
                // Same stable identity: keep the device_id, rotate the key
                self.store
                    .update_device_registration(
                        &existing.device_id,
                        &api_key_hash,
                        &request.version,
                        request.agent_url.as_deref(),
                        &request.system_info,
                    )
                    .await?;
                info!("Re-registered device {} (hardware {})", existing.device_id, hardware_id);
                return Ok(RegisterResponse { device_id: existing.device_id, api_key });
            }
        }

        let device_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.store
            .insert_device(&DeviceRecord {
                device_id: device_id.clone(),
                name: request.name.clone(),
                device_type: request.device_type.clone(),
                version: request.version.clone(),
                hardware_id: request.hardware_id.clone(),
                api_key_hash,
                status: "online".to_string(),
                agent_url: request.agent_url.clone(),
                first_seen: now,
                last_seen: now,
                system_info: request.system_info.clone(),
            })
            .await
            .context("persisting new device failed")?;
        info!("Registered new device {} ({})", device_id, request.device_type);
        Ok(RegisterResponse { device_id, api_key })
    }

    /// Verify the bearer key for a device. The stored hash is compared to
    /// the SHA-256 of the presented key.
    pub async fn authenticate(
        &self,
        device_id: &str,
        bearer_key: &str,
    ) -> Result<DeviceRecord, AuthError> {
        let device = match self.store.get_device(device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => return Err(AuthError::UnknownDevice),
            Err(err) => {
                debug!("Device lookup for auth failed: {:#}", err);
                return Err(AuthError::UnknownDevice);
            }
        };
        if device.api_key_hash != hash_key(bearer_key) {
            return Err(AuthError::InvalidKey);
        }
        Ok(device)
    }

    /// Update liveness for a heartbeat. Returns false when the device is
    /// unknown (the caller answers 404).
    pub async fn heartbeat(&self, device_id: &str) -> Result<bool> {
        self.store.touch_last_seen(device_id).await
    }

    pub async fn report_status(&self, device_id: &str, report: &StatusReport) -> Result<()> {
        debug!("Device {} status: {}", device_id, report.status);
        let metrics: Vec<Metric> = report
            .metrics
            .iter()
            .map(|(name, value)| Metric::new(format!("status.{}", name), *value))
            .collect();
        if !metrics.is_empty() {
            self.store.record_metrics(device_id, &metrics).await?;
        }
        self.store.touch_last_seen(device_id).await?;
        Ok(())
    }

    pub async fn record_metrics(&self, device_id: &str, metrics: &[Metric]) -> Result<()> {
        self.store.record_metrics(device_id, metrics).await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        self.store.get_device(device_id).await
    }

    pub async fn list_devices(
        &self,
        type_filter: Option<&str>,
        status_filter: Option<&str>,
    ) -> Result<Vec<DeviceRecord>> {
        self.store.list_devices(type_filter, status_filter).await
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<bool> {
        self.store.delete_device(device_id).await
    }

    /// Flip devices offline when their last heartbeat is older than
    /// `offline_after`.
    pub async fn sweep_offline(&self, offline_after: std::time::Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(offline_after).unwrap_or(chrono::Duration::seconds(120));
        self.store.mark_offline_older_than(cutoff).await
    }
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::types::SystemInfo;

    async fn registry_fixture() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ServerStore::open(dir.path().join("fleet.db").to_str().unwrap()).await.unwrap();
        (dir, DeviceRegistry::new(store))
    }

    fn request(hardware_id: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            name: "edge-01".to_string(),
            device_type: "sensor".to_string(),
            version: "0.3.0".to_string(),
            hardware_id: hardware_id.map(str::to_string),
            system_info: SystemInfo::default(),
            agent_url: Some("http://10.0.0.5:8088".to_string()),
        }
    }

    #[tokio::test]
    async fn register_and_authenticate() {
        let (_dir, registry) = registry_fixture().await;
        let response = registry.register(&request(None)).await.unwrap();
        assert_eq!(response.api_key.len(), API_KEY_LEN);

        let device =
            registry.authenticate(&response.device_id, &response.api_key).await.unwrap();
        assert_eq!(device.name, "edge-01");

        assert_eq!(
            registry.authenticate(&response.device_id, "wrong-key").await.unwrap_err(),
            AuthError::InvalidKey
        );
        assert_eq!(
            registry.authenticate("ghost", &response.api_key).await.unwrap_err(),
            AuthError::UnknownDevice
        );
    }

    #[tokio::test]
    async fn reregistration_is_idempotent_on_hardware_id() {
        let (_dir, registry) = registry_fixture().await;
        let first = registry.register(&request(Some("hw-42"))).await.unwrap();
        let second = registry.register(&request(Some("hw-42"))).await.unwrap();

        // Same stable identity, rotated credential
        assert_eq!(first.device_id, second.device_id);
        assert_ne!(first.api_key, second.api_key);

        // Only the new key authenticates
        assert!(registry.authenticate(&second.device_id, &second.api_key).await.is_ok());
        assert_eq!(
            registry.authenticate(&first.device_id, &first.api_key).await.unwrap_err(),
            AuthError::InvalidKey
        );
    }

    #[tokio::test]
    async fn registration_without_hardware_id_mints_fresh_identities() {
        let (_dir, registry) = registry_fixture().await;
        let first = registry.register(&request(None)).await.unwrap();
        let second = registry.register(&request(None)).await.unwrap();
        assert_ne!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn heartbeat_unknown_device_reports_missing() {
        let (_dir, registry) = registry_fixture().await;
        assert!(!registry.heartbeat("nope").await.unwrap());

        let response = registry.register(&request(None)).await.unwrap();
        assert!(registry.heartbeat(&response.device_id).await.unwrap());
    }
}
