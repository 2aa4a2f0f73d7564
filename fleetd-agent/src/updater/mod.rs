use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{error, info, warn};

use crate::service::ServiceManager;
use fleetd_core::config::UpdaterConfig;
use fleetd_core::error::{FleetError, FleetResult};
use fleetd_core::state::StateManager;
use fleetd_core::storage::MetricStorage;
use fleetd_core::types::{BackupManifest, Update, UpdateKind, UpdateRecord};

mod apply;
pub mod backup;

pub use apply::{extract_archive, run_script};

type HmacSha256 = Hmac<Sha256>;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-update state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Downloading,
    Verifying,
    Preparing,
    Applying,
    HealthCheck,
    RollingBack,
    Completed,
    RolledBack,
    Failed,
}

impl UpdatePhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UpdatePhase::Downloading
                | UpdatePhase::Verifying
                | UpdatePhase::Preparing
                | UpdatePhase::Applying
                | UpdatePhase::HealthCheck
                | UpdatePhase::RollingBack
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    pub update_id: Option<String>,
    pub version: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self { phase: UpdatePhase::Idle, update_id: None, version: None, progress: 0, error: None }
    }
}

/// Configuration collaborator for config-type updates and the
/// UpdateConfig RPC.
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    async fn apply(&self, patch: serde_json::Value) -> anyhow::Result<()>;
}

/// Download → verify → backup → apply → health-probe → commit-or-rollback.
///
/// At most one update is in flight; concurrent attempts fail fast with
/// `Busy`. The checksum, not the declared size, is authoritative.
pub struct Updater {
    config: UpdaterConfig,
    data_dir: PathBuf,
    arch: String,
    state: Arc<StateManager>,
    storage: Arc<dyn MetricStorage>,
    service: Arc<dyn ServiceManager>,
    config_applier: Arc<dyn ConfigApplier>,
    http: reqwest::Client,
    status: Arc<RwLock<UpdateStatus>>,
    busy: Mutex<()>,
}

impl Updater {
    pub fn new(
        config: UpdaterConfig,
        data_dir: PathBuf,
        arch: String,
        state: Arc<StateManager>,
        storage: Arc<dyn MetricStorage>,
        service: Arc<dyn ServiceManager>,
        config_applier: Arc<dyn ConfigApplier>,
    ) -> Self {
        Self {
            config,
            data_dir,
            arch,
            state,
            storage,
            service,
            config_applier,
            http: reqwest::Client::new(),
            status: Arc::new(RwLock::new(UpdateStatus::default())),
            busy: Mutex::new(()),
        }
    }

    pub async fn status(&self) -> UpdateStatus {
        self.status.read().await.clone()
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    fn staging_dir(&self, update_id: &str) -> PathBuf {
        self.data_dir.join("updates").join(update_id)
    }

    async fn set_status(&self, phase: UpdatePhase, progress: u8, error: Option<String>) {
        let mut status = self.status.write().await;
        status.phase = phase;
        status.progress = progress;
        status.error = error;
    }

    /// Run the full update pipeline. Returns the terminal phase reached
    /// (`Completed` or `RolledBack`); every error path records a failed
    /// update in the history.
    pub async fn apply_update(
        &self,
        update: Update,
        cancel: watch::Receiver<bool>,
    ) -> FleetResult<UpdatePhase> {
        let _guard = self.busy.try_lock().map_err(|_| FleetError::Busy)?;

        {
            let mut status = self.status.write().await;
            *status = UpdateStatus {
                phase: UpdatePhase::Downloading,
                update_id: Some(update.id.clone()),
                version: Some(update.version.clone()),
                progress: 0,
                error: None,
            };
        }
        info!("Starting update {} to version {}", update.id, update.version);

        let result = self.run(&update, &cancel).await;
        let staging = self.staging_dir(&update.id);
        let _ = tokio::fs::remove_dir_all(&staging).await;

        let (phase, error) = match &result {
            Ok(phase) => (*phase, None),
            Err(err) => (UpdatePhase::Failed, Some(err.to_string())),
        };
        self.set_status(phase, 100, error.clone()).await;

        let record = UpdateRecord {
            version: update.version.clone(),
            updated_at: Utc::now(),
            success: phase == UpdatePhase::Completed,
            error,
        };
        if let Err(err) = self
            .state
            .update_and_save(|state| state.push_update_record(record.clone()))
            .await
        {
            warn!("Recording update outcome in state failed: {:#}", err);
        }
        if let Err(err) = self.storage.record_update(&record).await {
            warn!("Recording update outcome in store failed: {}", err);
        }

        match &result {
            Ok(phase) => info!("Update {} finished: {:?}", update.id, phase),
            Err(err) => error!("Update {} failed: {}", update.id, err),
        }
        result
    }

    async fn run(
        &self,
        update: &Update,
        cancel: &watch::Receiver<bool>,
    ) -> FleetResult<UpdatePhase> {
        let staging = self.staging_dir(&update.id);
        tokio::fs::create_dir_all(&staging).await?;
        let payload = staging.join("payload");

        // Download
        self.set_status(UpdatePhase::Downloading, 10, None).await;
        if let Err(err) = self.download(update, &payload).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(err);
        }
        self.bail_if_cancelled(cancel, None, update).await?;

        // Verify: checksum always, signature when a key is configured
        self.set_status(UpdatePhase::Verifying, 30, None).await;
        self.verify(update, &payload).await?;
        self.bail_if_cancelled(cancel, None, update).await?;

        // Prepare: backup + pre-script
        self.set_status(UpdatePhase::Preparing, 45, None).await;
        let backup_manifest = if update.rollback_enabled {
            let backup_id = format!("backup_{}_{}", update.version, Utc::now().timestamp());
            let paths: Vec<PathBuf> =
                self.config.critical_paths.iter().map(PathBuf::from).collect();
            let manifest = backup::create_backup(&self.backups_dir(), &backup_id, &update.version, &paths)
                .await
                .map_err(|e| FleetError::Apply(format!("backup failed: {:#}", e)))?;
            if let Err(err) =
                backup::enforce_retention(&self.backups_dir(), self.config.max_backups.max(1)).await
            {
                warn!("Backup retention sweep failed: {:#}", err);
            }
            Some(manifest)
        } else {
            None
        };

        if let Some(script) = &update.pre_script {
            let env = script_env(update);
            if let Err(err) =
                apply::run_script(script, &env, Duration::from_secs(self.config.script_timeout_secs))
                    .await
            {
                let apply_err = FleetError::Apply(format!("pre-script failed: {:#}", err));
                return self.rollback_or_fail(update, backup_manifest.as_ref(), apply_err).await;
            }
        }
        self.bail_if_cancelled(cancel, backup_manifest.as_ref(), update).await?;

        // Apply
        self.set_status(UpdatePhase::Applying, 60, None).await;
        if let Err(err) = self.apply_by_kind(update, &payload, &staging).await {
            return self.rollback_or_fail(update, backup_manifest.as_ref(), err).await;
        }
        self.bail_if_cancelled(cancel, backup_manifest.as_ref(), update).await?;

        // Post-script is best-effort: failures are logged, never fatal
        if let Some(script) = &update.post_script {
            let env = script_env(update);
            if let Err(err) =
                apply::run_script(script, &env, Duration::from_secs(self.config.script_timeout_secs))
                    .await
            {
                warn!("Post-script for {} failed: {:#}", update.id, err);
            }
        }

        // Health gate: the update commits only after a healthy probe
        self.set_status(UpdatePhase::HealthCheck, 80, None).await;
        if let Err(err) = self.health_gate(update).await {
            return self.rollback_or_fail(update, backup_manifest.as_ref(), err).await;
        }

        self.set_status(UpdatePhase::Completed, 100, None).await;
        Ok(UpdatePhase::Completed)
    }

    async fn bail_if_cancelled(
        &self,
        cancel: &watch::Receiver<bool>,
        backup_manifest: Option<&BackupManifest>,
        update: &Update,
    ) -> FleetResult<()> {
        if !*cancel.borrow() {
            return Ok(());
        }
        warn!("Update {} cancelled", update.id);
        // Roll back only if apply may have begun, which is exactly when a
        // backup manifest is in hand past the apply transition
        if let Some(manifest) = backup_manifest {
            if self.status.read().await.phase == UpdatePhase::Applying {
                let _ = self.rollback(update, manifest).await;
            }
        }
        Err(FleetError::Cancelled)
    }

    async fn download(&self, update: &Update, payload: &Path) -> FleetResult<()> {
        let timeout = Duration::from_secs(self.config.download_timeout_secs);
        let response = self
            .http
            .get(&update.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FleetError::Network(format!("download request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(FleetError::Network(format!(
                "download returned {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(payload).await?;
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| FleetError::Network(format!("download interrupted: {}", e)))?;
            total += chunk.len() as u64;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        file.sync_all().await?;

        if update.size > 0 && total != update.size {
            return Err(FleetError::Verification(format!(
                "payload size {} does not match declared size {}",
                total, update.size
            )));
        }
        info!("Downloaded {} bytes for update {}", total, update.id);
        Ok(())
    }

    async fn verify(&self, update: &Update, payload: &Path) -> FleetResult<()> {
        let key = self.config.signature_key.clone();
        let (digest, tag) = hash_payload(payload.to_path_buf(), key.clone()).await?;

        let expected = update.checksum.to_lowercase();
        if digest != expected {
            return Err(FleetError::Verification(format!(
                "checksum mismatch: payload {} expected {}",
                digest, expected
            )));
        }

        if let Some(tag) = tag {
            let signature = update.signature.as_deref().ok_or_else(|| {
                FleetError::Verification(
                    "update carries no signature but a key is configured".to_string(),
                )
            })?;
            if !constant_time_eq(signature.trim().to_lowercase().as_bytes(), tag.as_bytes()) {
                return Err(FleetError::Verification("signature verification failed".to_string()));
            }
        }
        Ok(())
    }

    async fn apply_by_kind(
        &self,
        update: &Update,
        payload: &Path,
        staging: &Path,
    ) -> FleetResult<()> {
        let script_timeout = Duration::from_secs(self.config.script_timeout_secs);
        match update.kind {
            UpdateKind::Application => {
                let scratch = staging.join("extract");
                apply::apply_application(update, payload, &scratch, script_timeout).await
            }
            UpdateKind::Binary | UpdateKind::System => {
                let target = self.binary_target(update)?;
                apply::apply_binary(payload, &target).await?;
                // The running executable changed; let the service manager
                // schedule the restart
                if let Err(err) = self.service.restart().await {
                    warn!("Service restart request failed: {:#}", err);
                }
                Ok(())
            }
            UpdateKind::Firmware => {
                apply::apply_firmware(
                    update,
                    payload,
                    &self.arch,
                    &self.config.firmware_architectures,
                    script_timeout,
                )
                .await
            }
            UpdateKind::Config => {
                let patch = apply::parse_config_payload(payload).await?;
                self.config_applier
                    .apply(patch)
                    .await
                    .map_err(|e| FleetError::Apply(format!("config apply failed: {:#}", e)))
            }
        }
    }

    fn binary_target(&self, update: &Update) -> FleetResult<PathBuf> {
        if let Some(path) = update.manifest.get("install_path").and_then(|v| v.as_str()) {
            return Ok(PathBuf::from(path));
        }
        std::env::current_exe()
            .map_err(|e| FleetError::Apply(format!("cannot resolve current executable: {}", e)))
    }

    /// Poll the post-apply health probe until it reports healthy or the
    /// configured window elapses.
    async fn health_gate(&self, update: &Update) -> FleetResult<()> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.health_check_timeout_secs);
        let probe_url = update.manifest.get("health_url").and_then(|v| v.as_str());

        loop {
            let healthy = match probe_url {
                Some(url) => match self.http.get(url).timeout(Duration::from_secs(10)).send().await
                {
                    Ok(resp) => resp.status().is_success(),
                    Err(_) => false,
                },
                None => match self.service.status().await {
                    Ok(status) => status == "active" || status == "unmanaged",
                    Err(_) => false,
                },
            };
            if healthy {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FleetError::Apply("post-update health check never passed".to_string()));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn rollback_or_fail(
        &self,
        update: &Update,
        backup_manifest: Option<&BackupManifest>,
        cause: FleetError,
    ) -> FleetResult<UpdatePhase> {
        match backup_manifest {
            Some(manifest) if update.rollback_enabled => {
                warn!("Update {} failed ({}), rolling back", update.id, cause);
                self.rollback(update, manifest).await?;
                self.set_status(UpdatePhase::RolledBack, 100, Some(cause.to_string())).await;
                Ok(UpdatePhase::RolledBack)
            }
            _ => Err(cause),
        }
    }

    /// Stop services, restore every backed-up path, restart services.
    /// The backup itself is preserved for post-mortem until retention
    /// evicts it.
    async fn rollback(&self, update: &Update, manifest: &BackupManifest) -> FleetResult<()> {
        self.set_status(UpdatePhase::RollingBack, 90, None).await;
        if let Err(err) = self.service.stop().await {
            warn!("Stopping service for rollback failed: {:#}", err);
        }

        backup::restore_backup(&self.backups_dir(), manifest).await?;

        if let Err(err) = self.service.restart().await {
            warn!("Restarting service after rollback failed: {:#}", err);
        }
        self.state
            .update_and_save(|state| state.push_event("rolled_back"))
            .await
            .map_err(|e| FleetError::Rollback(format!("recording rollback failed: {:#}", e)))?;
        info!("Rolled back update {} using backup {}", update.id, manifest.id);
        Ok(())
    }
}

fn script_env(update: &Update) -> std::collections::HashMap<String, String> {
    let mut env = std::collections::HashMap::new();
    env.insert("VERSION".to_string(), update.version.clone());
    env.insert("UPDATE_ID".to_string(), update.id.clone());
    env
}

/// SHA-256 digest of the file, plus the HMAC-SHA256 tag when a key is
/// given. Both lowercase hex.
async fn hash_payload(
    path: PathBuf,
    key: Option<String>,
) -> FleetResult<(String, Option<String>)> {
    tokio::task::spawn_blocking(move || -> FleetResult<(String, Option<String>)> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut mac = match key {
            Some(key) => Some(
                HmacSha256::new_from_slice(key.as_bytes())
                    .map_err(|e| FleetError::Internal(format!("bad signature key: {}", e)))?,
            ),
            None => None,
        };

        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            if let Some(mac) = mac.as_mut() {
                mac.update(&buffer[..read]);
            }
        }

        let digest = hex::encode(hasher.finalize());
        let tag = mac.map(|mac| hex::encode(mac.finalize().into_bytes()));
        Ok((digest, tag))
    })
    .await
    .map_err(|e| FleetError::Internal(format!("hashing task panicked: {}", e)))?
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::NullServiceManager;
    use axum::Router;
    use axum::routing::get;
    use fleetd_core::storage::MemoryRing;

    struct NullConfigApplier;

    #[async_trait]
    impl ConfigApplier for NullConfigApplier {
        async fn apply(&self, _patch: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn serve_payload(bytes: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/payload",
            get(move || {
                let bytes = bytes.clone();
                async move { bytes }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/payload", addr)
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    async fn updater_fixture(
        dir: &tempfile::TempDir,
        config: UpdaterConfig,
    ) -> (Updater, Arc<StateManager>) {
        let data_dir = dir.path().join("data");
        tokio::fs::create_dir_all(&data_dir).await.unwrap();
        let state = Arc::new(StateManager::load(&data_dir).await.unwrap());
        let updater = Updater::new(
            config,
            data_dir,
            "x86_64".to_string(),
            state.clone(),
            Arc::new(MemoryRing::new(100)),
            Arc::new(NullServiceManager),
            Arc::new(NullConfigApplier),
        );
        (updater, state)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn binary_update_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("install").join("agent-bin");
        tokio::fs::create_dir_all(target.parent().unwrap()).await.unwrap();
        tokio::fs::write(&target, "old").await.unwrap();
        let config_file = dir.path().join("agent.toml");
        tokio::fs::write(&config_file, "old-config").await.unwrap();

        let payload = b"new-binary-content".to_vec();
        let url = serve_payload(payload.clone()).await;

        let mut config = UpdaterConfig::default();
        config.critical_paths =
            vec![target.display().to_string(), config_file.display().to_string()];
        let (updater, state) = updater_fixture(&dir, config).await;

        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-happy", "version": "2.0.0", "kind": "binary",
            "url": url, "size": payload.len(), "checksum": sha256_hex(&payload),
            "rollback_enabled": true,
            "manifest": { "install_path": target.to_string_lossy() }
        }))
        .unwrap();

        let phase = updater.apply_update(update, no_cancel()).await.unwrap();
        assert_eq!(phase, UpdatePhase::Completed);
        assert_eq!(tokio::fs::read_to_string(&target).await.unwrap(), "new-binary-content");

        // Backup retained; staging cleared; history records success
        let backups = backup::enforce_retention(&updater.backups_dir(), 100).await.unwrap();
        assert!(backups.is_empty());
        assert!(updater.backups_dir().read_dir().unwrap().next().is_some());
        assert!(!updater.staging_dir("u-happy").exists());
        let history = state.snapshot().await.update_history;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn checksum_mismatch_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("agent-bin");
        tokio::fs::write(&target, "untouched").await.unwrap();

        let payload = b"evil-bytes".to_vec();
        let url = serve_payload(payload).await;

        let mut config = UpdaterConfig::default();
        config.critical_paths = vec![target.display().to_string()];
        let (updater, state) = updater_fixture(&dir, config).await;

        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-bad", "version": "6.6.6", "kind": "binary",
            "url": url, "checksum": sha256_hex(b"expected-other-bytes"),
            "rollback_enabled": true,
            "manifest": { "install_path": target.to_string_lossy() }
        }))
        .unwrap();

        let err = updater.apply_update(update, no_cancel()).await.unwrap_err();
        assert!(matches!(err, FleetError::Verification(_)));
        assert_eq!(tokio::fs::read_to_string(&target).await.unwrap(), "untouched");
        // Verification failure precedes backup creation
        assert!(!updater.backups_dir().exists() || updater.backups_dir().read_dir().unwrap().next().is_none());
        let history = state.snapshot().await.update_history;
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_apply_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let protected = dir.path().join("protected.conf");
        tokio::fs::write(&protected, "pre-update").await.unwrap();

        // tar.gz whose update.sh mutates the protected file, then fails
        let tree = dir.path().join("tree");
        tokio::fs::create_dir_all(&tree).await.unwrap();
        let script = format!("echo clobbered > {}\nexit 1\n", protected.display());
        tokio::fs::write(tree.join("update.sh"), script).await.unwrap();
        let archive_path = dir.path().join("payload.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", &tree).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let payload = tokio::fs::read(&archive_path).await.unwrap();
        let url = serve_payload(payload.clone()).await;

        let mut config = UpdaterConfig::default();
        config.critical_paths = vec![protected.display().to_string()];
        let (updater, state) = updater_fixture(&dir, config).await;

        // Archive format detection keys off the payload name in the URL
        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-roll", "version": "3.0.0", "kind": "application",
            "url": format!("{}?name=app.tar.gz", url), "checksum": sha256_hex(&payload),
            "rollback_enabled": true
        }))
        .unwrap();

        let phase = updater.apply_update(update, no_cancel()).await.unwrap();
        assert_eq!(phase, UpdatePhase::RolledBack);
        assert_eq!(tokio::fs::read_to_string(&protected).await.unwrap(), "pre-update");
        assert_eq!(state.snapshot().await.rollback_count(), 1);
        let history = state.snapshot().await.update_history;
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn concurrent_updates_fail_fast_with_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, _state) = updater_fixture(&dir, UpdaterConfig::default()).await;

        let _held = updater.busy.try_lock().unwrap();
        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-x", "version": "1", "kind": "binary",
            "url": "http://127.0.0.1:9/none", "checksum": "00"
        }))
        .unwrap();
        let err = updater.apply_update(update, no_cancel()).await.unwrap_err();
        assert!(matches!(err, FleetError::Busy));
    }

    #[tokio::test]
    async fn signature_required_when_key_configured() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"signed-content".to_vec();
        let url = serve_payload(payload.clone()).await;

        let mut config = UpdaterConfig::default();
        config.signature_key = Some("super-secret".to_string());
        let (updater, _state) = updater_fixture(&dir, config).await;

        // No signature at all is rejected
        let unsigned: Update = serde_json::from_value(serde_json::json!({
            "id": "u-nosig", "version": "1", "kind": "binary",
            "url": url, "checksum": sha256_hex(&payload),
            "manifest": { "install_path": dir.path().join("t").to_string_lossy() }
        }))
        .unwrap();
        let err = updater.apply_update(unsigned.clone(), no_cancel()).await.unwrap_err();
        assert!(matches!(err, FleetError::Verification(_)));

        // A correct HMAC tag passes verification
        let mut mac = HmacSha256::new_from_slice(b"super-secret").unwrap();
        mac.update(&payload);
        let tag = hex::encode(mac.finalize().into_bytes());
        let mut signed = unsigned;
        signed.signature = Some(tag);
        let phase = updater.apply_update(signed, no_cancel()).await.unwrap();
        assert_eq!(phase, UpdatePhase::Completed);
    }
}
