use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::store::{CampaignRow, ServerStore};
use fleetd_core::config::CampaignConfig;
use fleetd_core::error::{FleetError, FleetResult};
use fleetd_core::types::Update;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown campaign status {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceUpdateStatus {
    Pending,
    Downloading,
    Installing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl DeviceUpdateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceUpdateStatus::Completed
                | DeviceUpdateStatus::Failed
                | DeviceUpdateStatus::Cancelled
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DeviceUpdateStatus::Downloading
                | DeviceUpdateStatus::Installing
                | DeviceUpdateStatus::Verifying
        )
    }
}

impl std::fmt::Display for DeviceUpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceUpdateStatus::Pending => "pending",
            DeviceUpdateStatus::Downloading => "downloading",
            DeviceUpdateStatus::Installing => "installing",
            DeviceUpdateStatus::Verifying => "verifying",
            DeviceUpdateStatus::Completed => "completed",
            DeviceUpdateStatus::Failed => "failed",
            DeviceUpdateStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

impl std::str::FromStr for DeviceUpdateStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(DeviceUpdateStatus::Pending),
            "downloading" => Ok(DeviceUpdateStatus::Downloading),
            "installing" => Ok(DeviceUpdateStatus::Installing),
            "verifying" => Ok(DeviceUpdateStatus::Verifying),
            "completed" => Ok(DeviceUpdateStatus::Completed),
            "failed" => Ok(DeviceUpdateStatus::Failed),
            "cancelled" => Ok(DeviceUpdateStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown device update status {:?}", other)),
        }
    }
}

/// Per-device rollout progress inside one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdateState {
    pub device_id: String,
    pub status: DeviceUpdateStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub last_check_in: Option<DateTime<Utc>>,
}

impl DeviceUpdateState {
    pub fn pending(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: DeviceUpdateStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            last_check_in: None,
        }
    }
}

/// Aggregate progress; the five buckets always sum to `total`.
/// Cancelled devices count toward `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignView {
    pub id: String,
    pub status: CampaignStatus,
    pub progress: Progress,
    pub devices: Vec<DeviceUpdateState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct CampaignHandle {
    id: String,
    update: Update,
    status: RwLock<CampaignStatus>,
    devices: RwLock<HashMap<String, DeviceUpdateState>>,
    paused: AtomicBool,
    cancelled: AtomicBool,
    started_at: DateTime<Utc>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
}

impl CampaignHandle {
    fn progress_locked(devices: &HashMap<String, DeviceUpdateState>) -> Progress {
        let mut progress = Progress {
            total: devices.len(),
            pending: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
        };
        for state in devices.values() {
            match state.status {
                DeviceUpdateStatus::Pending => progress.pending += 1,
                status if status.is_in_flight() => progress.running += 1,
                DeviceUpdateStatus::Completed => progress.succeeded += 1,
                _ => progress.failed += 1,
            }
        }
        progress
    }
}

/// Executes a deployment across a device set with a bounded worker pool.
/// Every device transition is persisted before the worker advances, so a
/// restarted orchestrator resumes non-terminal campaigns.
pub struct CampaignOrchestrator {
    store: ServerStore,
    config: CampaignConfig,
    http: reqwest::Client,
    campaigns: RwLock<HashMap<String, Arc<CampaignHandle>>>,
}

impl CampaignOrchestrator {
    pub fn new(store: ServerStore, config: CampaignConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Arc::new(Self { store, config, http, campaigns: RwLock::new(HashMap::new()) })
    }

    /// Create and start a campaign. An empty device set completes
    /// immediately.
    pub async fn create_campaign(
        self: &Arc<Self>,
        update: Update,
        devices: Vec<String>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let empty = devices.is_empty();

        let mut device_states = HashMap::new();
        for device_id in &devices {
            device_states.insert(device_id.clone(), DeviceUpdateState::pending(device_id));
        }

        let handle = Arc::new(CampaignHandle {
            id: id.clone(),
            update: update.clone(),
            status: RwLock::new(if empty {
                CampaignStatus::Completed
            } else {
                CampaignStatus::Running
            }),
            devices: RwLock::new(device_states),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            started_at,
            completed_at: RwLock::new(if empty { Some(started_at) } else { None }),
        });

        self.store
            .save_campaign(&CampaignRow {
                id: id.clone(),
                update,
                status: *handle.status.read().await,
                started_at,
                completed_at: *handle.completed_at.read().await,
            })
            .await?;
        for state in handle.devices.read().await.values() {
            self.store.save_device_state(&id, state).await?;
        }

        self.campaigns.write().await.insert(id.clone(), handle.clone());
        if !empty {
            info!("Campaign {} created for {} devices", id, devices.len());
            self.clone().spawn_runner(handle, devices);
        } else {
            info!("Campaign {} created with no devices, completed immediately", id);
        }
        Ok(id)
    }

    /// Re-arm campaigns that were mid-flight when the process stopped.
    pub async fn resume_unfinished(self: &Arc<Self>) -> Result<usize> {
        let rows = self.store.load_active_campaigns().await?;
        let mut resumed = 0;
        for row in rows {
            let states = self.store.load_device_states(&row.id).await?;
            let mut device_states = HashMap::new();
            let mut queue = Vec::new();
            for mut state in states {
                // In-flight devices get re-driven from scratch
                if state.status.is_in_flight() {
                    state.status = DeviceUpdateStatus::Pending;
                    state.progress = 0;
                    self.store.save_device_state(&row.id, &state).await?;
                }
                if state.status == DeviceUpdateStatus::Pending {
                    queue.push(state.device_id.clone());
                }
                device_states.insert(state.device_id.clone(), state);
            }

            let paused = row.status == CampaignStatus::Paused;
            let handle = Arc::new(CampaignHandle {
                id: row.id.clone(),
                update: row.update.clone(),
                status: RwLock::new(row.status),
                devices: RwLock::new(device_states),
                paused: AtomicBool::new(paused),
                cancelled: AtomicBool::new(false),
                started_at: row.started_at,
                completed_at: RwLock::new(row.completed_at),
            });
            self.campaigns.write().await.insert(row.id.clone(), handle.clone());

            info!("Resuming campaign {} ({} devices left)", row.id, queue.len());
            self.clone().spawn_runner(handle, queue);
            resumed += 1;
        }
        Ok(resumed)
    }

    pub async fn status(&self, id: &str) -> FleetResult<CampaignView> {
        if let Some(handle) = self.campaigns.read().await.get(id).cloned() {
            let devices = handle.devices.read().await;
            let mut list: Vec<DeviceUpdateState> = devices.values().cloned().collect();
            list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            return Ok(CampaignView {
                id: handle.id.clone(),
                status: *handle.status.read().await,
                progress: CampaignHandle::progress_locked(&devices),
                devices: list,
                started_at: handle.started_at,
                completed_at: *handle.completed_at.read().await,
            });
        }

        // Fall back to persisted campaigns from earlier runs
        let row = self
            .store
            .load_campaign(id)
            .await
            .map_err(|e| FleetError::Internal(format!("{:#}", e)))?
            .ok_or_else(|| FleetError::NotFound(format!("campaign {}", id)))?;
        let devices = self
            .store
            .load_device_states(id)
            .await
            .map_err(|e| FleetError::Internal(format!("{:#}", e)))?;
        let map: HashMap<String, DeviceUpdateState> =
            devices.iter().map(|s| (s.device_id.clone(), s.clone())).collect();
        Ok(CampaignView {
            id: row.id,
            status: row.status,
            progress: CampaignHandle::progress_locked(&map),
            devices,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }

    /// Stop starting new devices; in-flight devices complete.
    pub async fn pause(&self, id: &str) -> FleetResult<()> {
        let handle = self.handle(id).await?;
        handle.paused.store(true, Ordering::SeqCst);
        self.set_campaign_status(&handle, CampaignStatus::Paused, None).await;
        info!("Campaign {} paused", id);
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> FleetResult<()> {
        let handle = self.handle(id).await?;
        handle.paused.store(false, Ordering::SeqCst);
        self.set_campaign_status(&handle, CampaignStatus::Running, None).await;
        info!("Campaign {} resumed", id);
        Ok(())
    }

    /// Terminal: still-pending devices are marked cancelled; in-flight
    /// devices run to completion.
    pub async fn cancel(&self, id: &str) -> FleetResult<()> {
        let handle = self.handle(id).await?;
        handle.cancelled.store(true, Ordering::SeqCst);
        handle.paused.store(false, Ordering::SeqCst);

        {
            let mut devices = handle.devices.write().await;
            for state in devices.values_mut() {
                if state.status == DeviceUpdateStatus::Pending {
                    state.status = DeviceUpdateStatus::Cancelled;
                    state.completed_at = Some(Utc::now());
                    if let Err(err) = self.store.save_device_state(id, state).await {
                        warn!("Persisting cancellation for {} failed: {:#}", state.device_id, err);
                    }
                }
            }
        }
        self.set_campaign_status(&handle, CampaignStatus::Cancelled, Some(Utc::now())).await;
        info!("Campaign {} cancelled", id);
        Ok(())
    }

    /// The update queued for a device by any non-terminal campaign. Drives
    /// both `has_update` in heartbeats and the agent's update fetch.
    pub async fn pending_update_for(&self, device_id: &str) -> Option<Update> {
        let campaigns = self.campaigns.read().await;
        for handle in campaigns.values() {
            let status = *handle.status.read().await;
            if !matches!(status, CampaignStatus::Running | CampaignStatus::Paused) {
                continue;
            }
            let devices = handle.devices.read().await;
            if let Some(state) = devices.get(device_id) {
                if !state.status.is_terminal() {
                    return Some(handle.update.clone());
                }
            }
        }
        None
    }

    async fn handle(&self, id: &str) -> FleetResult<Arc<CampaignHandle>> {
        self.campaigns
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("campaign {}", id)))
    }

    async fn set_campaign_status(
        &self,
        handle: &Arc<CampaignHandle>,
        status: CampaignStatus,
        completed_at: Option<DateTime<Utc>>,
    ) {
        *handle.status.write().await = status;
        if completed_at.is_some() {
            *handle.completed_at.write().await = completed_at;
        }
        let row = CampaignRow {
            id: handle.id.clone(),
            update: handle.update.clone(),
            status,
            started_at: handle.started_at,
            completed_at: *handle.completed_at.read().await,
        };
        if let Err(err) = self.store.save_campaign(&row).await {
            warn!("Persisting campaign {} status failed: {:#}", handle.id, err);
        }
    }

    fn spawn_runner(self: Arc<Self>, handle: Arc<CampaignHandle>, devices: Vec<String>) {
        tokio::spawn(async move {
            self.run_campaign(handle, devices).await;
        });
    }

    async fn run_campaign(self: Arc<Self>, handle: Arc<CampaignHandle>, devices: Vec<String>) {
        let workers = self.config.worker_max.max(1).min(devices.len().max(1));
        let (queue_tx, queue_rx) = mpsc::channel::<String>(devices.len().max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        for device_id in devices {
            let _ = queue_tx.send(device_id).await;
        }
        drop(queue_tx);

        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let orchestrator = self.clone();
            let handle = handle.clone();
            let queue_rx = queue_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let device_id = { queue_rx.lock().await.recv().await };
                    let Some(device_id) = device_id else { break };
                    debug!("Worker {} picked device {}", worker_id, device_id);

                    // Pause gates new device starts only
                    while handle.paused.load(Ordering::SeqCst)
                        && !handle.cancelled.load(Ordering::SeqCst)
                    {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    if handle.cancelled.load(Ordering::SeqCst) {
                        orchestrator
                            .transition(
                                &handle,
                                &device_id,
                                DeviceUpdateStatus::Cancelled,
                                100,
                                None,
                            )
                            .await;
                        continue;
                    }

                    orchestrator.run_device(&handle, &device_id).await;
                }
            }));
        }
        for worker in worker_handles {
            let _ = worker.await;
        }

        // Finalize unless pause/cancel already decided the terminal state
        if handle.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let failed = {
            let devices = handle.devices.read().await;
            let progress = CampaignHandle::progress_locked(&devices);
            progress.failed
        };
        let terminal = if failed == 0 { CampaignStatus::Completed } else { CampaignStatus::Failed };
        self.set_campaign_status(&handle, terminal, Some(Utc::now())).await;
        info!("Campaign {} finished: {}", handle.id, terminal);
    }

    async fn run_device(&self, handle: &Arc<CampaignHandle>, device_id: &str) {
        let agent_url = match self.store.get_device(device_id).await {
            Ok(Some(device)) => device.agent_url,
            Ok(None) => None,
            Err(err) => {
                warn!("Loading device {} failed: {:#}", device_id, err);
                None
            }
        };
        let Some(agent_url) = agent_url else {
            self.transition(
                handle,
                device_id,
                DeviceUpdateStatus::Failed,
                0,
                Some("device has no reachable agent endpoint".to_string()),
            )
            .await;
            return;
        };
        let agent_url = agent_url.trim_end_matches('/').to_string();

        // Send the manifest; a busy agent gets a few spaced retries
        self.transition(handle, device_id, DeviceUpdateStatus::Downloading, 10, None).await;
        let mut accepted = false;
        for attempt in 0..3u32 {
            match self
                .http
                .post(format!("{}/v1/update", agent_url))
                .json(&handle.update)
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::ACCEPTED => {
                    accepted = true;
                    break;
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::CONFLICT => {
                    debug!("Device {} busy (attempt {})", device_id, attempt + 1);
                    self.bump_retry(handle, device_id).await;
                }
                Ok(resp) => {
                    self.transition(
                        handle,
                        device_id,
                        DeviceUpdateStatus::Failed,
                        10,
                        Some(format!("agent rejected update: {}", resp.status())),
                    )
                    .await;
                    return;
                }
                Err(err) => {
                    debug!("Sending update to {} failed: {}", device_id, err);
                    self.bump_retry(handle, device_id).await;
                }
            }
            tokio::time::sleep(Duration::from_secs(2 << attempt)).await;
        }
        if !accepted {
            self.transition(
                handle,
                device_id,
                DeviceUpdateStatus::Failed,
                10,
                Some("agent did not accept the update manifest".to_string()),
            )
            .await;
            return;
        }

        self.transition(handle, device_id, DeviceUpdateStatus::Installing, 50, None).await;

        // Poll the agent's health endpoint until healthy, bounded by both
        // consecutive-failure and overall-timeout budgets
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.device_timeout_secs);
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::time::sleep(poll_interval).await;
            self.touch_check_in(handle, device_id).await;

            match self.http.get(format!("{}/v1/health", agent_url)).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.transition(handle, device_id, DeviceUpdateStatus::Completed, 100, None)
                        .await;
                    return;
                }
                Ok(_) | Err(_) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_poll_failures {
                        self.transition(
                            handle,
                            device_id,
                            DeviceUpdateStatus::Failed,
                            75,
                            Some(format!(
                                "device unhealthy after {} consecutive probes",
                                consecutive_failures
                            )),
                        )
                        .await;
                        return;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.transition(
                    handle,
                    device_id,
                    DeviceUpdateStatus::Failed,
                    75,
                    Some("device update timed out".to_string()),
                )
                .await;
                return;
            }
        }
    }

    /// Apply a device transition and persist it before returning.
    async fn transition(
        &self,
        handle: &Arc<CampaignHandle>,
        device_id: &str,
        status: DeviceUpdateStatus,
        progress: u8,
        error: Option<String>,
    ) {
        let snapshot = {
            let mut devices = handle.devices.write().await;
            let Some(state) = devices.get_mut(device_id) else { return };
            state.status = status;
            state.progress = progress;
            state.error = error;
            if status == DeviceUpdateStatus::Downloading && state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
            if status.is_terminal() {
                state.completed_at = Some(Utc::now());
            }
            state.clone()
        };
        if let Err(err) = self.store.save_device_state(&handle.id, &snapshot).await {
            warn!("Persisting device state for {} failed: {:#}", device_id, err);
        }
    }

    async fn bump_retry(&self, handle: &Arc<CampaignHandle>, device_id: &str) {
        let snapshot = {
            let mut devices = handle.devices.write().await;
            let Some(state) = devices.get_mut(device_id) else { return };
            state.retry_count += 1;
            state.clone()
        };
        let _ = self.store.save_device_state(&handle.id, &snapshot).await;
    }

    async fn touch_check_in(&self, handle: &Arc<CampaignHandle>, device_id: &str) {
        let snapshot = {
            let mut devices = handle.devices.write().await;
            let Some(state) = devices.get_mut(device_id) else { return };
            state.last_check_in = Some(Utc::now());
            state.clone()
        };
        let _ = self.store.save_device_state(&handle.id, &snapshot).await;
    }
}
