use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneClient;
use crate::rpc;
use crate::service::{self, ServiceManager};
use crate::supervisor::{ExitReason, ProcessSpec, Supervisor, SupervisorEvent};
use crate::telemetry::{
    LocalFileSink, RemoteMetricsSink, SupervisorMetricsSource, SystemMetricsSource,
    TelemetryPipeline,
};
use crate::updater::{ConfigApplier, Updater};
use fleetd_core::capability::Capability;
use fleetd_core::config::AgentConfig;
use fleetd_core::platform::PlatformInfo;
use fleetd_core::state::{AgentStatus, StateManager};
use fleetd_core::storage::MetricStorage;
use fleetd_core::types::{DeviceIdentity, RegisterRequest, StatusReport, Update};

const RPC_DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Shared handles the RPC server and background loops operate on.
pub struct AgentHandle {
    pub config: Arc<RwLock<AgentConfig>>,
    pub config_path: Option<PathBuf>,
    pub platform: PlatformInfo,
    pub capability: Capability,
    pub state: Arc<StateManager>,
    pub storage: Arc<dyn MetricStorage>,
    pub updater: Arc<Updater>,
    pub client: Arc<ControlPlaneClient>,
    pub supervisor: Arc<Supervisor>,
    /// Specs of started processes, kept for the restart policy
    pub specs: RwLock<HashMap<String, ProcessSpec>>,
    pub update_tx: mpsc::Sender<Update>,
    pub last_heartbeat: RwLock<Option<tokio::time::Instant>>,
    pub started_at: tokio::time::Instant,
    pub heartbeat_interval: Duration,
}

impl AgentHandle {
    /// Healthy ⇔ the last heartbeat landed within 3× the heartbeat
    /// interval and the agent is not in an error state. A freshly started
    /// agent gets the same grace window before its first heartbeat.
    pub async fn is_healthy(&self) -> bool {
        let window = self.heartbeat_interval * 3;
        let beat_ok = match *self.last_heartbeat.read().await {
            Some(at) => at.elapsed() <= window,
            None => self.started_at.elapsed() <= window,
        };
        if !beat_ok {
            return false;
        }
        let state = self.state.snapshot().await;
        state.runtime.status != AgentStatus::Error
    }

    pub async fn record_heartbeat(&self) {
        let mut last = self.last_heartbeat.write().await;
        *last = Some(tokio::time::Instant::now());
    }
}

/// Applies config-type updates and UpdateConfig RPCs to the live
/// configuration and persists the merged document.
pub struct AgentConfigApplier {
    config: Arc<RwLock<AgentConfig>>,
    config_path: Option<PathBuf>,
}

#[async_trait]
impl ConfigApplier for AgentConfigApplier {
    async fn apply(&self, patch: serde_json::Value) -> Result<()> {
        let mut config = self.config.write().await;
        config.merge_json(&patch)?;
        if let Some(path) = &self.config_path {
            config.save(path).await?;
        }
        info!("Configuration updated from patch");
        Ok(())
    }
}

/// The device agent: composes capability detection, storage, state,
/// supervision, telemetry, and updates around one control loop.
pub struct Agent {
    handle: Arc<AgentHandle>,
    service: Arc<dyn ServiceManager>,
    update_rx: Option<mpsc::Receiver<Update>>,
    events_rx: Option<mpsc::UnboundedReceiver<SupervisorEvent>>,
    update_notify: Arc<Notify>,
    rpc_shutdown: watch::Sender<bool>,
    telemetry_shutdown: watch::Sender<bool>,
    root_shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    pub async fn new(config: AgentConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data dir {:?}", data_dir))?;

        let platform = PlatformInfo::detect(&data_dir);
        let capability = Capability::detect(&platform);
        info!(
            "Device tier {} ({} MB RAM, {} MB disk, {} cores)",
            capability.tier,
            platform.total_memory_bytes / (1024 * 1024),
            platform.total_disk_bytes / (1024 * 1024),
            platform.cpu_cores
        );

        let state = Arc::new(StateManager::load(&data_dir).await?);
        let storage = fleetd_core::storage::open(&capability, &data_dir)
            .await
            .map_err(|e| anyhow::anyhow!("opening device storage: {}", e))?;
        let service = service::detect();

        let shared_config = Arc::new(RwLock::new(config.clone()));
        let config_applier = Arc::new(AgentConfigApplier {
            config: shared_config.clone(),
            config_path: config_path.clone(),
        });

        let client = Arc::new(ControlPlaneClient::new(&config.server_url, config.retry.clone()));
        let (supervisor, events_rx) =
            Supervisor::new(&data_dir, config.supervisor.clone(), state.clone())
                .await
                .map_err(|e| anyhow::anyhow!("starting supervisor: {}", e))?;
        let supervisor = Arc::new(supervisor);

        let updater = Arc::new(Updater::new(
            config.updater.clone(),
            data_dir.clone(),
            platform.arch.clone(),
            state.clone(),
            storage.clone(),
            service.clone(),
            config_applier,
        ));

        let (update_tx, update_rx) = mpsc::channel(1);
        let (rpc_shutdown, _) = watch::channel(false);
        let (telemetry_shutdown, _) = watch::channel(false);
        let (root_shutdown, _) = watch::channel(false);

        let handle = Arc::new(AgentHandle {
            config: shared_config,
            config_path,
            platform,
            capability,
            state,
            storage,
            updater,
            client,
            supervisor,
            specs: RwLock::new(HashMap::new()),
            update_tx,
            last_heartbeat: RwLock::new(None),
            started_at: tokio::time::Instant::now(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        });

        Ok(Self {
            handle,
            service,
            update_rx: Some(update_rx),
            events_rx: Some(events_rx),
            update_notify: Arc::new(Notify::new()),
            rpc_shutdown,
            telemetry_shutdown,
            root_shutdown,
            tasks: Vec::new(),
        })
    }

    pub fn handle(&self) -> Arc<AgentHandle> {
        self.handle.clone()
    }

    /// The agent control loop: register, serve, beat, collect, update.
    /// Returns after a graceful shutdown signal.
    pub async fn run(&mut self) -> Result<()> {
        self.register().await?;
        self.handle
            .state
            .update_and_save(|state| {
                state.runtime.status = AgentStatus::Running;
            })
            .await?;

        self.spawn_rpc_server().await?;
        self.spawn_heartbeat_loop();
        self.spawn_update_check_loop().await;
        self.spawn_update_processor();
        self.spawn_supervisor_event_loop();
        self.spawn_telemetry().await;
        self.spawn_watchdog();

        self.service.notify_ready().await;
        info!("Agent is up");

        self.wait_for_signals().await;
        self.shutdown().await
    }

    /// Register with the control plane, reusing a persisted identity when
    /// one exists. Registration is idempotent on the device id.
    async fn register(&self) -> Result<()> {
        let config = self.handle.config.read().await.clone();
        let state = self.handle.state.snapshot().await;

        // Flag/env-provided credentials win, then the persisted identity
        if let (Some(device_id), Some(api_key)) = (&config.device_id, &config.api_key) {
            self.handle.client.set_credentials(device_id, api_key).await;
            info!("Using configured device identity {}", device_id);
            return Ok(());
        }
        if let Some(identity) = &state.identity {
            self.handle
                .client
                .set_credentials(&identity.device_id, &identity.api_key)
                .await;
            info!("Using persisted device identity {}", identity.device_id);
            return Ok(());
        }

        let request = RegisterRequest {
            name: config.device_name.clone(),
            device_type: config.device_type.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hardware_id: config.hardware_id.clone(),
            system_info: self.handle.platform.system_info(),
            agent_url: Some(format!(
                "http://{}:{}",
                self.handle.platform.hostname, config.listen_port
            )),
        };
        let response = self
            .handle
            .client
            .register(&request)
            .await
            .context("device registration failed")?;
        info!("Registered as device {}", response.device_id);

        let identity = DeviceIdentity {
            device_id: response.device_id,
            api_key: response.api_key,
            architecture: self.handle.platform.arch.clone(),
            os: self.handle.platform.os.clone(),
            hardware_id: config.hardware_id.clone(),
            first_seen: Utc::now(),
            tags: HashMap::new(),
        };
        self.handle
            .state
            .update_and_save(|state| state.identity = Some(identity))
            .await?;
        self.mirror_state().await;
        Ok(())
    }

    /// Mirror the state document into the embedded store, best-effort.
    async fn mirror_state(&self) {
        if let Ok(json) = self.handle.state.to_json().await {
            if let Err(err) = self.handle.storage.save_state_snapshot(&json).await {
                debug!("State mirror failed: {}", err);
            }
        }
    }

    async fn spawn_rpc_server(&mut self) -> Result<()> {
        let port = self.handle.config.read().await.listen_port;
        let handle = self.handle.clone();
        let shutdown_rx = self.rpc_shutdown.subscribe();
        let server = rpc::bind(handle, port).await?;
        self.tasks.push(tokio::spawn(async move {
            if let Err(err) = server.serve(shutdown_rx).await {
                error!("RPC server failed: {:#}", err);
            }
        }));
        Ok(())
    }

    fn spawn_heartbeat_loop(&mut self) {
        let handle = self.handle.clone();
        let notify = self.update_notify.clone();
        let mut shutdown = self.root_shutdown.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(handle.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match handle.client.heartbeat().await {
                            Ok(beat) => {
                                handle.record_heartbeat().await;
                                handle.state.update(|s| {
                                    s.runtime.last_health_check = Some(Utc::now());
                                }).await;
                                if beat.has_update {
                                    notify.notify_one();
                                }
                            }
                            Err(err) => warn!("Heartbeat failed: {:#}", err),
                        }
                    }
                }
            }
            debug!("Heartbeat loop stopped");
        }));
    }

    async fn spawn_update_check_loop(&mut self) {
        let handle = self.handle.clone();
        let notify = self.update_notify.clone();
        let mut shutdown = self.root_shutdown.subscribe();
        let check_interval =
            Duration::from_secs(handle.config.read().await.update_check_interval_secs.max(1));

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                match handle.client.pending_update().await {
                    Ok(Some(update)) => {
                        info!("Control plane queued update {} ({})", update.id, update.version);
                        if let Err(err) = handle.update_tx.try_send(update) {
                            debug!("Update processor busy, will retry: {}", err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => debug!("Update check failed: {:#}", err),
                }
            }
            debug!("Update check loop stopped");
        }));
    }

    fn spawn_update_processor(&mut self) {
        let handle = self.handle.clone();
        let mut update_rx = self.update_rx.take().expect("update processor spawned once");
        let mut shutdown = self.root_shutdown.subscribe();
        let cancel_rx = self.root_shutdown.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    _ = shutdown.changed() => break,
                    update = update_rx.recv() => match update {
                        Some(update) => update,
                        None => break,
                    }
                };

                let version = update.version.clone();
                handle.state.update(|s| s.runtime.status = AgentStatus::Updating).await;
                let outcome = handle.updater.apply_update(update, cancel_rx.clone()).await;
                handle.state.update(|s| s.runtime.status = AgentStatus::Running).await;
                let _ = handle.state.save().await;

                let mut metrics = HashMap::new();
                metrics.insert(
                    "update_success".to_string(),
                    if outcome.is_ok() { 1.0 } else { 0.0 },
                );
                let report = StatusReport {
                    metrics,
                    status: match &outcome {
                        Ok(phase) => format!("update {} -> {:?}", version, phase),
                        Err(err) => format!("update {} failed: {}", version, err),
                    },
                };
                if let Err(err) = handle.client.report_status(&report).await {
                    debug!("Update status report failed: {:#}", err);
                }
            }
            debug!("Update processor stopped");
        }));
    }

    fn spawn_supervisor_event_loop(&mut self) {
        let handle = self.handle.clone();
        let mut events_rx = self.events_rx.take().expect("event loop spawned once");
        let mut shutdown = self.root_shutdown.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    }
                };

                let restartable = matches!(
                    event.reason,
                    ExitReason::HealthFailed
                        | ExitReason::ResourceExceeded(_)
                        | ExitReason::Exited(Some(_))
                ) && event.reason != ExitReason::Exited(Some(0));

                if !restartable {
                    continue;
                }
                let spec = { handle.specs.read().await.get(&event.name).cloned() };
                let Some(spec) = spec else { continue };
                if !spec.restart_on_failure {
                    continue;
                }

                warn!("Restarting {} after {}", event.name, event.reason);
                tokio::time::sleep(RESTART_DELAY).await;
                if let Err(err) = handle.supervisor.start(&event.name, spec).await {
                    error!("Restart of {} failed: {}", event.name, err);
                }
            }
            debug!("Supervisor event loop stopped");
        }));
    }

    async fn spawn_telemetry(&mut self) {
        let handle = self.handle.clone();
        let shutdown_rx = self.telemetry_shutdown.subscribe();

        let (metrics_interval, retry, data_dir) = {
            let config = handle.config.read().await;
            (
                config
                    .metrics_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| handle.capability.sync_interval()),
                config.retry.clone(),
                config.data_dir(),
            )
        };

        let mut pipeline = TelemetryPipeline::new(
            handle.storage.clone(),
            handle.capability.batch_size,
            metrics_interval,
            retry,
        );
        pipeline.add_source(Box::new(SystemMetricsSource::new(handle.platform.clone())));
        pipeline.add_source(Box::new(SupervisorMetricsSource::new(handle.supervisor.clone())));
        pipeline.add_sink(Box::new(LocalFileSink::new(&data_dir)));
        pipeline.add_sink(Box::new(RemoteMetricsSink::new(
            handle.client.clone(),
            handle.capability.compression,
        )));

        self.tasks.push(tokio::spawn(pipeline.run(shutdown_rx)));
    }

    fn spawn_watchdog(&mut self) {
        let Some(watchdog) = self.service.watchdog_interval() else {
            return;
        };
        let handle = self.handle.clone();
        let service = self.service.clone();
        let mut shutdown = self.root_shutdown.subscribe();
        // Keepalives at half the watchdog period, gated on health
        let interval = watchdog / 2;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if handle.is_healthy().await {
                            service.notify_watchdog().await;
                        } else {
                            warn!("Skipping watchdog keepalive: agent unhealthy");
                        }
                    }
                }
            }
        }));
    }

    async fn wait_for_signals(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    error!("Cannot install SIGTERM handler: {}", err);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            let mut hup = signal(SignalKind::hangup()).ok();

            loop {
                let reload = async {
                    match hup.as_mut() {
                        Some(hup) => {
                            hup.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT, shutting down");
                        break;
                    }
                    _ = term.recv() => {
                        info!("Received SIGTERM, shutting down");
                        break;
                    }
                    _ = reload => {
                        info!("Received SIGHUP, reloading configuration");
                        self.reload_config().await;
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt, shutting down");
        }
    }

    async fn reload_config(&self) {
        let path = self
            .handle
            .config_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        match AgentConfig::load(path.as_deref()).await {
            Ok(fresh) => {
                let mut config = self.handle.config.write().await;
                *config = fresh;
                info!("Configuration reloaded");
            }
            Err(err) => warn!("Config reload failed, keeping previous: {:#}", err),
        }
    }

    /// Drain in order: RPC first (bounded), then telemetry, then children,
    /// then persist state and cancel the remaining loops.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down agent");
        self.service.notify_status("shutting down").await;

        let _ = self.rpc_shutdown.send(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = self.telemetry_shutdown.send(true);
        self.handle.supervisor.stop_all().await;

        self.handle
            .state
            .update_and_save(|state| state.runtime.status = AgentStatus::Stopped)
            .await?;
        self.mirror_state().await;
        self.handle.storage.close().await;

        let _ = self.root_shutdown.send(true);
        let deadline = tokio::time::Instant::now() + RPC_DRAIN_DEADLINE;
        for task in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining.max(Duration::from_millis(100)), task)
                .await
                .is_err()
            {
                debug!("A background task outlived the drain deadline");
            }
        }
        info!("Agent stopped");
        Ok(())
    }
}

/// Panic-resilient entry point: restarts the agent loop with backoff so a
/// crash inside the runtime never takes the supervisor process down.
pub async fn run_forever(config: AgentConfig, config_path: Option<PathBuf>) -> Result<()> {
    let mut backoff = Duration::from_secs(1);
    loop {
        let mut agent = Agent::new(config.clone(), config_path.clone()).await?;
        let service = service::detect();

        let outcome = std::panic::AssertUnwindSafe(agent.run()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => {
                error!("Agent run failed: {:#}", err);
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Agent panicked: {}", message);
                service.notify_status("recovering from panic").await;
            }
        }

        warn!("Restarting agent in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn agent_fixture() -> (tempfile::TempDir, Agent) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.data_dir = dir.path().join("data").to_string_lossy().to_string();
        config.listen_port = 0;
        let agent = Agent::new(config, None).await.unwrap();
        (dir, agent)
    }

    #[tokio::test]
    async fn fresh_agent_is_healthy_within_grace_window() {
        let (_dir, agent) = agent_fixture().await;
        assert!(agent.handle().is_healthy().await);
    }

    #[tokio::test]
    async fn heartbeat_recording_extends_health() {
        let (_dir, agent) = agent_fixture().await;
        let handle = agent.handle();
        handle.record_heartbeat().await;
        assert!(handle.is_healthy().await);
    }

    #[tokio::test]
    async fn error_state_is_unhealthy() {
        let (_dir, agent) = agent_fixture().await;
        let handle = agent.handle();
        handle.record_heartbeat().await;
        handle.state.update(|s| s.runtime.status = AgentStatus::Error).await;
        assert!(!handle.is_healthy().await);
    }

    #[tokio::test]
    async fn config_applier_persists_patches() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("agent.toml");
        let config = Arc::new(RwLock::new(AgentConfig::default()));
        let applier = AgentConfigApplier {
            config: config.clone(),
            config_path: Some(config_path.clone()),
        };

        applier
            .apply(serde_json::json!({ "device_name": "patched-device" }))
            .await
            .unwrap();
        assert_eq!(config.read().await.device_name, "patched-device");

        let persisted: AgentConfig =
            toml::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(persisted.device_name, "patched-device");
    }
}
