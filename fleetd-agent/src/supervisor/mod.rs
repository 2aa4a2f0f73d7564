use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use fleetd_core::config::SupervisorConfig;
use fleetd_core::error::{FleetError, FleetResult};
use fleetd_core::state::StateManager;
use fleetd_core::types::{BinaryInfo, BinaryStatus};

mod health;
mod logs;
mod resources;

pub use health::{HealthChecker, HttpHealthChecker};
pub use logs::{RotatingLogWriter, pump_stream};
pub use resources::{ResourceLimits, ResourceSample, ResourceSampler};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_WAIT: Duration = Duration::from_secs(10);

/// How a child should be run and watched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Health probe endpoint; absent means no liveness probing
    pub probe_url: Option<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub restart_on_failure: bool,
}

/// Why a supervised child went away. Surfaced to the agent core, which
/// owns the restart policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    Exited(Option<i32>),
    HealthFailed,
    ResourceExceeded(String),
    Stopped,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with code {:?}", code),
            ExitReason::HealthFailed => write!(f, "health check failures"),
            ExitReason::ResourceExceeded(reason) => write!(f, "resource_exceeded: {}", reason),
            ExitReason::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub name: String,
    pub reason: ExitReason,
}

#[derive(Debug, Clone)]
enum KillReason {
    Stop,
    Health,
    Resource(String),
}

struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
    kill_tx: watch::Sender<Option<KillReason>>,
}

/// Deploys, starts, and supervises child binaries with per-process log
/// rotation, health probing, and polled resource enforcement.
///
/// Invariant: a process table entry exists if and only if the state
/// manager's `deployed_binaries` entry reads `running`; transitions update
/// both under the table lock.
pub struct Supervisor {
    runtime_dir: PathBuf,
    logs_dir: PathBuf,
    config: SupervisorConfig,
    state: Arc<StateManager>,
    table: Arc<RwLock<HashMap<String, ProcessHandle>>>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    pub async fn new(
        data_dir: &PathBuf,
        config: SupervisorConfig,
        state: Arc<StateManager>,
    ) -> FleetResult<(Self, mpsc::UnboundedReceiver<SupervisorEvent>)> {
        let runtime_dir = data_dir.join("runtime");
        let logs_dir = runtime_dir.join("logs");
        tokio::fs::create_dir_all(&logs_dir).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                runtime_dir,
                logs_dir,
                config,
                state,
                table: Arc::new(RwLock::new(HashMap::new())),
                events_tx,
            },
            events_rx,
        ))
    }

    pub fn runtime_dir(&self) -> &PathBuf {
        &self.runtime_dir
    }

    /// Write a binary into the runtime dir atomically: temp file, fsync,
    /// rename. A failed deploy leaves no partial file at the final path.
    pub async fn deploy(&self, name: &str, version: &str, bytes: &[u8]) -> FleetResult<()> {
        validate_name(name)?;
        let final_path = self.runtime_dir.join(name);
        let tmp_path = self.runtime_dir.join(format!(".{}.deploy", name));

        let result: FleetResult<()> = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
            file.sync_all().await?;
            drop(file);
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))
                    .await?;
            }
            tokio::fs::rename(&tmp_path, &final_path).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return result;
        }

        self.state
            .update_and_save(|state| {
                state.runtime.deployed_binaries.insert(
                    name.to_string(),
                    BinaryInfo {
                        name: name.to_string(),
                        version: version.to_string(),
                        status: BinaryStatus::Deployed,
                        deployed_at: Utc::now(),
                        last_started: None,
                    },
                );
            })
            .await
            .map_err(|e| FleetError::State(format!("{:#}", e)))?;

        info!("Deployed binary {} version {}", name, version);
        Ok(())
    }

    /// Spawn a deployed binary and register it for monitoring. A failed
    /// start produces no process table entry.
    pub async fn start(&self, name: &str, spec: ProcessSpec) -> FleetResult<()> {
        validate_name(name)?;
        let path = self.runtime_dir.join(name);
        if !path.exists() {
            return Err(FleetError::NotFound(format!("binary {} is not deployed", name)));
        }

        let mut table = self.table.write().await;
        if table.contains_key(name) {
            return Err(FleetError::Process(format!("{} is already running", name)));
        }

        let mut command = Command::new(&path);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so cleanup catches grandchildren
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| FleetError::Process(format!("failed to spawn {}: {}", name, e)))?;
        let pid = child.id().unwrap_or(0);

        let process_log_dir = self.logs_dir.join(name);
        if let Some(stdout) = child.stdout.take() {
            match RotatingLogWriter::new(
                &process_log_dir,
                "stdout.log",
                self.config.log_max_size_bytes,
                self.config.log_keep_files,
            ) {
                Ok(writer) => {
                    tokio::spawn(pump_stream(stdout, writer));
                }
                Err(err) => warn!("No stdout capture for {}: {}", name, err),
            }
        }
        if let Some(stderr) = child.stderr.take() {
            match RotatingLogWriter::new(
                &process_log_dir,
                "stderr.log",
                self.config.log_max_size_bytes,
                self.config.log_keep_files,
            ) {
                Ok(writer) => {
                    tokio::spawn(pump_stream(stderr, writer));
                }
                Err(err) => warn!("No stderr capture for {}: {}", name, err),
            }
        }

        let (kill_tx, kill_rx) = watch::channel::<Option<KillReason>>(None);
        let (done_tx, done_rx) = watch::channel(false);

        self.spawn_wait_task(name.to_string(), child, kill_rx, done_tx);
        if let Some(probe_url) = spec.probe_url.clone() {
            self.spawn_health_monitor(name.to_string(), probe_url, kill_tx.clone(), done_rx.clone());
        }
        if !spec.limits.is_unlimited() {
            self.spawn_resource_monitor(name.to_string(), pid, spec.limits.clone(), kill_tx.clone(), done_rx);
        }

        table.insert(
            name.to_string(),
            ProcessHandle { pid, started_at: Utc::now(), kill_tx },
        );
        // Same critical section as the table insert
        self.state
            .update(|state| {
                if let Some(binary) = state.runtime.deployed_binaries.get_mut(name) {
                    binary.status = BinaryStatus::Running;
                    binary.last_started = Some(Utc::now());
                }
            })
            .await;
        drop(table);
        if let Err(err) = self.state.save().await {
            warn!("State save after start failed: {:#}", err);
        }

        info!("Started {} (pid {})", name, pid);
        Ok(())
    }

    /// Request shutdown of a child. Idempotent: stopping a process that is
    /// not running is a no-op.
    pub async fn stop(&self, name: &str) -> FleetResult<()> {
        let (kill_tx, pid) = {
            let table = self.table.read().await;
            match table.get(name) {
                Some(handle) => (handle.kill_tx.clone(), handle.pid),
                None => return Ok(()),
            }
        };
        debug!("Stopping {} (pid {})", name, pid);
        let _ = kill_tx.send(Some(KillReason::Stop));

        // Wait for the wait-task to reap the child and clear the table
        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running(name).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(FleetError::Process(format!("{} did not stop in time", name)))
    }

    pub async fn stop_all(&self) {
        let names = self.list().await;
        for name in names {
            if let Err(err) = self.stop(&name).await {
                warn!("Stopping {} failed: {}", name, err);
            }
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.table.read().await.contains_key(name)
    }

    /// Names of currently running children.
    pub async fn list(&self) -> Vec<String> {
        self.table.read().await.keys().cloned().collect()
    }

    pub async fn uptime(&self, name: &str) -> Option<chrono::Duration> {
        let table = self.table.read().await;
        table.get(name).map(|handle| Utc::now() - handle.started_at)
    }

    fn spawn_wait_task(
        &self,
        name: String,
        mut child: tokio::process::Child,
        mut kill_rx: watch::Receiver<Option<KillReason>>,
        done_tx: watch::Sender<bool>,
    ) {
        let table = self.table.clone();
        let state = self.state.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            enum WaitOutcome {
                Exited(std::io::Result<std::process::ExitStatus>),
                KillRequested,
            }

            let outcome = tokio::select! {
                status = child.wait() => WaitOutcome::Exited(status),
                _ = kill_rx.changed() => WaitOutcome::KillRequested,
            };

            let reason = match outcome {
                WaitOutcome::Exited(Ok(status)) => ExitReason::Exited(status.code()),
                WaitOutcome::Exited(Err(err)) => {
                    warn!("Waiting on {} failed: {}", name, err);
                    ExitReason::Exited(None)
                }
                WaitOutcome::KillRequested => {
                    let kill = kill_rx.borrow().clone();
                    if let Err(err) = child.kill().await {
                        warn!("Killing {} failed: {}", name, err);
                    }
                    let _ = child.wait().await;
                    match kill {
                        Some(KillReason::Stop) | None => ExitReason::Stopped,
                        Some(KillReason::Health) => ExitReason::HealthFailed,
                        Some(KillReason::Resource(detail)) => ExitReason::ResourceExceeded(detail),
                    }
                }
            };

            let _ = done_tx.send(true);

            let final_status = match &reason {
                ExitReason::Stopped | ExitReason::Exited(Some(0)) => BinaryStatus::Stopped,
                _ => BinaryStatus::Failed,
            };

            {
                let mut table = table.write().await;
                table.remove(&name);
                state
                    .update(|s| {
                        if let Some(binary) = s.runtime.deployed_binaries.get_mut(&name) {
                            binary.status = final_status;
                        }
                    })
                    .await;
            }
            if let Err(err) = state.save().await {
                warn!("State save after {} exit failed: {:#}", name, err);
            }

            info!("Process {} finished: {}", name, reason);
            let _ = events_tx.send(SupervisorEvent { name, reason });
        });
    }

    fn spawn_health_monitor(
        &self,
        name: String,
        probe_url: String,
        kill_tx: watch::Sender<Option<KillReason>>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        let max_failures = self.config.max_health_failures.max(1);

        tokio::spawn(async move {
            let checker = HttpHealthChecker::new(probe_url, PROBE_TIMEOUT);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; give the child time to listen
            ticker.tick().await;
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = done_rx.changed() => break,
                    _ = ticker.tick() => {
                        match checker.check().await {
                            Ok(()) => failures = 0,
                            Err(err) => {
                                failures += 1;
                                debug!("Health probe for {} failed ({}/{}): {}", name, failures, max_failures, err);
                                if failures >= max_failures {
                                    warn!("Killing {} after {} failed health probes", name, failures);
                                    let _ = kill_tx.send(Some(KillReason::Health));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_resource_monitor(
        &self,
        name: String,
        pid: u32,
        limits: ResourceLimits,
        kill_tx: watch::Sender<Option<KillReason>>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(self.config.resource_sample_interval_secs.max(1));

        tokio::spawn(async move {
            let mut sampler = ResourceSampler::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = done_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(sample) = sampler.sample(pid) else { continue };
                        if let Some(reason) = limits.violation(&sample) {
                            warn!("Killing {}: {}", name, reason);
                            let _ = kill_tx.send(Some(KillReason::Resource(reason)));
                            break;
                        }
                    }
                }
            }
        });
    }
}

fn validate_name(name: &str) -> FleetResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(FleetError::Process(format!("invalid binary name {:?}", name)));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn supervisor_fixture() -> (
        tempfile::TempDir,
        Supervisor,
        mpsc::UnboundedReceiver<SupervisorEvent>,
        Arc<StateManager>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let state = Arc::new(StateManager::load(&data_dir).await.unwrap());
        let mut config = SupervisorConfig::default();
        config.resource_sample_interval_secs = 1;
        let (supervisor, events) = Supervisor::new(&data_dir, config, state.clone()).await.unwrap();
        (dir, supervisor, events, state)
    }

    #[tokio::test]
    async fn deploy_start_stop_cycle() {
        let (_dir, supervisor, _events, state) = supervisor_fixture().await;

        let script = b"#!/bin/sh\nsleep 30\n";
        supervisor.deploy("sleeper", "1.0.0", script).await.unwrap();
        assert!(supervisor.runtime_dir().join("sleeper").exists());

        supervisor.start("sleeper", ProcessSpec::default()).await.unwrap();
        assert!(supervisor.is_running("sleeper").await);
        assert_eq!(
            state.snapshot().await.runtime.deployed_binaries["sleeper"].status,
            BinaryStatus::Running
        );

        supervisor.stop("sleeper").await.unwrap();
        assert!(!supervisor.is_running("sleeper").await);
        assert_eq!(
            state.snapshot().await.runtime.deployed_binaries["sleeper"].status,
            BinaryStatus::Stopped
        );

        // Second stop is a no-op
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn start_unknown_binary_fails_without_table_entry() {
        let (_dir, supervisor, _events, _state) = supervisor_fixture().await;
        let err = supervisor.start("ghost", ProcessSpec::default()).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
        assert!(!supervisor.is_running("ghost").await);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (_dir, supervisor, _events, _state) = supervisor_fixture().await;
        supervisor.deploy("sleeper", "1.0.0", b"#!/bin/sh\nsleep 30\n").await.unwrap();
        supervisor.start("sleeper", ProcessSpec::default()).await.unwrap();
        let err = supervisor.start("sleeper", ProcessSpec::default()).await.unwrap_err();
        assert!(matches!(err, FleetError::Process(_)));
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn resource_violation_kills_child() {
        let (_dir, supervisor, mut events, state) = supervisor_fixture().await;
        supervisor.deploy("hog", "1.0.0", b"#!/bin/sh\nsleep 30\n").await.unwrap();

        // Any live process exceeds a one-byte memory budget
        let spec = ProcessSpec {
            limits: ResourceLimits { max_cpu_percent: None, max_memory_bytes: Some(1) },
            ..ProcessSpec::default()
        };
        supervisor.start("hog", spec).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("resource kill within sample window")
            .expect("event channel open");
        assert_eq!(event.name, "hog");
        match event.reason {
            ExitReason::ResourceExceeded(reason) => assert!(reason.contains("memory")),
            other => panic!("unexpected exit reason: {:?}", other),
        }
        assert_eq!(
            state.snapshot().await.runtime.deployed_binaries["hog"].status,
            BinaryStatus::Failed
        );
    }

    #[tokio::test]
    async fn natural_exit_reports_code() {
        let (_dir, supervisor, mut events, _state) = supervisor_fixture().await;
        supervisor.deploy("oneshot", "1.0.0", b"#!/bin/sh\nexit 3\n").await.unwrap();
        supervisor.start("oneshot", ProcessSpec::default()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, ExitReason::Exited(Some(3)));
    }
}
