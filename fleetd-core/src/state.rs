use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::types::{BinaryInfo, DeviceIdentity, UpdateRecord};

pub const STATE_SCHEMA_VERSION: u32 = 2;
const MAX_UPDATE_HISTORY: usize = 100;
const MAX_EVENTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Running,
    Updating,
    Degraded,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub deployed_binaries: HashMap<String, BinaryInfo>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub kind: String,
    pub at: DateTime<Utc>,
}

/// Versioned agent state, persisted as pretty-printed JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub schema_version: u32,
    pub last_start_time: DateTime<Utc>,
    pub identity: Option<DeviceIdentity>,
    pub runtime: RuntimeState,
    #[serde(default)]
    pub update_history: Vec<UpdateRecord>,
    #[serde(default)]
    pub events: Vec<StateEvent>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            last_start_time: Utc::now(),
            identity: None,
            runtime: RuntimeState {
                deployed_binaries: HashMap::new(),
                last_health_check: None,
                status: AgentStatus::Starting,
            },
            update_history: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl AgentState {
    pub fn push_event(&mut self, kind: impl Into<String>) {
        self.events.push(StateEvent { kind: kind.into(), at: Utc::now() });
        if self.events.len() > MAX_EVENTS {
            let excess = self.events.len() - MAX_EVENTS;
            self.events.drain(0..excess);
        }
    }

    pub fn push_update_record(&mut self, record: UpdateRecord) {
        self.update_history.push(record);
        if self.update_history.len() > MAX_UPDATE_HISTORY {
            let excess = self.update_history.len() - MAX_UPDATE_HISTORY;
            self.update_history.drain(0..excess);
        }
    }

    pub fn rollback_count(&self) -> usize {
        self.events.iter().filter(|e| e.kind == "rolled_back").count()
    }
}

/// Crash-safe persistence for [`AgentState`].
///
/// Save sequence: rename current file to `.bak`, write the new content to
/// `.tmp`, fsync, rename `.tmp` over the current name. A reader observing
/// either the current file or the `.bak` sees a complete document.
pub struct StateManager {
    path: PathBuf,
    bak_path: PathBuf,
    tmp_path: PathBuf,
    state: RwLock<AgentState>,
}

impl StateManager {
    /// Load state from `dir`, recovering from `.bak` when the current file
    /// is unreadable. A missing file yields a fresh default state.
    pub async fn load(dir: &PathBuf) -> Result<Self> {
        let state_dir = dir.join("state");
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("Failed to create state dir {:?}", state_dir))?;

        let path = state_dir.join("state.json");
        let bak_path = state_dir.join("state.json.bak");
        let tmp_path = state_dir.join("state.json.tmp");

        let mut state = match Self::read_state(&path).await {
            Ok(Some(state)) => state,
            Ok(None) => match Self::read_state(&bak_path).await {
                Ok(Some(mut recovered)) => {
                    tracing::warn!("State file missing, recovered from backup copy");
                    recovered.push_event("state_recovered");
                    recovered
                }
                _ => AgentState::default(),
            },
            Err(err) => {
                tracing::warn!("State file unreadable ({}), trying backup copy", err);
                match Self::read_state(&bak_path).await {
                    Ok(Some(mut recovered)) => {
                        recovered.push_event("state_recovered");
                        recovered
                    }
                    _ => {
                        tracing::error!("Backup state also unreadable, starting fresh");
                        let mut fresh = AgentState::default();
                        fresh.push_event("state_reset");
                        fresh
                    }
                }
            }
        };

        state.last_start_time = Utc::now();
        Ok(Self { path, bak_path, tmp_path, state: RwLock::new(state) })
    }

    async fn read_state(path: &PathBuf) -> Result<Option<AgentState>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(path).await?;
        let state: AgentState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state at {:?}", path))?;
        Ok(Some(state))
    }

    /// Value snapshot; readers never block writers.
    pub async fn snapshot(&self) -> AgentState {
        self.state.read().await.clone()
    }

    /// Apply a mutation under the writer lock. The mutation must not
    /// perform I/O; call [`save`](Self::save) afterwards to persist.
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut AgentState),
    {
        let mut state = self.state.write().await;
        mutate(&mut state);
    }

    pub async fn update_and_save<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut AgentState),
    {
        self.update(mutate).await;
        self.save().await
    }

    /// Persist the current state atomically.
    pub async fn save(&self) -> Result<()> {
        // Snapshot first so the lock is not held across file I/O
        let snapshot = self.snapshot().await;
        let content = serde_json::to_string_pretty(&snapshot)?;

        if self.path.exists() {
            tokio::fs::rename(&self.path, &self.bak_path)
                .await
                .context("Failed to rotate state backup")?;
        }

        let mut file = tokio::fs::File::create(&self.tmp_path)
            .await
            .context("Failed to create temp state file")?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes()).await?;
        file.sync_all().await.context("Failed to fsync state file")?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.path)
            .await
            .context("Failed to publish state file")?;
        Ok(())
    }

    /// Serialized current state, for mirroring into the embedded store.
    pub async fn to_json(&self) -> Result<String> {
        let snapshot = self.snapshot().await;
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }
}
