use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Agent configuration. Loaded from TOML, then overridden by environment
/// variables, then by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control plane base URL
    pub server_url: String,
    pub device_id: Option<String>,
    pub api_key: Option<String>,
    pub device_name: String,
    pub device_type: String,
    /// Stable hardware id for idempotent registration, when the device has one
    pub hardware_id: Option<String>,
    pub data_dir: String,
    /// Port for the agent-local RPC server
    pub listen_port: u16,
    pub heartbeat_interval_secs: u64,
    pub update_check_interval_secs: u64,
    /// Overrides the tier-derived metric sync interval when set
    pub metrics_interval_secs: Option<u64>,
    pub debug: bool,
    pub supervisor: SupervisorConfig,
    pub updater: UpdaterConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub health_check_interval_secs: u64,
    pub max_health_failures: u32,
    pub resource_sample_interval_secs: u64,
    pub log_max_size_bytes: u64,
    pub log_keep_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub download_timeout_secs: u64,
    pub script_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    pub max_backups: usize,
    /// Key for detached signature verification; updates carrying a
    /// signature are rejected unless it verifies under this key
    pub signature_key: Option<String>,
    /// Critical paths captured in pre-update backups
    pub critical_paths: Vec<String>,
    /// Architectures firmware updates may run on
    pub firmware_architectures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            device_id: None,
            api_key: None,
            device_name: "edge-device".to_string(),
            device_type: "generic".to_string(),
            hardware_id: None,
            data_dir: "~/.local/share/fleetd".to_string(),
            listen_port: 8088,
            heartbeat_interval_secs: 30,
            update_check_interval_secs: 300,
            metrics_interval_secs: None,
            debug: false,
            supervisor: SupervisorConfig::default(),
            updater: UpdaterConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            max_health_failures: 3,
            resource_sample_interval_secs: 5,
            log_max_size_bytes: 10 * 1024 * 1024,
            log_keep_files: 3,
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 300,
            script_timeout_secs: 120,
            health_check_timeout_secs: 300,
            max_backups: 3,
            signature_key: None,
            critical_paths: vec![
                "/usr/local/bin/fleetd-agent".to_string(),
                "/etc/fleetd/agent.toml".to_string(),
            ],
            firmware_architectures: vec!["aarch64".to_string(), "arm".to_string()],
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_secs: 60,
        }
    }
}

impl AgentConfig {
    pub async fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            toml::from_str(&content)?
        } else {
            // Create default config on first run
            let config = Self::default();
            config.save(&path).await?;
            config
        };

        config.apply_env();
        Ok(config)
    }

    pub async fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join("fleetd").join("agent.toml"))
    }

    /// Environment overrides. Unset means keep the configured value.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("FLEETD_SERVER") {
            self.server_url = url;
        }
        if let Ok(dir) = std::env::var("FLEETD_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(id) = std::env::var("FLEETD_DEVICE_ID") {
            self.device_id = Some(id);
        }
        if let Ok(key) = std::env::var("FLEETD_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("FLEETD_SECRET_KEY") {
            self.updater.signature_key = Some(key);
        }
    }

    /// Merge a partial JSON document into this config. Used by the
    /// UpdateConfig RPC and config-type updates.
    pub fn merge_json(&mut self, patch: &serde_json::Value) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        merge_values(&mut current, patch);
        *self = serde_json::from_value(current)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }
}

fn merge_values(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                merge_values(base_map.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value.clone(),
    }
}

/// Control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub secret_key: Option<String>,
    pub campaign: CampaignConfig,
    /// Devices with no heartbeat for this long are marked offline
    pub offline_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub worker_max: usize,
    pub poll_interval_secs: u64,
    pub max_poll_failures: u32,
    /// Per-device cap on the whole update wait
    pub device_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_url: "~/.local/share/fleetd/fleet.db".to_string(),
            secret_key: None,
            campaign: CampaignConfig::default(),
            offline_after_secs: 120,
        }
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            worker_max: 5,
            poll_interval_secs: 10,
            max_poll_failures: 5,
            device_timeout_secs: 30 * 60,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(key) = std::env::var("FLEETD_SECRET_KEY") {
            config.secret_key = Some(key);
        }
        config
    }

    pub fn database_path(&self) -> String {
        shellexpand::tilde(&self.database_url).to_string()
    }
}
