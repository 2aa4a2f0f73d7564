use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

const UNIT_NAME: &str = "fleetd-agent";
const UNIT_PATH: &str = "/etc/systemd/system/fleetd-agent.service";

/// Lifecycle contract with the host's service manager. Everything beyond
/// this surface (unit syntax, registry entries) stays outside the agent.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn install(&self) -> Result<()>;
    async fn uninstall(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    async fn status(&self) -> Result<String>;
    async fn enable(&self) -> Result<()>;
    async fn disable(&self) -> Result<()>;

    /// Watchdog period the manager expects keepalives within, if any.
    fn watchdog_interval(&self) -> Option<Duration>;
    async fn notify_ready(&self);
    async fn notify_watchdog(&self);
    async fn notify_status(&self, status: &str);
}

/// Pick the service manager for this host.
pub fn detect() -> Arc<dyn ServiceManager> {
    #[cfg(unix)]
    {
        if which::which("systemctl").is_ok() {
            return Arc::new(SystemdManager::new());
        }
    }
    Arc::new(NullServiceManager)
}

/// systemd integration via systemctl / systemd-notify.
pub struct SystemdManager {
    watchdog: Option<Duration>,
}

impl SystemdManager {
    pub fn new() -> Self {
        // WATCHDOG_USEC is set by systemd when WatchdogSec= is configured
        let watchdog = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|usec| usec.parse::<u64>().ok())
            .filter(|usec| *usec > 0)
            .map(Duration::from_micros);
        Self { watchdog }
    }

    async fn systemctl(&self, action: &str) -> Result<String> {
        let output = Command::new("systemctl")
            .arg(action)
            .arg(UNIT_NAME)
            .output()
            .await
            .with_context(|| format!("systemctl {} {}", action, UNIT_NAME))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() || action == "is-active" {
            Ok(stdout)
        } else {
            Err(anyhow::anyhow!(
                "systemctl {} failed: {}",
                action,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    async fn notify(&self, payload: &str) {
        // Only meaningful when running under systemd with NotifyAccess
        if std::env::var("NOTIFY_SOCKET").is_err() {
            return;
        }
        let result = Command::new("systemd-notify").arg(payload).output().await;
        if let Err(err) = result {
            debug!("systemd-notify {} failed: {}", payload, err);
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn install(&self) -> Result<()> {
        let exe = std::env::current_exe().context("Cannot resolve agent executable path")?;
        let unit = format!(
            "[Unit]\n\
             Description=fleetd device agent\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             ExecStart={} run\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             WatchdogSec=60\n\
             NotifyAccess=main\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            exe.display()
        );
        tokio::fs::write(UNIT_PATH, unit)
            .await
            .with_context(|| format!("Failed to write {}", UNIT_PATH))?;
        let output = Command::new("systemctl").arg("daemon-reload").output().await?;
        if !output.status.success() {
            return Err(anyhow::anyhow!("systemctl daemon-reload failed"));
        }
        info!("Installed service unit at {}", UNIT_PATH);
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let _ = self.systemctl("stop").await;
        let _ = self.systemctl("disable").await;
        tokio::fs::remove_file(UNIT_PATH)
            .await
            .with_context(|| format!("Failed to remove {}", UNIT_PATH))?;
        let _ = Command::new("systemctl").arg("daemon-reload").output().await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.systemctl("start").await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.systemctl("stop").await.map(|_| ())
    }

    async fn restart(&self) -> Result<()> {
        self.systemctl("restart").await.map(|_| ())
    }

    async fn status(&self) -> Result<String> {
        self.systemctl("is-active").await
    }

    async fn enable(&self) -> Result<()> {
        self.systemctl("enable").await.map(|_| ())
    }

    async fn disable(&self) -> Result<()> {
        self.systemctl("disable").await.map(|_| ())
    }

    fn watchdog_interval(&self) -> Option<Duration> {
        self.watchdog
    }

    async fn notify_ready(&self) {
        self.notify("--ready").await;
    }

    async fn notify_watchdog(&self) {
        self.notify("WATCHDOG=1").await;
    }

    async fn notify_status(&self, status: &str) {
        self.notify(&format!("--status={}", status)).await;
    }
}

/// Fallback for hosts without a recognized service manager. Lifecycle
/// operations report the limitation; notifications are no-ops.
pub struct NullServiceManager;

#[async_trait]
impl ServiceManager for NullServiceManager {
    async fn install(&self) -> Result<()> {
        Err(anyhow::anyhow!("no supported service manager on this host"))
    }

    async fn uninstall(&self) -> Result<()> {
        Err(anyhow::anyhow!("no supported service manager on this host"))
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<String> {
        Ok("unmanaged".to_string())
    }

    async fn enable(&self) -> Result<()> {
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        Ok(())
    }

    fn watchdog_interval(&self) -> Option<Duration> {
        None
    }

    async fn notify_ready(&self) {}
    async fn notify_watchdog(&self) {}
    async fn notify_status(&self, _status: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_manager_is_inert() {
        let manager = NullServiceManager;
        assert!(manager.watchdog_interval().is_none());
        assert_eq!(manager.status().await.unwrap(), "unmanaged");
        assert!(manager.restart().await.is_ok());
        assert!(manager.install().await.is_err());
    }
}
