use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A bounded-duration probe reporting a process as healthy or not.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// Default probe: HTTP GET expecting a 2xx response.
pub struct HttpHealthChecker {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url: url.into(), client }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self) -> Result<()> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("health probe returned {}", status))
        }
    }
}
