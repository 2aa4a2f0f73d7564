use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use fleetd_core::config::RetryConfig;
use fleetd_core::error::FleetError;
use fleetd_core::types::{
    AckResponse, HeartbeatResponse, Metric, MetricsUpload, RegisterRequest, RegisterResponse,
    StatusReport, Update,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

/// HTTP client for the control plane. Every call except registration
/// carries the bearer api key; transient failures are retried with
/// exponential backoff inside a bounded attempt budget.
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
    credentials: RwLock<Option<Credentials>>,
    retry: RetryConfig,
}

#[derive(Clone)]
struct Credentials {
    device_id: String,
    api_key: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, retry: RetryConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            credentials: RwLock::new(None),
            retry,
        }
    }

    pub async fn set_credentials(&self, device_id: &str, api_key: &str) {
        let mut credentials = self.credentials.write().await;
        *credentials = Some(Credentials {
            device_id: device_id.to_string(),
            api_key: api_key.to_string(),
        });
    }

    async fn credentials(&self) -> Result<Credentials> {
        self.credentials
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("device is not registered yet"))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.retry.initial_backoff_ms.max(1) as f64;
        let factor = self.retry.backoff_multiplier.max(1.0);
        let raw_ms = initial * factor.powi(attempt as i32);
        let cap_ms = (self.retry.max_backoff_secs * 1000) as f64;
        Duration::from_millis(raw_ms.min(cap_ms) as u64)
    }

    /// Run `operation` up to MAX_ATTEMPTS times, backing off between
    /// transient failures.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    // NotFound and auth failures will not heal with retries
                    if let Some(fleet) = err.downcast_ref::<FleetError>() {
                        if !fleet.is_transient() {
                            return Err(err);
                        }
                    }
                    debug!("{} attempt {} failed: {:#}", label, attempt + 1, err);
                    last_err = Some(err);
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed", label)))
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let url = format!("{}/api/v1/devices/register", self.base_url);
        let response: RegisterResponse = self
            .with_retry("register", || async {
                let resp = self
                    .http
                    .post(&url)
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| anyhow::Error::from(FleetError::Network(e.to_string())))?;
                decode_response(resp).await
            })
            .await?;
        self.set_credentials(&response.device_id, &response.api_key).await;
        Ok(response)
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse> {
        let creds = self.credentials().await?;
        let url = format!("{}/api/v1/devices/{}/heartbeat", self.base_url, creds.device_id);
        self.with_retry("heartbeat", || {
            let url = url.clone();
            let api_key = creds.api_key.clone();
            async move {
                let resp = self
                    .http
                    .post(&url)
                    .bearer_auth(&api_key)
                    .send()
                    .await
                    .map_err(|e| anyhow::Error::from(FleetError::Network(e.to_string())))?;
                decode_response(resp).await
            }
        })
        .await
    }

    pub async fn report_status(&self, report: &StatusReport) -> Result<AckResponse> {
        let creds = self.credentials().await?;
        let url = format!("{}/api/v1/devices/{}/status", self.base_url, creds.device_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&creds.api_key)
            .json(report)
            .send()
            .await
            .context("status report request failed")?;
        decode_response(resp).await
    }

    /// Plain JSON metric upload.
    pub async fn send_metrics(&self, metrics: &[Metric]) -> Result<AckResponse> {
        let body = serde_json::to_vec(&MetricsUpload { metrics: metrics.to_vec() })?;
        self.send_metrics_raw(body, None).await
    }

    /// Pre-encoded metric upload; `content_encoding` names the compression
    /// applied at the sink boundary (gzip or zstd).
    pub async fn send_metrics_raw(
        &self,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> Result<AckResponse> {
        let creds = self.credentials().await?;
        let url = format!("{}/api/v1/devices/{}/metrics", self.base_url, creds.device_id);
        let mut request = self
            .http
            .post(&url)
            .bearer_auth(&creds.api_key)
            .header("content-type", "application/json")
            .body(body);
        if let Some(encoding) = content_encoding {
            request = request.header("content-encoding", encoding);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| anyhow::Error::from(FleetError::Network(e.to_string())))?;
        decode_response(resp).await
    }

    /// Fetch the update the control plane currently has queued for this
    /// device, if any.
    pub async fn pending_update(&self) -> Result<Option<Update>> {
        let creds = self.credentials().await?;
        let url = format!("{}/api/v1/devices/{}/updates", self.base_url, creds.device_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&creds.api_key)
            .send()
            .await
            .map_err(|e| anyhow::Error::from(FleetError::Network(e.to_string())))?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode_response(resp).await
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        resp.json::<T>().await.context("failed to decode control plane response")
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(FleetError::NotFound("control plane returned 404".to_string()).into())
    } else {
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(FleetError::Network(format!("{}: {}", status, body)).into())
        } else {
            Err(anyhow::anyhow!("control plane rejected request: {} {}", status, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let client = ControlPlaneClient::new(
            "http://localhost:8080",
            RetryConfig { initial_backoff_ms: 100, backoff_multiplier: 2.0, max_backoff_secs: 1 },
        );
        assert_eq!(client.backoff(0), Duration::from_millis(100));
        assert_eq!(client.backoff(1), Duration::from_millis(200));
        assert_eq!(client.backoff(2), Duration::from_millis(400));
        // Capped at max_backoff
        assert_eq!(client.backoff(10), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn calls_before_registration_fail() {
        let client = ControlPlaneClient::new("http://localhost:8080", RetryConfig::default());
        assert!(client.heartbeat().await.is_err());
    }
}
