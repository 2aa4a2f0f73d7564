use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::agent::AgentHandle;
use crate::updater::UpdateStatus;
use fleetd_core::capability::Tier;
use fleetd_core::state::AgentStatus;
use fleetd_core::storage::StorageInfo;
use fleetd_core::types::{
    AckResponse, BinaryInfo, RegisterResponse, SystemInfo, SystemStats, Update,
};

/// Agent-local RPC surface consumed by operators and the campaign
/// orchestrator: device info, configuration, and update submission.
pub struct RpcServer {
    listener: tokio::net::TcpListener,
    handle: Arc<AgentHandle>,
}

#[derive(Debug, Serialize)]
pub struct DeviceInfoResponse {
    pub device_id: Option<String>,
    pub device_name: String,
    pub status: AgentStatus,
    pub tier: Tier,
    pub agent_version: String,
    pub system_info: SystemInfo,
    pub system_stats: SystemStats,
    pub deployed_binaries: Vec<BinaryInfo>,
    pub storage: StorageInfo,
    pub update: UpdateStatus,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    pub api_endpoint: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub degraded: bool,
}

pub async fn bind(handle: Arc<AgentHandle>, port: u16) -> Result<RpcServer> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind agent RPC port {}", port))?;
    Ok(RpcServer { listener, handle })
}

impl RpcServer {
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal flips; in-flight handlers get a
    /// bounded drain window from the agent's shutdown sequence.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        let app = router(self.handle);
        info!("Agent RPC listening on {}", addr);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .context("agent RPC server error")?;
        Ok(())
    }
}

pub fn router(handle: Arc<AgentHandle>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/info", get(device_info))
        .route("/v1/update", post(submit_update))
        .route("/v1/configure", post(configure_device))
        .route("/v1/config", post(update_config))
        .route("/v1/processes", get(list_processes))
        .route("/v1/processes/:name", axum::routing::put(deploy_process))
        .route("/v1/processes/:name/start", post(start_process))
        .route("/v1/processes/:name/stop", post(stop_process))
        .with_state(handle)
}

async fn health(State(handle): State<Arc<AgentHandle>>) -> Response {
    let degraded = handle.storage.info().await.degraded;
    let healthy = handle.is_healthy().await && !degraded;
    let body = Json(HealthResponse { healthy, degraded });
    if healthy {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn device_info(State(handle): State<Arc<AgentHandle>>) -> Json<DeviceInfoResponse> {
    let state = handle.state.snapshot().await;
    let config = handle.config.read().await;
    let mut binaries: Vec<BinaryInfo> =
        state.runtime.deployed_binaries.values().cloned().collect();
    binaries.sort_by(|a, b| a.name.cmp(&b.name));

    Json(DeviceInfoResponse {
        device_id: state.identity.as_ref().map(|id| id.device_id.clone()),
        device_name: config.device_name.clone(),
        status: state.runtime.status,
        tier: handle.capability.tier,
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        system_info: handle.platform.system_info(),
        system_stats: handle.platform.sample_stats(),
        deployed_binaries: binaries,
        storage: handle.storage.info().await,
        update: handle.updater.status().await,
    })
}

async fn submit_update(
    State(handle): State<Arc<AgentHandle>>,
    Json(update): Json<Update>,
) -> Response {
    info!("Received update manifest {} via RPC", update.id);
    // One update in flight per device: reject while the updater is busy
    // or the single-slot queue is occupied
    if handle.updater.status().await.phase.is_in_flight() {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "accepted": false, "error": "busy" })),
        )
            .into_response();
    }
    match handle.update_tx.try_send(update) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "accepted": true })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "accepted": false, "error": "busy" })),
        )
            .into_response(),
    }
}

async fn configure_device(
    State(handle): State<Arc<AgentHandle>>,
    Json(request): Json<ConfigureRequest>,
) -> Response {
    {
        let mut config = handle.config.write().await;
        if let Some(endpoint) = &request.api_endpoint {
            config.server_url = endpoint.clone();
        }
        if let Some(name) = &request.device_name {
            config.device_name = name.clone();
        }
        if let Some(path) = &handle.config_path {
            if let Err(err) = config.save(path).await {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", err));
            }
        }
    }

    // Re-registration under the new endpoint happens on next restart; the
    // current identity keeps working against the configured endpoint.
    let state = handle.state.snapshot().await;
    match state.identity {
        Some(identity) => Json(RegisterResponse {
            device_id: identity.device_id,
            api_key: identity.api_key,
        })
        .into_response(),
        None => error_response(StatusCode::CONFLICT, "device has not registered yet"),
    }
}

async fn update_config(
    State(handle): State<Arc<AgentHandle>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    let result = async {
        let mut config = handle.config.write().await;
        config.merge_json(&patch)?;
        if let Some(path) = &handle.config_path {
            config.save(path).await?;
        }
        anyhow::Ok(())
    }
    .await;

    match result {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &format!("{:#}", err)),
    }
}

async fn list_processes(State(handle): State<Arc<AgentHandle>>) -> Json<serde_json::Value> {
    let mut running = handle.supervisor.list().await;
    running.sort();
    Json(serde_json::json!({ "running": running }))
}

#[derive(Debug, Deserialize)]
struct DeployQuery {
    version: Option<String>,
}

/// Deploy a child binary: the body is the executable, written atomically
/// into the runtime dir.
async fn deploy_process(
    State(handle): State<Arc<AgentHandle>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    axum::extract::Query(query): axum::extract::Query<DeployQuery>,
    body: axum::body::Bytes,
) -> Response {
    let version = query.version.unwrap_or_else(|| "unversioned".to_string());
    match handle.supervisor.deploy(&name, &version, &body).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => fleet_error_response(&err),
    }
}

async fn start_process(
    State(handle): State<Arc<AgentHandle>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    Json(spec): Json<crate::supervisor::ProcessSpec>,
) -> Response {
    handle.specs.write().await.insert(name.clone(), spec.clone());
    match handle.supervisor.start(&name, spec).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => fleet_error_response(&err),
    }
}

async fn stop_process(
    State(handle): State<Arc<AgentHandle>>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Response {
    // Dropping the spec disables the restart policy for this child
    handle.specs.write().await.remove(&name);
    match handle.supervisor.stop(&name).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => fleet_error_response(&err),
    }
}

fn fleet_error_response(err: &fleetd_core::error::FleetError) -> Response {
    use fleetd_core::error::FleetError;
    let status = match err {
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::Busy => StatusCode::CONFLICT,
        FleetError::Process(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use fleetd_core::config::AgentConfig;

    async fn rpc_fixture() -> (tempfile::TempDir, Arc<AgentHandle>, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.data_dir = dir.path().join("data").to_string_lossy().to_string();
        let agent = Agent::new(config, None).await.unwrap();
        let handle = agent.handle();

        let server = bind(handle.clone(), 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        std::mem::forget(_tx);
        tokio::spawn(async move {
            let _ = server.serve(rx).await;
        });
        (dir, handle, format!("http://{}", addr))
    }

    #[tokio::test]
    async fn health_endpoint_reflects_agent_health() {
        let (_dir, _handle, base) = rpc_fixture().await;
        let response = reqwest::get(format!("{}/v1/health", base)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["healthy"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn info_endpoint_reports_tier_and_binaries() {
        let (_dir, _handle, base) = rpc_fixture().await;
        let response = reqwest::get(format!("{}/v1/info", base)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["tier"].is_string());
        assert!(body["deployed_binaries"].is_array());
        assert_eq!(body["update"]["phase"], serde_json::json!("idle"));
    }

    #[tokio::test]
    async fn second_update_submission_reports_busy() {
        let (_dir, _handle, base) = rpc_fixture().await;
        let client = reqwest::Client::new();
        let update = serde_json::json!({
            "id": "u-1", "version": "1.0", "kind": "binary",
            "url": "http://127.0.0.1:9/none", "checksum": "00"
        });

        // The agent's update processor is not running in this fixture, so
        // the first submission parks in the single-slot queue
        let first = client
            .post(format!("{}/v1/update", base))
            .json(&update)
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);

        let second = client
            .post(format!("{}/v1/update", base))
            .json(&update)
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(body["error"], serde_json::json!("busy"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_lifecycle_over_rpc() {
        let (_dir, _handle, base) = rpc_fixture().await;
        let client = reqwest::Client::new();

        let deploy = client
            .put(format!("{}/v1/processes/sleeper?version=1.2.0", base))
            .body(b"#!/bin/sh\nsleep 30\n".to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(deploy.status(), reqwest::StatusCode::OK);

        let start = client
            .post(format!("{}/v1/processes/sleeper/start", base))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(start.status(), reqwest::StatusCode::OK);

        let list: serde_json::Value = client
            .get(format!("{}/v1/processes", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["running"], serde_json::json!(["sleeper"]));

        let stop = client
            .post(format!("{}/v1/processes/sleeper/stop", base))
            .send()
            .await
            .unwrap();
        assert_eq!(stop.status(), reqwest::StatusCode::OK);

        let list: serde_json::Value = client
            .get(format!("{}/v1/processes", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["running"], serde_json::json!([]));

        // Starting an undeployed binary is NotFound
        let missing = client
            .post(format!("{}/v1/processes/ghost/start", base))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_patch_via_rpc() {
        let (_dir, handle, base) = rpc_fixture().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/config", base))
            .json(&serde_json::json!({ "heartbeat_interval_secs": 77 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(handle.config.read().await.heartbeat_interval_secs, 77);
    }
}
