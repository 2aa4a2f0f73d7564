use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::campaign::CampaignOrchestrator;
use crate::registry::{AuthError, DeviceRegistry};
use fleetd_core::error::FleetError;
use fleetd_core::types::{
    AckResponse, HeartbeatResponse, MetricsUpload, RegisterRequest, StatusReport, Update,
};

/// Shared state for the control-plane API.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<DeviceRegistry>,
    pub orchestrator: Arc<CampaignOrchestrator>,
    /// Operator bearer token for fleet-wide endpoints; `None` leaves them
    /// open (development mode).
    pub admin_key: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Device-facing surface (device api key auth, except register)
        .route("/api/v1/devices/register", post(register_device))
        .route("/api/v1/devices/:id/heartbeat", post(heartbeat))
        .route("/api/v1/devices/:id/status", post(report_status))
        .route("/api/v1/devices/:id/metrics", post(upload_metrics))
        .route("/api/v1/devices/:id/updates", get(pending_update))
        // Operator surface (admin bearer)
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .route("/api/v1/devices/:id", delete(delete_device))
        .route("/api/v1/campaigns", post(create_campaign))
        .route("/api/v1/campaigns/:id", get(campaign_status))
        .route("/api/v1/campaigns/:id/pause", post(pause_campaign))
        .route("/api/v1/campaigns/:id/resume", post(resume_campaign))
        .route("/api/v1/campaigns/:id/cancel", post(cancel_campaign))
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

async fn device_auth(
    state: &ApiState,
    headers: &HeaderMap,
    device_id: &str,
) -> Result<(), Response> {
    let Some(key) = bearer(headers) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "missing bearer token"));
    };
    match state.registry.authenticate(device_id, key).await {
        Ok(_) => Ok(()),
        Err(AuthError::UnknownDevice) => {
            Err(error_response(StatusCode::NOT_FOUND, "unknown device"))
        }
        Err(AuthError::InvalidKey) => {
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid api key"))
        }
    }
}

fn admin_auth(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    match &state.admin_key {
        None => Ok(()),
        Some(expected) if bearer(headers) == Some(expected.as_str()) => Ok(()),
        Some(_) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid operator token")),
    }
}

async fn register_device(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    match state.registry.register(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            warn!("Registration failed: {:#}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "registration failed")
        }
    }
}

async fn heartbeat(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = device_auth(&state, &headers, &device_id).await {
        return denied;
    }
    match state.registry.heartbeat(&device_id).await {
        Ok(true) => {
            let has_update = state.orchestrator.pending_update_for(&device_id).await.is_some();
            Json(HeartbeatResponse { has_update }).into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "unknown device"),
        Err(err) => {
            warn!("Heartbeat for {} failed: {:#}", device_id, err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "heartbeat failed")
        }
    }
}

async fn report_status(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<StatusReport>,
) -> Response {
    if let Err(denied) = device_auth(&state, &headers, &device_id).await {
        return denied;
    }
    match state.registry.report_status(&device_id, &report).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => {
            warn!("Status report for {} failed: {:#}", device_id, err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "status report failed")
        }
    }
}

/// Metric upload; the body may be gzip- or zstd-compressed per the
/// Content-Encoding header (applied at the agent's sink boundary).
async fn upload_metrics(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = device_auth(&state, &headers, &device_id).await {
        return denied;
    }

    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let decoded = match decode_body(&body, encoding) {
        Ok(decoded) => decoded,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err),
    };
    let upload: MetricsUpload = match serde_json::from_slice(&decoded) {
        Ok(upload) => upload,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("bad metrics body: {}", err));
        }
    };

    debug!("Device {} uploaded {} metrics", device_id, upload.metrics.len());
    match state.registry.record_metrics(&device_id, &upload.metrics).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => {
            warn!("Recording metrics for {} failed: {:#}", device_id, err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "metric ingestion failed")
        }
    }
}

fn decode_body(body: &[u8], encoding: &str) -> Result<Vec<u8>, String> {
    match encoding {
        "" | "identity" => Ok(body.to_vec()),
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|e| format!("bad gzip body: {}", e))?;
            Ok(decoded)
        }
        "zstd" => zstd::decode_all(body).map_err(|e| format!("bad zstd body: {}", e)),
        other => Err(format!("unsupported content-encoding: {}", other)),
    }
}

async fn pending_update(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = device_auth(&state, &headers, &device_id).await {
        return denied;
    }
    match state.orchestrator.pending_update_for(&device_id).await {
        Some(update) => Json(update).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(rename = "type")]
    device_type: Option<String>,
    status: Option<String>,
}

async fn list_devices(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state
        .registry
        .list_devices(query.device_type.as_deref(), query.status.as_deref())
        .await
    {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => {
            warn!("Device listing failed: {:#}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "listing failed")
        }
    }
}

async fn get_device(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.registry.get_device(&device_id).await {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown device"),
        Err(err) => {
            warn!("Device lookup failed: {:#}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed")
        }
    }
}

async fn delete_device(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.registry.delete_device(&device_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "unknown device"),
        Err(err) => {
            warn!("Device delete failed: {:#}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "delete failed")
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateCampaignRequest {
    update: Update,
    devices: Vec<String>,
}

async fn create_campaign(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateCampaignRequest>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.orchestrator.create_campaign(request.update, request.devices).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "campaign_id": id })),
        )
            .into_response(),
        Err(err) => {
            warn!("Campaign creation failed: {:#}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "campaign creation failed")
        }
    }
}

async fn campaign_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.orchestrator.status(&id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => fleet_error_response(err),
    }
}

async fn pause_campaign(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.orchestrator.pause(&id).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => fleet_error_response(err),
    }
}

async fn resume_campaign(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.orchestrator.resume(&id).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => fleet_error_response(err),
    }
}

async fn cancel_campaign(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = admin_auth(&state, &headers) {
        return denied;
    }
    match state.orchestrator.cancel(&id).await {
        Ok(()) => Json(AckResponse { success: true }).into_response(),
        Err(err) => fleet_error_response(err),
    }
}

fn fleet_error_response(err: FleetError) -> Response {
    let status = match &err {
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::Busy => StatusCode::CONFLICT,
        FleetError::Config(_) | FleetError::Verification(_) => StatusCode::BAD_REQUEST,
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
    use crate::store::ServerStore;
    use fleetd_core::config::CampaignConfig;
    use fleetd_core::types::{Metric, SystemInfo};

    async fn api_fixture(admin_key: Option<&str>) -> (tempfile::TempDir, ApiState, String) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ServerStore::open(dir.path().join("fleet.db").to_str().unwrap()).await.unwrap();
        let state = ApiState {
            registry: Arc::new(DeviceRegistry::new(store.clone())),
            orchestrator: CampaignOrchestrator::new(store, CampaignConfig::default()),
            admin_key: admin_key.map(str::to_string),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (dir, state, format!("http://{}", addr))
    }

    fn register_body() -> serde_json::Value {
        serde_json::json!({
            "name": "edge-01",
            "type": "sensor",
            "version": "0.3.0",
            "hardware_id": "hw-1",
            "system_info": SystemInfo::default(),
            "agent_url": "http://10.0.0.5:8088"
        })
    }

    #[tokio::test]
    async fn register_then_heartbeat_scenario() {
        let (_dir, _state, base) = api_fixture(None).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/v1/devices/register", base))
            .json(&register_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let registered: serde_json::Value = response.json().await.unwrap();
        let device_id = registered["device_id"].as_str().unwrap().to_string();
        let api_key = registered["api_key"].as_str().unwrap().to_string();

        // Heartbeat with the bearer key reports no pending update
        let beat = client
            .post(format!("{}/api/v1/devices/{}/heartbeat", base, device_id))
            .bearer_auth(&api_key)
            .send()
            .await
            .unwrap();
        assert_eq!(beat.status(), reqwest::StatusCode::OK);
        let beat: serde_json::Value = beat.json().await.unwrap();
        assert_eq!(beat["has_update"], serde_json::json!(false));

        // Unknown device ids are NotFound
        let missing = client
            .post(format!("{}/api/v1/devices/ghost/heartbeat", base))
            .bearer_auth(&api_key)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        // A wrong key is rejected
        let bad = client
            .post(format!("{}/api/v1/devices/{}/heartbeat", base, device_id))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn gzip_metric_upload_is_decoded() {
        let (_dir, state, base) = api_fixture(None).await;
        let client = reqwest::Client::new();

        let registered: serde_json::Value = client
            .post(format!("{}/api/v1/devices/register", base))
            .json(&register_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let device_id = registered["device_id"].as_str().unwrap().to_string();
        let api_key = registered["api_key"].as_str().unwrap().to_string();

        let metrics = vec![Metric::new("cpu", 1.5), Metric::new("mem", 2.5)];
        let json = serde_json::to_vec(&MetricsUpload { metrics }).unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &json).unwrap();
        let body = encoder.finish().unwrap();

        let response = client
            .post(format!("{}/api/v1/devices/{}/metrics", base, device_id))
            .bearer_auth(&api_key)
            .header("content-encoding", "gzip")
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(state.registry.store().metrics_count(&device_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn campaign_lifecycle_over_http() {
        let (_dir, _state, base) = api_fixture(None).await;
        let client = reqwest::Client::new();

        let created: serde_json::Value = client
            .post(format!("{}/api/v1/campaigns", base))
            .json(&serde_json::json!({
                "update": {
                    "id": "u-1", "version": "2.0", "kind": "binary",
                    "url": "http://cp/u", "checksum": "aa"
                },
                "devices": []
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["campaign_id"].as_str().unwrap();

        let status: serde_json::Value = client
            .get(format!("{}/api/v1/campaigns/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], serde_json::json!("completed"));

        let missing = client
            .get(format!("{}/api/v1/campaigns/none", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_key_guards_operator_surface() {
        let (_dir, _state, base) = api_fixture(Some("op-secret")).await;
        let client = reqwest::Client::new();

        let denied = client.get(format!("{}/api/v1/devices", base)).send().await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client
            .get(format!("{}/api/v1/devices", base))
            .bearer_auth("op-secret")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);

        // Device registration stays open
        let register = client
            .post(format!("{}/api/v1/devices/register", base))
            .json(&register_body())
            .send()
            .await
            .unwrap();
        assert_eq!(register.status(), reqwest::StatusCode::OK);
    }
}
