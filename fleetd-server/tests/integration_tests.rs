//! End-to-end control-plane tests: registry, API, and campaign
//! orchestration against fake device agents.

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Duration;

use fleetd_core::config::CampaignConfig;
use fleetd_core::types::SystemInfo;
use fleetd_server::{ApiState, CampaignOrchestrator, CampaignStatus, DeviceRegistry, ServerStore};

async fn control_plane() -> (tempfile::TempDir, ApiState, String) {
    let dir = tempfile::tempdir().unwrap();
    let store = ServerStore::open(dir.path().join("fleet.db").to_str().unwrap()).await.unwrap();
    let config = CampaignConfig {
        worker_max: 4,
        poll_interval_secs: 1,
        max_poll_failures: 3,
        device_timeout_secs: 30,
    };
    let state = ApiState {
        registry: Arc::new(DeviceRegistry::new(store.clone())),
        orchestrator: CampaignOrchestrator::new(store, config),
        admin_key: None,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = fleetd_server::router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (dir, state, format!("http://{}", addr))
}

/// Minimal fake device agent: accepts one update, reports healthy.
async fn fake_agent() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/v1/update", post(|| async { axum::http::StatusCode::ACCEPTED }))
        .route("/v1/health", get(|| async { axum::http::StatusCode::OK }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

async fn register(client: &reqwest::Client, base: &str, name: &str, agent_url: &str) -> (String, String) {
    let body: serde_json::Value = client
        .post(format!("{}/api/v1/devices/register", base))
        .json(&serde_json::json!({
            "name": name,
            "type": "sensor",
            "version": "0.3.0",
            "system_info": SystemInfo::default(),
            "agent_url": agent_url
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        body["device_id"].as_str().unwrap().to_string(),
        body["api_key"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn full_campaign_rollout_over_http() {
    let (_dir, _state, base) = control_plane().await;
    let client = reqwest::Client::new();

    let agent_url = fake_agent().await;
    let mut device_ids = Vec::new();
    for i in 0..3 {
        let (device_id, _key) =
            register(&client, &base, &format!("edge-{:02}", i), &agent_url).await;
        device_ids.push(device_id);
    }

    let created: serde_json::Value = client
        .post(format!("{}/api/v1/campaigns", base))
        .json(&serde_json::json!({
            "update": {
                "id": "u-rollout", "version": "2.0.0", "kind": "binary",
                "url": "http://cp/payload", "checksum": "ab"
            },
            "devices": device_ids
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let campaign_id = created["campaign_id"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let view: serde_json::Value = client
            .get(format!("{}/api/v1/campaigns/{}", base, campaign_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let progress = &view["progress"];
        let total = progress["total"].as_u64().unwrap();
        let sum = progress["pending"].as_u64().unwrap()
            + progress["running"].as_u64().unwrap()
            + progress["succeeded"].as_u64().unwrap()
            + progress["failed"].as_u64().unwrap();
        assert_eq!(sum, total);

        if view["status"] == serde_json::json!("completed") {
            assert_eq!(progress["succeeded"].as_u64().unwrap(), 3);
            break;
        }
        assert!(view["status"] != serde_json::json!("failed"), "campaign failed: {}", view);
        assert!(tokio::time::Instant::now() < deadline, "campaign did not finish in time");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
async fn heartbeat_reflects_queued_campaign_update() {
    let (_dir, state, base) = control_plane().await;
    let client = reqwest::Client::new();

    // A device that never accepts updates keeps the campaign device
    // non-terminal long enough to observe has_update
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/v1/update", post(|| async { axum::http::StatusCode::CONFLICT }))
        .route("/v1/health", get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let busy_agent = format!("http://{}", addr);

    let (device_id, api_key) = register(&client, &base, "edge-busy", &busy_agent).await;

    let campaign_id = state
        .orchestrator
        .create_campaign(
            serde_json::from_value(serde_json::json!({
                "id": "u-q", "version": "9.9", "kind": "binary",
                "url": "http://cp/payload", "checksum": "ff"
            }))
            .unwrap(),
            vec![device_id.clone()],
        )
        .await
        .unwrap();

    let beat: serde_json::Value = client
        .post(format!("{}/api/v1/devices/{}/heartbeat", base, device_id))
        .bearer_auth(&api_key)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(beat["has_update"], serde_json::json!(true));

    // The queued update is served to the agent
    let update = client
        .get(format!("{}/api/v1/devices/{}/updates", base, device_id))
        .bearer_auth(&api_key)
        .send()
        .await
        .unwrap();
    assert_eq!(update.status(), reqwest::StatusCode::OK);
    let update: serde_json::Value = update.json().await.unwrap();
    assert_eq!(update["id"], serde_json::json!("u-q"));

    let _ = state.orchestrator.cancel(&campaign_id).await;
}

#[tokio::test]
async fn pause_lets_in_flight_devices_finish() {
    let (_dir, state, _base) = control_plane().await;
    let agent_url = fake_agent().await;

    // Registering through the registry directly keeps this test focused
    // on orchestration
    let mut ids = Vec::new();
    for i in 0..6 {
        let response = state
            .registry
            .register(&fleetd_core::types::RegisterRequest {
                name: format!("edge-{}", i),
                device_type: "sensor".to_string(),
                version: "0.3.0".to_string(),
                hardware_id: None,
                system_info: SystemInfo::default(),
                agent_url: Some(agent_url.clone()),
            })
            .await
            .unwrap();
        ids.push(response.device_id);
    }

    let campaign_id = state
        .orchestrator
        .create_campaign(
            serde_json::from_value(serde_json::json!({
                "id": "u-p", "version": "1.1", "kind": "binary",
                "url": "http://cp/payload", "checksum": "cc"
            }))
            .unwrap(),
            ids,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    state.orchestrator.pause(&campaign_id).await.unwrap();

    // In-flight devices complete; paused campaign does not fail
    tokio::time::sleep(Duration::from_secs(3)).await;
    let view = state.orchestrator.status(&campaign_id).await.unwrap();
    assert_eq!(view.status, CampaignStatus::Paused);
    assert!(view.progress.failed == 0);

    state.orchestrator.resume(&campaign_id).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let view = state.orchestrator.status(&campaign_id).await.unwrap();
        if view.status == CampaignStatus::Completed {
            assert_eq!(view.progress.succeeded, view.progress.total);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "campaign stuck after resume");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
