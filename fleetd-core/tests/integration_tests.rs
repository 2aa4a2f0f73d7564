//! Integration tests for fleetd core components
//!
//! Exercises capability-driven storage selection and crash-safe state
//! persistence across simulated restarts.

use fleetd_core::capability::Capability;
use fleetd_core::platform::PlatformInfo;
use fleetd_core::state::{AgentStatus, StateManager};
use fleetd_core::types::Metric;

fn platform(ram_mb: u64, disk_mb: u64) -> PlatformInfo {
    PlatformInfo {
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        hostname: "it-host".to_string(),
        total_memory_bytes: ram_mb * 1024 * 1024,
        total_disk_bytes: disk_mb * 1024 * 1024,
        cpu_cores: 2,
    }
}

#[tokio::test]
async fn storage_factory_follows_tier() {
    let dir = tempfile::tempdir().unwrap();

    // Full tier gets the embedded store and a database file on disk
    let full = Capability::detect(&platform(2048, 64 * 1024));
    let store = fleetd_core::storage::open(&full, dir.path()).await.unwrap();
    store.store_metric(&Metric::new("m", 1.0)).await.unwrap();
    assert!(dir.path().join("fleet.db").exists());
    store.close().await;

    // Minimal tier stays purely in memory
    let minimal_dir = tempfile::tempdir().unwrap();
    let minimal = Capability::detect(&platform(32, 8));
    let ring = fleetd_core::storage::open(&minimal, minimal_dir.path()).await.unwrap();
    ring.store_metric(&Metric::new("m", 1.0)).await.unwrap();
    assert!(!minimal_dir.path().join("fleet.db").exists());
}

#[tokio::test]
async fn state_survives_interrupted_save() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let manager = StateManager::load(&root).await.unwrap();
    manager
        .update_and_save(|state| state.runtime.status = AgentStatus::Running)
        .await
        .unwrap();
    manager.save().await.unwrap();

    // Simulate a crash after the current file was renamed to .bak but
    // before the new content landed: the current file is gone entirely.
    let state_file = root.join("state").join("state.json");
    tokio::fs::remove_file(&state_file).await.unwrap();

    let recovered = StateManager::load(&root).await.unwrap();
    let state = recovered.snapshot().await;
    assert_eq!(state.runtime.status, AgentStatus::Running);
    assert!(state.events.iter().any(|e| e.kind == "state_recovered"));
}

#[tokio::test]
async fn unsynced_metrics_survive_restart_on_embedded_store() {
    let dir = tempfile::tempdir().unwrap();
    let capability = Capability::detect(&platform(2048, 64 * 1024));

    {
        let store = fleetd_core::storage::open(&capability, dir.path()).await.unwrap();
        for i in 0..4 {
            store
                .store_metric(&Metric::new(format!("boot.m{}", i), i as f64))
                .await
                .unwrap();
        }
        let first = store.unsynced_metrics(2).await.unwrap();
        let ids: Vec<i64> = first.iter().map(|s| s.id).collect();
        store.mark_synced(&ids).await.unwrap();
        store.close().await;
    }

    let store = fleetd_core::storage::open(&capability, dir.path()).await.unwrap();
    let unsynced = store.unsynced_metrics(10).await.unwrap();
    assert_eq!(unsynced.len(), 2);
    assert_eq!(unsynced[0].metric.name, "boot.m2");
}
