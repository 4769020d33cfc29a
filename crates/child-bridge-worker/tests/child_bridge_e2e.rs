//! Supervisor driving the real worker binary over a socket pair
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use child_bridge::config::{JsonFileStore, PluginType};
use child_bridge::process::OsLauncher;
use child_bridge::{
    BridgeOptions, ChildBridgeHandle, ChildBridgeState, ChildBridgeSupervisor, HomebridgeConfig, PluginConfig,
    PluginIdentity, ShutdownSignal, SupervisorConfig, SupervisorSettings,
};

const WAIT: Duration = Duration::from_secs(20);

fn write_document(dir: &TempDir, identifier: &str) -> HomebridgeConfig {
    let document = serde_json::json!({
        "bridge": { "name": "Homebridge", "username": "CC:22:3D:E3:CE:30", "pin": "031-45-154" },
        "platforms": [
            {
                "platform": identifier,
                "name": "Pulse",
                "interval": 1,
                "_bridge": { "username": "0E:AA:BB:CC:DD:EE", "port": 51901 }
            }
        ]
    });
    std::fs::write(dir.path().join("config.json"), document.to_string()).unwrap();
    serde_json::from_value(document).unwrap()
}

fn spawn(dir: &TempDir, identifier: &str, settings: SupervisorSettings, shutdown: &ShutdownSignal) -> ChildBridgeHandle {
    let document = write_document(dir, identifier);
    let options = BridgeOptions {
        custom_storage_path: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let identity = PluginIdentity::new(
        PluginType::Platform,
        identifier,
        "homebridge-heartbeat",
        dir.path().join("node_modules/homebridge-heartbeat"),
    );
    let entry = PluginConfig::from_entry(&document.platforms[0]).unwrap();
    let config = SupervisorConfig::new(identity, entry, document, options.clone())
        .unwrap()
        .with_settings(settings);

    let launcher = Arc::new(OsLauncher::new(env!("CARGO_BIN_EXE_child-bridge-worker")));
    let store = Arc::new(JsonFileStore::new(options.config_path()));

    ChildBridgeSupervisor::spawn(config, launcher, store, shutdown.subscribe())
}

#[tokio::test]
async fn test_worker_reaches_active_and_shuts_down() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();
    let handle = spawn(&dir, "Heartbeat", SupervisorSettings::default(), &shutdown);

    let state = timeout(WAIT, handle.wait_for_state(|s| s == ChildBridgeState::Active))
        .await
        .expect("worker never became active");
    assert_eq!(state, ChildBridgeState::Active);

    let meta = handle.metadata().await.unwrap();
    assert!(meta.pid.is_some());
    assert_eq!(meta.name, "Pulse");

    shutdown.trigger();
    timeout(WAIT, handle.terminated())
        .await
        .expect("worker did not terminate");
    assert_eq!(handle.state(), ChildBridgeState::Terminated);
}

#[tokio::test]
async fn test_unknown_plugin_crash_is_restarted() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();
    let settings = SupervisorSettings::default().with_restart_delay(Duration::from_millis(200));
    let handle = spawn(&dir, "NoSuchPlatform", settings, &shutdown);

    timeout(WAIT, async {
        loop {
            let meta = handle.metadata().await.unwrap();
            if meta.restart_count >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("worker was never restarted");

    shutdown.trigger();
    timeout(WAIT, handle.terminated())
        .await
        .expect("supervisor did not terminate");
}

#[tokio::test]
async fn test_refresh_reads_config_from_disk() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();
    let handle = spawn(&dir, "Heartbeat", SupervisorSettings::default(), &shutdown);

    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap()).unwrap();
    document["platforms"][0]["name"] = "Renamed".into();
    std::fs::write(dir.path().join("config.json"), document.to_string()).unwrap();

    handle.refresh_config().await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.plugin_config.name.as_deref(), Some("Renamed"));

    shutdown.trigger();
    timeout(WAIT, handle.terminated())
        .await
        .expect("supervisor did not terminate");
}
