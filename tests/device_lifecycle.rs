//! End-to-end device lifecycle tests
//!
//! These tests drive the registry and supervisor against a fake device
//! binary (a small shell script) so real processes are spawned, crashed
//! and reaped.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use emunet::device::{
    CapabilityProbe, DeviceError, DeviceRegistry, HealthSupervisor, RegistrySettings,
    SupervisorConfig,
};
use emunet::notify::ChannelSink;
use emunet::SettingsUpdate;

/// Write an executable shell script acting as the device binary
fn fake_device_binary(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-device");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Probe that reports an unprivileged process without capabilities
struct DeniedProbe;

impl CapabilityProbe for DeniedProbe {
    fn is_elevated(&self) -> bool {
        false
    }

    fn has_raw_net_capability(&self, _binary: &Path) -> std::io::Result<bool> {
        Ok(false)
    }
}

async fn registry_with_binary(dir: &TempDir, body: &str) -> Arc<DeviceRegistry> {
    let binary = fake_device_binary(dir.path(), body);
    let settings = RegistrySettings {
        binary: Some(binary),
        working_dir: dir.path().join("work"),
        host: "127.0.0.1".to_string(),
        device_type: "pc".to_string(),
    };
    let registry = Arc::new(DeviceRegistry::new(settings, Arc::new(DeniedProbe)));
    // keep the tests off the well-known default ranges
    registry
        .update_settings(SettingsUpdate {
            console_start_port: Some(48001),
            console_end_port: Some(48100),
            data_start_port: Some(49001),
            data_end_port: Some(49100),
            ..Default::default()
        })
        .await;
    registry
}

#[tokio::test]
async fn start_stop_reload_cycle() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with_binary(&dir, "sleep 30").await;

    let created = registry.create(None, Some("r1".to_string())).unwrap();
    registry.start(created.id).await.unwrap();

    // starting twice is rejected while the process is alive
    let err = registry.start(created.id).await.unwrap_err();
    assert!(matches!(err, DeviceError::AlreadyRunning(_)));

    registry.reload(created.id).await.unwrap();

    // stop is idempotent
    registry.stop(created.id).await.unwrap();
    registry.stop(created.id).await.unwrap();

    registry.delete(created.id).await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn delete_stops_a_running_instance() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with_binary(&dir, "sleep 30").await;

    let created = registry.create(None, None).unwrap();
    registry.start(created.id).await.unwrap();
    registry.delete(created.id).await.unwrap();

    assert!(matches!(
        registry.get(created.id),
        Err(DeviceError::NotFound(_))
    ));
    // narrow the pool to just the released port; creation only succeeds
    // if the delete really returned it
    registry
        .update_settings(SettingsUpdate {
            console_start_port: Some(created.console),
            console_end_port: Some(created.console),
            ..Default::default()
        })
        .await;
    let again = registry.create(None, None).unwrap();
    assert_eq!(again.console, created.console);
}

#[tokio::test]
async fn supervisor_reports_a_crashed_instance_once() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with_binary(&dir, "echo boom; exit 1").await;

    let created = registry.create(None, Some("flaky".to_string())).unwrap();
    registry.start(created.id).await.unwrap();

    // let the script exit
    sleep(Duration::from_millis(300)).await;

    let (sink, mut rx) = ChannelSink::new();
    let supervisor = HealthSupervisor::new(
        registry.clone(),
        Arc::new(sink),
        SupervisorConfig::default(),
    );

    supervisor.tick().await;

    let notification = rx.try_recv().expect("one notification");
    assert_eq!(notification.device_id, created.id);
    assert_eq!(notification.device_name, "flaky");
    assert!(notification.details.contains("boom"));
    assert!(rx.try_recv().is_err(), "exactly one notification");

    // the instance was reconciled to stopped; a second tick stays quiet
    supervisor.tick().await;
    assert!(rx.try_recv().is_err());

    // and the instance can be started again
    registry.start(created.id).await.unwrap();
    registry.delete(created.id).await.unwrap();
}

#[tokio::test]
async fn tap_endpoints_require_privilege_even_via_registry() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with_binary(&dir, "sleep 30").await;
    let created = registry.create(None, None).unwrap();

    let spec = serde_json::from_str(r#"{"type":"nio_tap","tap_device":"tap0"}"#).unwrap();
    let err = registry
        .add_endpoint(created.id, 0, 0, &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::PermissionDenied { .. }));
}

#[tokio::test]
async fn udp_wiring_between_two_instances() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with_binary(&dir, "sleep 30").await;

    let left = registry.create(None, Some("left".to_string())).unwrap();
    let right = registry.create(None, Some("right".to_string())).unwrap();

    let left_port = registry.allocate_data_port(left.id).unwrap();
    let right_port = registry.allocate_data_port(right.id).unwrap();
    assert_ne!(left_port, right_port);

    let to_right = emunet::EndpointSpec::Udp {
        lport: left_port,
        rhost: "127.0.0.1".to_string(),
        rport: right_port,
    };
    let to_left = emunet::EndpointSpec::Udp {
        lport: right_port,
        rhost: "127.0.0.1".to_string(),
        rport: left_port,
    };

    registry.add_endpoint(left.id, 0, 0, &to_right).await.unwrap();
    registry.add_endpoint(right.id, 0, 0, &to_left).await.unwrap();

    registry.remove_endpoint(left.id, 0, 0).await.unwrap();
    registry.remove_endpoint(right.id, 0, 0).await.unwrap();
}
