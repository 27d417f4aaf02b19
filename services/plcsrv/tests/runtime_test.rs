//! Runtime integration tests
//!
//! Drive the whole core (sessions, schedulers, broadcaster, commands) against
//! the in-memory PLC with tokio's paused clock.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use plcsrv::broadcaster::Latest;
use plcsrv::commands::PositionCommand;
use plcsrv::config::{DeviceEndpoint, MonitoredDevice};
use plcsrv::error::{PlcError, WriteError};
use plcsrv::transport::{S7Transport, SimulatedPlc};
use plcsrv::{Catalog, ConnectionState, DeviceId, DomainRecord, PlcConfig, PlcRuntime};

const ENDPOINT: &str = "s7-400";

fn config(devices: &[&str]) -> PlcConfig {
    PlcConfig {
        endpoints: vec![DeviceEndpoint {
            cycle_ms: 100,
            connect_timeout_ms: 500,
            max_retries: 2,
            retry_interval_ms: 100,
            keep_alive_ms: 60_000,
            ..Default::default()
        }],
        devices: devices
            .iter()
            .map(|id| MonitoredDevice {
                id: DeviceId::from(*id),
                endpoint: ENDPOINT.to_string(),
                cycle_ms: None,
            })
            .collect(),
        ..Default::default()
    }
}

async fn start(config: &PlcConfig, plc: &SimulatedPlc) -> PlcRuntime {
    let catalog = Arc::new(Catalog::builtin().unwrap());
    plc.load(
        catalog
            .devices()
            .flat_map(|d| catalog.simulated_values(d.id.as_str()))
            .collect::<Vec<_>>(),
    );
    let factory = {
        let plc = plc.clone();
        move |_endpoint: &str| -> Box<dyn S7Transport> { Box::new(plc.clone()) }
    };
    PlcRuntime::start(config, catalog, &factory).await.unwrap()
}

fn unavailable_reason(latest: Latest) -> String {
    match latest {
        Latest::Unavailable { reason, .. } => reason,
        Latest::Available(update) => panic!("expected unavailable, got {:?}", update),
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_devices_share_one_session_and_publish() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["tlv1", "tlv2", "ct", "pt"]), &plc).await;

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(plc.connect_calls(), 1);
    let broadcaster = runtime.broadcaster();
    for device in ["tlv1", "tlv2", "ct", "pt"] {
        let latest = broadcaster.latest(device);
        let update = latest.update().unwrap_or_else(|| panic!("{} has no record", device));
        assert!(update.sequence >= 2, "{} polled {} times", device, update.sequence);
    }
    assert!(matches!(
        broadcaster.latest("ct").update().unwrap().record,
        DomainRecord::TransferCart(_)
    ));

    // Seed values: TLV1 in semi-automatic mode, registration 12345 on board
    let tlv1 = broadcaster.latest("tlv1");
    let crane = tlv1.update().unwrap().record.as_crane().unwrap().clone();
    assert_eq!(crane.mode.label, "SEMIAUTOMÁTICO");
    assert_eq!(crane.position.registration, 12345);

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_sees_updates_in_order() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["pt"]), &plc).await;
    let (_handle, mut rx) = runtime.broadcaster().subscribe_queue("pt");

    let mut last = 0;
    for _ in 0..5 {
        let update = rx.recv().await.unwrap();
        assert!(update.sequence > last);
        last = update.sequence;
    }

    // Shutdown closes the queue; the receiver drains, then ends
    runtime.shutdown().await;
    while rx.recv().await.is_some() {}
    assert_eq!(rx.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_five_failures_force_exactly_one_reconnect() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["tlv1"]), &plc).await;
    let session = Arc::clone(runtime.session(ENDPOINT).unwrap());

    // First poll at t=0 succeeds, polls at 100..=500ms fail
    tokio::time::sleep(Duration::from_millis(50)).await;
    plc.fail_reads_always();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(plc.connect_calls(), 2);
    assert_eq!(session.stats().lost_connections, 1);
    assert_eq!(
        unavailable_reason(runtime.broadcaster().latest("tlv1")),
        "5 consecutive read failures"
    );

    // Failures restart from zero after the reconnect: no second reconnect
    // before another five failed polls
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(plc.connect_calls(), 2);

    // Recovery publishes again
    plc.heal();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(runtime.broadcaster().latest("tlv1").is_available());

    let stats = runtime.shutdown().await;
    assert_eq!(stats[&DeviceId::from("tlv1")].forced_reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_plc_loses_connection_once_per_failure_streak() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["tlv1", "tlv2", "ct", "pt"]), &plc).await;
    let session = Arc::clone(runtime.session(ENDPOINT).unwrap());

    // Every device fails its polls at 100..=500ms and hits the threshold on
    // the same tick
    tokio::time::sleep(Duration::from_millis(50)).await;
    plc.fail_reads_always();
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(plc.connect_calls(), 2);
    assert_eq!(session.stats().lost_connections, 1);
    assert_eq!(session.state(), ConnectionState::Connected);

    plc.heal();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for device in ["tlv1", "tlv2", "ct", "pt"] {
        assert!(runtime.broadcaster().latest(device).is_available(), "{}", device);
    }
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_write_position_while_disconnected() {
    let plc = SimulatedPlc::new();
    plc.fail_connects_always();
    let runtime = start(&config(&["tlv1"]), &plc).await;

    let command = PositionCommand {
        x: Some(15),
        ..Default::default()
    };
    let err = runtime
        .commands()
        .write_position("tlv1", &command)
        .await
        .unwrap_err();

    assert!(matches!(err, PlcError::Write(WriteError::NotConnected)));
    assert_eq!(plc.write_calls(), 0);
    assert!(!runtime.broadcaster().latest("tlv1").is_available());

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_plc_reported_as_persistent_failure() {
    let plc = SimulatedPlc::new();
    plc.fail_connects_always();
    let mut config = config(&["pt"]);
    config.scheduler.persistent_retry_ms = 1000;
    let runtime = start(&config, &plc).await;

    // Initial cycle failed during start; the scheduler runs two more
    // (max_retries) and then gives up
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(plc.connect_calls(), 6);
    let latest = runtime.broadcaster().latest("pt");
    assert!(latest.is_persistent_failure());
    let reason = unavailable_reason(latest);
    assert!(reason.starts_with("gave up after 2 reconnect cycles"), "reason: {}", reason);

    // No regular cycles while given up
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(plc.connect_calls(), 6);

    // The slow retry brings the device back once the PLC answers
    plc.heal();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(runtime.broadcaster().latest("pt").is_available());

    let stats = runtime.shutdown().await;
    assert_eq!(stats[&DeviceId::from("pt")].persistent_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_reconnects() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["tlv2"]), &plc).await;
    let session = Arc::clone(runtime.session(ENDPOINT).unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    plc.drop_connection();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(plc.is_connected());
    assert_eq!(session.stats().lost_connections, 1);
    assert!(runtime.broadcaster().latest("tlv2").is_available());

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_command_then_on_demand_read() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["tlv1"]), &plc).await;

    let command = PositionCommand {
        x: Some(15),
        aisle: Some(4),
        ..Default::default()
    };
    let receipt = runtime
        .commands()
        .write_position("tlv1", &command)
        .await
        .unwrap();
    assert!(receipt.verified);

    let record = runtime.broadcaster().request_on_demand("tlv1").await.unwrap();
    let crane = record.as_crane().unwrap();
    assert_eq!(crane.position.x, 15);
    assert_eq!(crane.position.aisle, 4);

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_and_reports() {
    let plc = SimulatedPlc::new();
    let runtime = start(&config(&["tlv1", "pt"]), &plc).await;
    let session = Arc::clone(runtime.session(ENDPOINT).unwrap());
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stats = runtime.shutdown().await;
    assert_eq!(stats.len(), 2);
    assert!(stats.values().all(|s| s.published >= 1));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!plc.is_connected());

    // Disconnecting again is harmless
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let plc = SimulatedPlc::new();
    let catalog = Arc::new(Catalog::builtin().unwrap());
    let factory = move |_endpoint: &str| -> Box<dyn S7Transport> { Box::new(plc.clone()) };

    let result = PlcRuntime::start(&config(&["tlv9"]), Arc::clone(&catalog), &factory).await;
    assert!(matches!(result, Err(PlcError::Catalog(_))));

    let mut bad_retries = config(&["tlv1"]);
    bad_retries.endpoints[0].max_retries = 0;
    let result = PlcRuntime::start(&bad_retries, catalog, &factory).await;
    assert!(matches!(result, Err(PlcError::Config(_))));
}
