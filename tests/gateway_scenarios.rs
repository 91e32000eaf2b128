// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios driving a real `TcpListener` via [`GatewayServer`]
//! (spec §8 S1-S6), the nearest analog to the teacher's own
//! `transport/tcp/connection_tests.rs`.

use dny_gateway::codec::{encode, Frame};
use dny_gateway::config::GatewayConfig;
use dny_gateway::dispatcher::CMD_REGISTER;
use dny_gateway::registry::{DeviceId, DeviceState, Iccid};
use dny_gateway::GatewayServer;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const ICCID: &[u8; 20] = b"89860044816187006481";

/// Base config for scenarios that don't exercise the heartbeat timeout
/// itself: a generous timeout so the supervisor never interferes.
fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.tcp.host = "127.0.0.1".parse().unwrap();
    config.tcp.port = 0;
    config.device_connection.heartbeat_interval_seconds = 30;
    config.device_connection.heartbeat_timeout_seconds = 30;
    config.device_connection.startup_grace_seconds = 0;
    config.optimizer_batch_interval_ms = 20;
    config.optimizer_dedup_window_ms = 10;
    config
}

/// Config for scenarios that exercise the heartbeat timeout itself (S3, S4).
fn fast_timeout_config() -> GatewayConfig {
    let mut config = test_config();
    config.device_connection.heartbeat_interval_seconds = 1;
    config.device_connection.heartbeat_timeout_seconds = 1;
    config
}

fn registration_frame(physical_id: u32) -> Vec<u8> {
    let data = vec![0u8; 8];
    encode(&Frame::new(physical_id, 1, CMD_REGISTER, data))
}

/// Spawns a gateway, waits until it reports a bound address, and returns the
/// handle plus the background task driving `run()`.
async fn spawn_gateway(config: GatewayConfig) -> (GatewayServer, tokio::task::JoinHandle<()>) {
    let gateway = GatewayServer::new(config).unwrap();
    let run_handle = gateway.clone();
    let task = tokio::spawn(async move {
        run_handle.run().await.unwrap();
    });
    for _ in 0..100 {
        if gateway.local_addr().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (gateway, task)
}

/// `true` once a peer read observes EOF or a hard error; `false` (meaning
/// "not yet known to be closed") on `WouldBlock`, matching a connection
/// that is merely quiet rather than torn down.
fn peer_closed(stream: &TcpStream, buf: &mut [u8]) -> bool {
    match stream.try_read(buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

async fn wait_until<F: FnMut() -> bool>(mut predicate: F, timeout: Duration) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// S1 — happy path registration: ICCID then a registration frame brings the
/// Device online on the accepting connection.
#[tokio::test]
async fn s1_happy_path_registration() {
    let (gateway, task) = spawn_gateway(test_config()).await;
    let addr = gateway.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(ICCID).await.unwrap();
    stream.write_all(&registration_frame(0x04A2_6CF3)).await.unwrap();

    let device_id = DeviceId::from_physical_id(0x04A2_6CF3);
    let seen = wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(seen, "device never reached Online");

    let iccid = Iccid::parse(ICCID).unwrap();
    let group = gateway.lookup_group(&iccid).unwrap();
    assert_eq!(group.members.len(), 1);

    gateway.shutdown();
    task.await.unwrap();
}

/// S2 — a `"link"` keep-alive refreshes liveness without touching device
/// count or membership.
#[tokio::test]
async fn s2_link_keepalive_refreshes_liveness() {
    let (gateway, task) = spawn_gateway(test_config()).await;
    let addr = gateway.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(ICCID).await.unwrap();
    stream.write_all(&registration_frame(0x04A2_6CF4)).await.unwrap();

    let device_id = DeviceId::from_physical_id(0x04A2_6CF4);
    wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;

    let before = gateway.lookup_device(&device_id).unwrap().last_heartbeat_at;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    stream.write_all(b"link").await.unwrap();

    let advanced = wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.last_heartbeat_at >= before && d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(advanced);
    assert_eq!(gateway.device_count(), 1);

    gateway.shutdown();
    task.await.unwrap();
}

/// S3 — the supervisor closes an idle connection once the heartbeat timeout
/// elapses and suspends (not finalizes) the Device.
#[tokio::test]
async fn s3_heartbeat_timeout_suspends_device() {
    let (gateway, task) = spawn_gateway(fast_timeout_config()).await;
    let addr = gateway.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(ICCID).await.unwrap();
    stream.write_all(&registration_frame(0x04A2_6CF5)).await.unwrap();

    let device_id = DeviceId::from_physical_id(0x04A2_6CF5);
    wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;

    // Stop sending anything; the heartbeat engine should mark it
    // Reconnecting after heartbeatTimeoutSeconds + one check interval.
    let suspended = wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.state == DeviceState::Reconnecting)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(suspended, "device was not suspended after heartbeat timeout");

    // The connection itself should also have been asked to close.
    let mut buf = [0u8; 1];
    let closed = wait_until(
        || peer_closed(&stream, &mut buf),
        Duration::from_secs(2),
    )
    .await;
    assert!(closed);

    gateway.shutdown();
    task.await.unwrap();
}

/// S4 — reconnect/migration: while the old connection's Device is
/// `Reconnecting`, a new connection registering the same ICCID + physicalID
/// takes over, increments the reconnect counter, and leaves a single group
/// member.
#[tokio::test]
async fn s4_reconnect_migrates_device_to_new_connection() {
    let (gateway, task) = spawn_gateway(fast_timeout_config()).await;
    let addr = gateway.local_addr().unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(ICCID).await.unwrap();
    first.write_all(&registration_frame(0x04A2_6CF6)).await.unwrap();

    let device_id = DeviceId::from_physical_id(0x04A2_6CF6);
    wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;

    wait_until(
        || {
            gateway
                .lookup_device(&device_id)
                .is_some_and(|d| d.state == DeviceState::Reconnecting)
        },
        Duration::from_secs(5),
    )
    .await;
    let reconnect_count_before = gateway.lookup_device(&device_id).unwrap().reconnect_count;

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(ICCID).await.unwrap();
    second.write_all(&registration_frame(0x04A2_6CF6)).await.unwrap();

    let migrated = wait_until(
        || {
            gateway.lookup_device(&device_id).is_some_and(|d| {
                d.state == DeviceState::Online && d.reconnect_count == reconnect_count_before + 1
            })
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(migrated);

    let iccid = Iccid::parse(ICCID).unwrap();
    let group = gateway.lookup_group(&iccid).unwrap();
    assert_eq!(group.members.len(), 1);

    // The abandoned first connection had no members left and should have
    // been asked to close.
    let mut buf = [0u8; 1];
    let old_closed = wait_until(
        || peer_closed(&first, &mut buf),
        Duration::from_secs(2),
    )
    .await;
    assert!(old_closed);

    gateway.shutdown();
    task.await.unwrap();
}

/// S5 — a mutated checksum is rejected: the connection is closed and no
/// Device is created.
#[tokio::test]
async fn s5_checksum_rejection_closes_connection_without_registering() {
    let (gateway, task) = spawn_gateway(test_config()).await;
    let addr = gateway.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(ICCID).await.unwrap();
    let mut bad_frame = registration_frame(0x04A2_6CF7);
    *bad_frame.last_mut().unwrap() ^= 0xFF;
    stream.write_all(&bad_frame).await.unwrap();

    let mut buf = [0u8; 1];
    let closed = wait_until(
        || peer_closed(&stream, &mut buf),
        Duration::from_secs(2),
    )
    .await;
    assert!(closed);

    let device_id = DeviceId::from_physical_id(0x04A2_6CF7);
    assert!(gateway.lookup_device(&device_id).is_none());

    gateway.shutdown();
    task.await.unwrap();
}

/// S6 — daisy-chain: a second registration frame on the same connection
/// with a different physicalID but the same ICCID context joins a second
/// Device to the same group on the same connection.
#[tokio::test]
async fn s6_daisy_chain_adds_second_device_to_same_group() {
    let (gateway, task) = spawn_gateway(test_config()).await;
    let addr = gateway.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(ICCID).await.unwrap();
    stream.write_all(&registration_frame(0x04A2_6CF8)).await.unwrap();

    let primary = DeviceId::from_physical_id(0x04A2_6CF8);
    wait_until(
        || {
            gateway
                .lookup_device(&primary)
                .is_some_and(|d| d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;

    stream.write_all(&registration_frame(0x04A2_6CF9)).await.unwrap();
    let secondary = DeviceId::from_physical_id(0x04A2_6CF9);
    let joined = wait_until(
        || {
            gateway
                .lookup_device(&secondary)
                .is_some_and(|d| d.state == DeviceState::Online)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(joined);

    let iccid = Iccid::parse(ICCID).unwrap();
    let group = gateway.lookup_group(&iccid).unwrap();
    assert_eq!(group.members.len(), 2);
    assert!(group.members.contains(&primary));
    assert!(group.members.contains(&secondary));

    let primary_conn = gateway.lookup_device(&primary).unwrap().conn_id;
    let secondary_conn = gateway.lookup_device(&secondary).unwrap().conn_id;
    assert_eq!(primary_conn, secondary_conn);

    drop(stream);
    let both_removed = wait_until(
        || gateway.lookup_device(&primary).is_none() && gateway.lookup_device(&secondary).is_none(),
        Duration::from_secs(2),
    )
    .await;
    assert!(both_removed);
    assert!(gateway.lookup_group(&iccid).is_none());

    gateway.shutdown();
    task.await.unwrap();
}
