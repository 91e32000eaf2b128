// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Connection entity as seen by the Registry (spec §3).
//!
//! The actual socket and its Reader/Writer tasks live in
//! [`crate::transport`]; the Registry only holds the lightweight routing and
//! bookkeeping handle described here, plus channels back into the owning
//! connection task so the Registry never performs I/O itself (spec §4.4
//! "delegated to a cleanup callback so the Registry never blocks on I/O").

use super::device::now_secs;
use super::ids::{ConnId, DeviceId, Iccid};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Per-connection handshake progress (spec §3, §4.1/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connected,
    IccidReceived,
    Registered,
    Online,
}

/// Reason a connection is being asked to close. Classified into temporary vs
/// permanent by [`Self::is_temporary`] (spec §4.4 "Close-reason
/// classification").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    ReadTimeout,
    NetworkDisconnect,
    HeartbeatTimeout,
    Overflow,
    ProtocolError,
    ClientShutdown,
    AdminDisconnect,
    /// The connection's last device migrated to a new connection, leaving
    /// it with no remaining members (spec §4.4, "Device migration" step 2).
    DeviceMigrated,
}

impl CloseReason {
    /// Temporary causes suspend the session (`→Reconnecting`); permanent
    /// causes finalize it (`→Offline`).
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            Self::IdleTimeout
                | Self::ReadTimeout
                | Self::NetworkDisconnect
                | Self::HeartbeatTimeout
                | Self::Overflow
                | Self::DeviceMigrated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::ReadTimeout => "read_timeout",
            Self::NetworkDisconnect => "network_disconnect",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Overflow => "overflow",
            Self::ProtocolError => "protocol_error",
            Self::ClientShutdown => "client_shutdown",
            Self::AdminDisconnect => "admin_disconnect",
            Self::DeviceMigrated => "device_migrated",
        }
    }
}

/// Fire-and-forget request sent to a connection's owning task.
#[derive(Debug)]
pub enum ConnCommand {
    /// Close the socket with the given reason. Never blocks the sender.
    Close(CloseReason),
}

/// The Registry's view of one live connection.
pub struct ConnEntry {
    pub conn_id: ConnId,
    pub remote_addr: SocketAddr,
    pub accepted_at: u64,
    pub last_rx_at: AtomicU64,
    pub last_tx_at: AtomicU64,
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub handshake_state: HandshakeState,
    pub iccid: Option<Iccid>,
    pub device_ids: BTreeSet<DeviceId>,
    /// Unbounded so the Registry's coarse mutex is never held across a
    /// blocking send; the owning connection task drains this promptly.
    commands: mpsc::UnboundedSender<ConnCommand>,
}

impl ConnEntry {
    pub fn new(
        conn_id: ConnId,
        remote_addr: SocketAddr,
        commands: mpsc::UnboundedSender<ConnCommand>,
    ) -> Self {
        let now = now_secs();
        Self {
            conn_id,
            remote_addr,
            accepted_at: now,
            last_rx_at: AtomicU64::new(now),
            last_tx_at: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            handshake_state: HandshakeState::Connected,
            iccid: None,
            device_ids: BTreeSet::new(),
            commands,
        }
    }

    pub fn touch_rx(&self, bytes: usize) {
        self.last_rx_at.store(now_secs(), Ordering::Relaxed);
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn touch_tx(&self, bytes: usize) {
        self.last_tx_at.store(now_secs(), Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn last_rx_at(&self) -> u64 {
        self.last_rx_at.load(Ordering::Relaxed)
    }

    /// Request the owning task close this connection. Never blocks; a
    /// disconnected receiver (connection already gone) is not an error.
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.commands.send(ConnCommand::Close(reason));
    }

    pub fn commands_clone(&self) -> mpsc::UnboundedSender<ConnCommand> {
        self.commands.clone()
    }
}

impl std::fmt::Debug for ConnEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnEntry")
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("handshake_state", &self.handshake_state)
            .field("device_ids", &self.device_ids)
            .finish()
    }
}
