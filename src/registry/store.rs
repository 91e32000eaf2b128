// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Session & Group Registry (spec §4.4).
//!
//! Grounded on the teacher's `ParticipantRegistry` (`server/registry.rs`):
//! `HashMap`-indexed entities with secondary indices kept consistent inside
//! the same method. Unlike the teacher, which wraps its whole registry in a
//! single `tokio::sync::RwLock`, this Registry is required to be a
//! synchronous, linearizable critical section with no I/O while the lock is
//! held (spec §4.4 Design Note, "coarse mutex vs. fine-grained") so it uses
//! `parking_lot::Mutex` instead of an async lock.

use super::conn::{CloseReason, ConnCommand, ConnEntry, HandshakeState};
use super::device::{now_secs, Device, DeviceState};
use super::group::Group;
use super::ids::{ConnId, DeviceId, Iccid};
use crate::error::RegistryError;
use crate::transport::writer::OutboundMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Read-only view of a connection returned by lookups, carrying the handles
/// needed to route outbound frames or request closure without re-entering
/// the Registry.
#[derive(Clone)]
pub struct ConnView {
    pub conn_id: ConnId,
    pub remote_addr: SocketAddr,
    pub handshake_state: HandshakeState,
    pub outbound: mpsc::Sender<OutboundMessage>,
    commands: mpsc::UnboundedSender<ConnCommand>,
}

impl ConnView {
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.commands.send(ConnCommand::Close(reason));
    }
}

struct RegistryInner {
    devices: HashMap<DeviceId, Device>,
    conns: HashMap<ConnId, ConnEntry>,
    /// Outbound sender per connection, kept alongside `conns` so `ConnView`
    /// can be built without threading it through every `ConnEntry` caller.
    outbound: HashMap<ConnId, mpsc::Sender<OutboundMessage>>,
    groups: HashMap<String, Group>,
}

impl RegistryInner {
    fn conn_view(&self, conn_id: ConnId) -> Option<ConnView> {
        let entry = self.conns.get(&conn_id)?;
        let outbound = self.outbound.get(&conn_id)?.clone();
        Some(ConnView {
            conn_id,
            remote_addr: entry.remote_addr,
            handshake_state: entry.handshake_state,
            outbound,
            commands: entry.commands_clone(),
        })
    }
}

/// Process-wide, concurrency-safe session and group registry (spec §4.4).
pub struct Registry {
    inner: Mutex<RegistryInner>,
    session_timeout_secs: u64,
}

impl Registry {
    pub fn new(session_timeout_secs: u64) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                devices: HashMap::new(),
                conns: HashMap::new(),
                outbound: HashMap::new(),
                groups: HashMap::new(),
            }),
            session_timeout_secs,
        }
    }

    /// Registers a freshly accepted connection before any frame is
    /// dispatched on it. Must be called before `bind` can succeed for any
    /// device on this connection.
    pub fn register_conn(
        &self,
        conn_id: ConnId,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<OutboundMessage>,
        commands: mpsc::UnboundedSender<ConnCommand>,
    ) {
        let mut inner = self.inner.lock();
        inner
            .conns
            .insert(conn_id, ConnEntry::new(conn_id, remote_addr, commands));
        inner.outbound.insert(conn_id, outbound);
    }

    /// Advances a connection's handshake state (spec §4.2). No-op if the
    /// connection is unknown (already closed).
    pub fn set_handshake_state(&self, conn_id: ConnId, state: HandshakeState) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.conns.get_mut(&conn_id) {
            entry.handshake_state = state;
        }
    }

    /// Stashes the ICCID recognised during the pre-registration handshake
    /// (spec §6.2) on the connection.
    pub fn set_conn_iccid(&self, conn_id: ConnId, iccid: Iccid) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.conns.get_mut(&conn_id) {
            entry.iccid = Some(iccid);
        }
    }

    /// The ICCID stashed on a connection during the pre-registration
    /// handshake, if any (spec §6.2).
    pub fn conn_iccid(&self, conn_id: ConnId) -> Option<Iccid> {
        let inner = self.inner.lock();
        inner.conns.get(&conn_id)?.iccid.clone()
    }

    pub fn touch_conn_rx(&self, conn_id: ConnId, bytes: usize) {
        let inner = self.inner.lock();
        if let Some(entry) = inner.conns.get(&conn_id) {
            entry.touch_rx(bytes);
        }
    }

    pub fn touch_conn_tx(&self, conn_id: ConnId, bytes: usize) {
        let inner = self.inner.lock();
        if let Some(entry) = inner.conns.get(&conn_id) {
            entry.touch_tx(bytes);
        }
    }

    /// The outbound sender for a connection, if it is still known to the
    /// Registry (a disconnect race may have already removed it).
    pub fn conn_outbound(&self, conn_id: ConnId) -> Option<mpsc::Sender<OutboundMessage>> {
        let inner = self.inner.lock();
        inner.outbound.get(&conn_id).cloned()
    }

    /// `bind(deviceID, connID, iccid)` (spec §4.4 table + "Device migration").
    pub fn bind(
        &self,
        device_id: DeviceId,
        physical_id: u32,
        conn_id: ConnId,
        iccid: Iccid,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if !inner.conns.contains_key(&conn_id) {
            return Err(RegistryError::ConnGone);
        }

        let prior_conn = inner.devices.get(&device_id).and_then(|d| d.conn_id);
        let is_new = !inner.devices.contains_key(&device_id);

        if let Some(old_conn) = prior_conn {
            if old_conn != conn_id {
                // Migration sequence (spec §4.4).
                if let Some(old_entry) = inner.conns.get_mut(&old_conn) {
                    old_entry.device_ids.remove(&device_id);
                    if old_entry.device_ids.is_empty() {
                        old_entry.request_close(CloseReason::DeviceMigrated);
                    }
                }
                if let Some(device) = inner.devices.get_mut(&device_id) {
                    device.state = DeviceState::Reconnecting;
                    device.conn_id = None;
                }
            }
        }

        if let Some(new_entry) = inner.conns.get_mut(&conn_id) {
            new_entry.device_ids.insert(device_id.clone());
            if new_entry.iccid.is_none() {
                new_entry.iccid = Some(iccid.clone());
            }
        }

        let device = inner
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| Device::new(device_id.clone(), physical_id, iccid.clone(), conn_id));

        device.conn_id = Some(conn_id);
        device.iccid = iccid.clone();
        if is_new {
            device.state = DeviceState::Registered;
        } else {
            device.state = DeviceState::Online;
            device.reconnect_count += 1;
        }
        device.last_heartbeat_at = now_secs();

        let group = inner
            .groups
            .entry(iccid.as_str().to_string())
            .or_insert_with(|| Group::new(iccid.clone(), device_id.clone()));
        group.members.insert(device_id);
        group.touch();

        Ok(())
    }

    /// `unbind(deviceID, reason)` (spec §4.4 table).
    pub fn unbind(&self, device_id: &DeviceId, reason: CloseReason) {
        let mut inner = self.inner.lock();
        self.unbind_locked(&mut inner, device_id, reason);
    }

    fn unbind_locked(&self, inner: &mut RegistryInner, device_id: &DeviceId, reason: CloseReason) {
        let Some(device) = inner.devices.get_mut(device_id) else {
            return;
        };

        if let Some(conn_id) = device.conn_id.take() {
            if let Some(entry) = inner.conns.get_mut(&conn_id) {
                entry.device_ids.remove(device_id);
            }
        }
        device.disconnect_count += 1;

        if reason.is_temporary() {
            device.state = DeviceState::Reconnecting;
            device.expires_at = now_secs() + self.session_timeout_secs;
        } else {
            device.state = DeviceState::Offline;
            let iccid_key = device.iccid.as_str().to_string();
            inner.devices.remove(device_id);
            if let Some(group) = inner.groups.get_mut(&iccid_key) {
                group.members.remove(device_id);
                if group.is_empty() {
                    inner.groups.remove(&iccid_key);
                }
            }
        }
    }

    /// `onConnClose(connID, reason)` (spec §4.4 table).
    pub fn on_conn_close(&self, conn_id: ConnId, reason: CloseReason) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.conns.remove(&conn_id) else {
            return;
        };
        inner.outbound.remove(&conn_id);
        let device_ids: Vec<DeviceId> = entry.device_ids.into_iter().collect();
        for device_id in device_ids {
            self.unbind_locked(&mut inner, &device_id, reason);
        }
    }

    /// `lookupByDevice(deviceID)`.
    pub fn lookup_by_device(&self, device_id: &DeviceId) -> Option<(ConnView, Device)> {
        let inner = self.inner.lock();
        let device = inner.devices.get(device_id)?.clone();
        let conn_id = device.conn_id?;
        let view = inner.conn_view(conn_id)?;
        Some((view, device))
    }

    /// `lookupByConn(connID)`.
    pub fn lookup_by_conn(&self, conn_id: ConnId) -> Vec<Device> {
        let inner = self.inner.lock();
        let Some(entry) = inner.conns.get(&conn_id) else {
            return Vec::new();
        };
        entry
            .device_ids
            .iter()
            .filter_map(|id| inner.devices.get(id).cloned())
            .collect()
    }

    /// `lookupByICCID(iccid)`.
    pub fn lookup_by_iccid(&self, iccid: &Iccid) -> Option<Group> {
        let inner = self.inner.lock();
        inner.groups.get(iccid.as_str()).cloned()
    }

    /// `touchHeartbeat(deviceID)`: advances liveness and revives the device
    /// to `Online` unless it has been finalized `Offline`.
    pub fn touch_heartbeat(&self, device_id: &DeviceId) -> bool {
        let mut inner = self.inner.lock();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return false;
        };
        device.last_heartbeat_at = now_secs();
        if device.state != DeviceState::Offline {
            device.state = DeviceState::Online;
        }
        true
    }

    /// Applies a status assertion flushed by the Status Update Optimizer
    /// (spec §4.7). No-op if the device no longer exists.
    pub fn apply_status(&self, device_id: &DeviceId, state: DeviceState) -> bool {
        let mut inner = self.inner.lock();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return false;
        };
        device.state = state;
        true
    }

    /// Snapshot of all `Online`/`Reconnecting` devices, for the Heartbeat
    /// Engine's scan (spec §4.5). Released before the caller acts on it, so
    /// no I/O happens while the Registry's lock is held.
    pub fn snapshot_live_devices(&self) -> Vec<Device> {
        let inner = self.inner.lock();
        inner.devices.values().filter(|d| d.is_live()).cloned().collect()
    }

    /// Finalizes every `Reconnecting` device whose retained session has
    /// passed `expires_at` to `Offline`, tearing down its group membership
    /// the same way `unbind_locked`'s permanent branch does (spec §3
    /// `Reconnecting -> Offline` on session-TTL expiry). There is no
    /// connection left to close by this point; the device was already
    /// unbound when it became `Reconnecting`. Returns the finalized device
    /// ids, for logging by the caller.
    pub fn finalize_expired_sessions(&self) -> Vec<DeviceId> {
        let mut inner = self.inner.lock();
        let now = now_secs();
        let expired: Vec<(DeviceId, String)> = inner
            .devices
            .values()
            .filter(|d| d.state == DeviceState::Reconnecting && d.expires_at <= now)
            .map(|d| (d.device_id.clone(), d.iccid.as_str().to_string()))
            .collect();

        for (device_id, iccid_key) in &expired {
            inner.devices.remove(device_id);
            if let Some(group) = inner.groups.get_mut(iccid_key) {
                group.members.remove(device_id);
                if group.is_empty() {
                    inner.groups.remove(iccid_key);
                }
            }
        }

        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// `forEach(fn)`: snapshot iteration over (deviceID, ConnView) pairs.
    pub fn for_each<F: FnMut(&DeviceId, &ConnView)>(&self, mut f: F) {
        let snapshot: Vec<(DeviceId, ConnView)> = {
            let inner = self.inner.lock();
            inner
                .devices
                .iter()
                .filter_map(|(id, d)| {
                    let conn_id = d.conn_id?;
                    inner.conn_view(conn_id).map(|v| (id.clone(), v))
                })
                .collect()
        };
        for (id, view) in &snapshot {
            f(id, view);
        }
    }

    pub fn device_count(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().conns.len()
    }

    pub fn group_count(&self) -> usize {
        self.inner.lock().groups.len()
    }

    /// Looks up a single device's current state without its connection
    /// (admin/introspection seam, spec's Supplemental module).
    pub fn device_snapshot(&self, device_id: &DeviceId) -> Option<Device> {
        self.inner.lock().devices.get(device_id).cloned()
    }

    /// Snapshot of every known group, for the admin/introspection seam.
    pub fn group_snapshot(&self) -> Vec<Group> {
        self.inner.lock().groups.values().cloned().collect()
    }
}
