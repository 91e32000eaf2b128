// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Device entity and its state machine (spec §3).

use super::ids::{ConnId, DeviceId, Iccid, SessionId};
use std::time::{SystemTime, UNIX_EPOCH};

/// Device lifecycle state (spec §3, "State of a Device").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Connected,
    IccidReceived,
    Registered,
    Online,
    Reconnecting,
    Offline,
    Error,
}

/// A physical charging device, retained across reconnects until session
/// expiry.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: DeviceId,
    pub physical_id: u32,
    pub iccid: Iccid,
    pub conn_id: Option<ConnId>,
    pub state: DeviceState,
    /// Unix epoch seconds of the last accepted heartbeat/activity.
    pub last_heartbeat_at: u64,
    pub connect_count: u64,
    pub disconnect_count: u64,
    pub reconnect_count: u64,
    pub session_id: SessionId,
    /// Unix epoch seconds after which the retained session is discarded.
    pub expires_at: u64,
}

impl Device {
    pub fn new(device_id: DeviceId, physical_id: u32, iccid: Iccid, conn_id: ConnId) -> Self {
        let now = now_secs();
        Self {
            device_id,
            physical_id,
            iccid,
            conn_id: Some(conn_id),
            state: DeviceState::Registered,
            last_heartbeat_at: now,
            connect_count: 1,
            disconnect_count: 0,
            reconnect_count: 0,
            session_id: SessionId::new_v4(),
            expires_at: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, DeviceState::Online | DeviceState::Reconnecting)
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_device_starts_registered_and_live_after_touch() {
        let device = Device::new(
            DeviceId::from_physical_id(1),
            1,
            Iccid::parse(b"89860044816187006481").unwrap(),
            ConnId::default_for_test(),
        );
        assert_eq!(device.state, DeviceState::Registered);
        assert_eq!(device.connect_count, 1);
        assert_eq!(device.reconnect_count, 0);
    }

    #[test]
    fn online_and_reconnecting_are_live() {
        let mut device = Device::new(
            DeviceId::from_physical_id(1),
            1,
            Iccid::parse(b"89860044816187006481").unwrap(),
            ConnId::default_for_test(),
        );
        device.state = DeviceState::Online;
        assert!(device.is_live());
        device.state = DeviceState::Reconnecting;
        assert!(device.is_live());
        device.state = DeviceState::Offline;
        assert!(!device.is_live());
    }
}
