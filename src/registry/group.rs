// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Group entity: devices sharing an ICCID (spec §3, §9 "Open questions").
//!
//! Consolidated to a single ICCID-keyed group per §9's Open Question
//! resolution (no separate connection-keyed notion).

use super::ids::{DeviceId, Iccid};
use super::device::now_secs;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Active,
    Idle,
}

/// Set of co-registered Devices sharing one ICCID.
#[derive(Debug, Clone)]
pub struct Group {
    pub iccid: Iccid,
    pub primary_device_id: DeviceId,
    pub members: BTreeSet<DeviceId>,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub status: GroupStatus,
}

impl Group {
    pub fn new(iccid: Iccid, primary_device_id: DeviceId) -> Self {
        let now = now_secs();
        let mut members = BTreeSet::new();
        members.insert(primary_device_id.clone());
        Self {
            iccid,
            primary_device_id,
            members,
            created_at: now,
            last_activity_at: now,
            status: GroupStatus::Active,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_activity_at = now_secs();
        self.status = GroupStatus::Active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_group_has_one_member() {
        let iccid = Iccid::parse(b"89860044816187006481").unwrap();
        let device_id = DeviceId::from_physical_id(1);
        let group = Group::new(iccid, device_id.clone());
        assert_eq!(group.members.len(), 1);
        assert!(group.members.contains(&device_id));
        assert!(!group.is_empty());
    }

    #[test]
    fn removing_last_member_makes_group_empty() {
        let iccid = Iccid::parse(b"89860044816187006481").unwrap();
        let device_id = DeviceId::from_physical_id(1);
        let mut group = Group::new(iccid, device_id.clone());
        group.members.remove(&device_id);
        assert!(group.is_empty());
    }
}
