// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Identifier newtypes for the Registry's mapping fabric.
//!
//! Mirrors the role the teacher's `GuidPrefix = [u8; 12]` plays for RTPS
//! GUIDs: a distinct type per key space so the Registry's maps cannot be
//! indexed by the wrong kind of identifier by accident.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one accepted TCP connection, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
impl ConnId {
    pub fn default_for_test() -> Self {
        Self(1)
    }

    pub fn for_test(n: u64) -> Self {
        Self(n)
    }
}

/// Monotonic generator of [`ConnId`] values, one per accepted socket.
#[derive(Debug, Default)]
pub struct ConnIdGenerator(AtomicU64);

impl ConnIdGenerator {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> ConnId {
        ConnId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies a Device, derived from its `physicalID` as a hex string (spec
/// GLOSSARY: "the canonical deviceID is its hex text representation").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn from_physical_id(physical_id: u32) -> Self {
        Self(format!("{:08x}", physical_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 20-ASCII-digit SIM identifier, grouping co-located devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Iccid(String);

impl Iccid {
    /// Parses a 20-digit ASCII ICCID, per spec §4.1/§6.2.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 || !bytes.iter().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(String::from_utf8(bytes.to_vec()).ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iccid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-registration session identifier (spec §3, Device row).
pub type SessionId = uuid::Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_hex_of_physical_id() {
        let id = DeviceId::from_physical_id(0x04a26cf3);
        assert_eq!(id.as_str(), "04a26cf3");
    }

    #[test]
    fn conn_id_generator_is_monotonic_and_unique() {
        let gen = ConnIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn iccid_parse_accepts_20_digits() {
        let iccid = Iccid::parse(b"89860044816187006481").unwrap();
        assert_eq!(iccid.as_str(), "89860044816187006481");
    }

    #[test]
    fn iccid_parse_rejects_wrong_length() {
        assert!(Iccid::parse(b"123").is_none());
        assert!(Iccid::parse(b"898600448161870064811").is_none());
    }

    #[test]
    fn iccid_parse_rejects_non_digits() {
        assert!(Iccid::parse(b"8986004481618700648x").is_none());
    }
}
