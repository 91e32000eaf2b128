// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error types.
//!
//! Mirrors the small hand-rolled `enum ... Error` + `Display` + `std::error::Error`
//! pattern used throughout this codebase's error types, rather than pulling in
//! a derive-macro error crate.

use std::fmt;

/// Errors raised while decoding bytes off the wire (spec §7, decode errors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The 3-byte `"DNY"` magic was not found where expected.
    HeaderMagic,
    /// The frame's `length` field is outside the accepted range.
    LengthOutOfRange { len: u16, max: usize },
    /// The computed checksum did not match the trailing checksum field.
    Checksum { expected: u16, actual: u16 },
    /// The reader hit EOF before a full logical unit was available.
    Truncated,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderMagic => write!(f, "frame header magic mismatch"),
            Self::LengthOutOfRange { len, max } => {
                write!(f, "frame length {} out of range (max {})", len, max)
            }
            Self::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: expected {:#06x}, got {:#06x}", expected, actual)
            }
            Self::Truncated => write!(f, "connection closed mid-frame"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised by [`crate::registry::Registry`] operations (spec §4.4, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The referenced connection is not known to the registry.
    ConnGone,
    /// The referenced device/connection/ICCID has no registry entry.
    NotFound,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnGone => write!(f, "connection is gone"),
            Self::NotFound => write!(f, "entity not found"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Top-level gateway errors (binding, config, I/O).
#[derive(Debug)]
pub enum GatewayError {
    Config(String),
    Bind(String),
    AlreadyRunning,
    Io(std::io::Error),
    Decode(DecodeError),
    Registry(RegistryError),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {}", s),
            Self::Bind(s) => write!(f, "bind error: {}", s),
            Self::AlreadyRunning => write!(f, "gateway already running"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Registry(e) => write!(f, "registry error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for GatewayError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}
