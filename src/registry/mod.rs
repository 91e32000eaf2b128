// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Session & Group Registry (spec §4.4).
//!
//! The process-wide, concurrency-safe mapping fabric: `connID ↔ deviceID ↔
//! ICCID ↔ group`. See [`store::Registry`] for the public operations.

mod conn;
mod device;
mod group;
mod ids;
mod store;

pub use conn::{CloseReason, ConnCommand, ConnEntry, HandshakeState};
pub use device::{now_secs, Device, DeviceState};
pub use group::{Group, GroupStatus};
pub use ids::{ConnId, ConnIdGenerator, DeviceId, Iccid, SessionId};
pub use store::{ConnView, Registry};
