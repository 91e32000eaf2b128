// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection transport: the Reader's handshake/dispatch loop and the
//! Writer's serialized outbound queue (spec §4.2, §4.3).

pub mod connection;
pub mod writer;

pub use connection::{ConnectionConfig, ConnectionOutcome};
