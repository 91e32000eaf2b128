// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dispatcher (spec §4.6, §6.4).
//!
//! Routes a decoded [`Frame`](crate::codec::Frame) by its command byte to a
//! handler. Grounded on the teacher's `process_message` match over
//! `DiscoveryMessage` variants (`server.rs`): there, the command space is a
//! fixed compiled enum; here it is data-driven (business-level handlers
//! register commands at startup via [`Dispatcher::register_handler`], spec
//! §6.4), so the match becomes a `HashMap<u8, HandlerFn>`. Unknown commands
//! fall through to a default handler that logs and drops, mirroring the
//! teacher's catch-all arms (`DiscoveryMessage::Data { .. }` when relay is
//! disabled, `ParticipantAck` on the server side) which never close the
//! connection.

use crate::codec::Frame;
use crate::emitter::EventEmitter;
use crate::optimizer::StatusOptimizer;
use crate::registry::{ConnId, Registry};
use crate::transport::writer::OutboundMessage;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Device registration (spec §4.6): finalizes the handshake.
pub const CMD_REGISTER: u8 = 0x20;
/// Plain heartbeat (spec §4.6): touches liveness, no further state change.
pub const CMD_HEARTBEAT: u8 = 0x01;

/// Everything a handler needs: the frame, which connection it arrived on,
/// the Registry, and this connection's outbound queue (spec §6.4 `fn(frame,
/// conn, registry, writer)`).
pub struct HandlerContext<'a> {
    pub conn_id: ConnId,
    pub frame: &'a Frame,
    pub registry: &'a Registry,
    pub outbound: &'a mpsc::Sender<OutboundMessage>,
    pub optimizer: &'a StatusOptimizer,
    /// Lets a registered handler publish `PortStatusChanged` (spec §4.6,
    /// "handlers MUST call the Event Emitter" for port-status changes).
    pub emitter: &'a EventEmitter,
}

/// A registered command handler (spec §6.4 `registerHandler(command, fn)`).
pub type HandlerFn = Arc<dyn Fn(&HandlerContext<'_>) + Send + Sync>;

/// Routes decoded frames to handlers by command byte (spec §4.6).
pub struct Dispatcher {
    handlers: HashMap<u8, HandlerFn>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Builds a Dispatcher with the core's built-in heartbeat handler
    /// already registered (spec §4.6 "reserved command semantics"). Device
    /// registration (`0x20`) is handled directly by the connection task's
    /// handshake state machine (spec §4.2), not through this table, since it
    /// must run before the connection can be considered `Online`.
    pub fn new() -> Self {
        let mut handlers: HashMap<u8, HandlerFn> = HashMap::new();
        handlers.insert(CMD_HEARTBEAT, Arc::new(handle_heartbeat));
        Self { handlers }
    }

    /// Registers (or overrides) a handler for `command` (spec §6.4).
    pub fn register_handler(&mut self, command: u8, handler: HandlerFn) {
        self.handlers.insert(command, handler);
    }

    /// Dispatches one frame. A handler panic is caught here and logged with
    /// the frame's identifiers rather than propagating across the
    /// connection's task boundary (spec §7 "Handler panics").
    pub fn dispatch(&self, ctx: HandlerContext<'_>) {
        let command = ctx.frame.command;
        match self.handlers.get(&command) {
            Some(handler) => {
                let result = catch_unwind(AssertUnwindSafe(|| handler(&ctx)));
                if result.is_err() {
                    error!(
                        conn_id = %ctx.conn_id,
                        command,
                        physical_id = ctx.frame.physical_id,
                        message_id = ctx.frame.message_id,
                        "handler panicked"
                    );
                }
            }
            None => {
                trace!(conn_id = %ctx.conn_id, command, "no handler registered, dropping frame");
            }
        }
    }
}

fn handle_heartbeat(ctx: &HandlerContext<'_>) {
    let device_id = crate::registry::DeviceId::from_physical_id(ctx.frame.physical_id);
    if let Some((_, device)) = ctx.registry.lookup_by_device(&device_id) {
        ctx.optimizer
            .assert_status(device_id, device.iccid.clone(), crate::registry::DeviceState::Online);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnIdGenerator, Iccid};
    use std::time::Duration;

    fn test_registry_with_device() -> (
        Arc<Registry>,
        Arc<StatusOptimizer>,
        crate::registry::ConnId,
        crate::registry::DeviceId,
    ) {
        let registry = Arc::new(Registry::new(1800));
        let gen = ConnIdGenerator::new();
        let conn_id = gen.next();
        let (tx, _rx) = mpsc::channel(8);
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        registry.register_conn(conn_id, "127.0.0.1:9000".parse().unwrap(), tx, cmd_tx);
        let device_id = crate::registry::DeviceId::from_physical_id(7);
        registry
            .bind(device_id.clone(), 7, conn_id, Iccid::parse(b"89860044816187006481").unwrap())
            .unwrap();
        let optimizer = Arc::new(StatusOptimizer::new(registry.clone(), Duration::from_secs(1)));
        (registry, optimizer, conn_id, device_id)
    }

    #[test]
    fn built_in_heartbeat_handler_touches_liveness() {
        let (registry, optimizer, conn_id, device_id) = test_registry_with_device();
        let dispatcher = Dispatcher::new();
        let emitter = EventEmitter::new();
        let frame = Frame::new(7, 1, CMD_HEARTBEAT, vec![]);
        let (tx, _rx) = mpsc::channel(8);

        dispatcher.dispatch(HandlerContext {
            conn_id,
            frame: &frame,
            registry: &registry,
            outbound: &tx,
            optimizer: &optimizer,
            emitter: &emitter,
        });
        optimizer.flush_pending();

        let (_, device) = registry.lookup_by_device(&device_id).unwrap();
        assert!(device.last_heartbeat_at > 0);
    }

    #[test]
    fn unknown_command_is_dropped_without_panicking() {
        let (registry, optimizer, conn_id, _) = test_registry_with_device();
        let dispatcher = Dispatcher::new();
        let emitter = EventEmitter::new();
        let frame = Frame::new(7, 1, 0xFE, vec![]);
        let (tx, _rx) = mpsc::channel(8);

        dispatcher.dispatch(HandlerContext {
            conn_id,
            frame: &frame,
            registry: &registry,
            outbound: &tx,
            optimizer: &optimizer,
            emitter: &emitter,
        });
    }

    #[test]
    fn registered_handler_is_invoked() {
        let (registry, optimizer, conn_id, _) = test_registry_with_device();
        let mut dispatcher = Dispatcher::new();
        let emitter = EventEmitter::new();
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        dispatcher.register_handler(
            0x50,
            Arc::new(move |_ctx| {
                called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        let frame = Frame::new(7, 1, 0x50, vec![]);
        let (tx, _rx) = mpsc::channel(8);
        dispatcher.dispatch(HandlerContext {
            conn_id,
            frame: &frame,
            registry: &registry,
            outbound: &tx,
            optimizer: &optimizer,
            emitter: &emitter,
        });

        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn handler_panic_is_caught_and_does_not_propagate() {
        let (registry, optimizer, conn_id, _) = test_registry_with_device();
        let mut dispatcher = Dispatcher::new();
        let emitter = EventEmitter::new();
        dispatcher.register_handler(0x51, Arc::new(|_ctx| panic!("boom")));

        let frame = Frame::new(7, 1, 0x51, vec![]);
        let (tx, _rx) = mpsc::channel(8);
        dispatcher.dispatch(HandlerContext {
            conn_id,
            frame: &frame,
            registry: &registry,
            outbound: &tx,
            optimizer: &optimizer,
            emitter: &emitter,
        });
        // Reaching here means the panic did not unwind past dispatch().
    }
}
