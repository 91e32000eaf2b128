// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-connection Reader task and handshake state machine (spec §4.2).
//!
//! Grounded on the teacher's `handle_connection` task (`server.rs`): one
//! `tokio::spawn` per accepted socket running a `tokio::select!` over
//! reading the next unit and draining an outbound queue for writes. This
//! generalizes that shape to DNY's handshake (raw ICCID / `"link"` / framed
//! messages) ahead of steady-state dispatch, and refreshes a read deadline
//! on every received byte rather than using one fixed per-call timeout.

use crate::codec::{self, DecodeOutcome, Unit};
use crate::dispatcher::{Dispatcher, HandlerContext, CMD_REGISTER};
use crate::emitter::{Event, EventEmitter};
use crate::optimizer::StatusOptimizer;
use crate::registry::{CloseReason, ConnCommand, ConnId, DeviceId, HandshakeState, Registry};
use crate::transport::writer::{self, OutboundMessage, WriteTimeouts, WriterExit};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tunables the connection task needs beyond what it reads off the wire
/// (spec §6.3).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub initial_read_deadline: Duration,
    pub default_read_deadline: Duration,
    pub heartbeat_timeout: Duration,
    pub max_packet_size: usize,
    pub dispatch_enqueue_timeout: Duration,
    pub write_timeouts: WriteTimeouts,
    pub outbound_queue_depth: usize,
}

/// Why a connection's task finished running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Closed(CloseReason),
}

/// Drives one accepted socket end to end: registers it with the Registry,
/// runs the handshake and steady-state read loop, and tears it down on
/// close (spec §4.2, §4.4).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    stream: TcpStream,
    remote_addr: SocketAddr,
    conn_id: ConnId,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    emitter: Arc<EventEmitter>,
    optimizer: Arc<StatusOptimizer>,
    config: ConnectionConfig,
    shutdown: Arc<tokio::sync::Notify>,
) -> ConnectionOutcome {
    let (read_half, write_half) = tokio::io::split(stream);

    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(config.outbound_queue_depth);
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ConnCommand>();

    registry.register_conn(conn_id, remote_addr, outbound_tx.clone(), cmd_tx);

    let writer_registry = registry.clone();
    let write_timeouts = config.write_timeouts;
    let writer_handle = tokio::spawn(async move {
        writer::run(conn_id, write_half, outbound_rx, write_timeouts, move |n| {
            writer_registry.touch_conn_tx(conn_id, n);
        })
        .await
    });

    let reason = read_loop(
        read_half,
        conn_id,
        remote_addr,
        &registry,
        &dispatcher,
        &emitter,
        &optimizer,
        &config,
        &mut cmd_rx,
        &shutdown,
    )
    .await;

    let members = registry.lookup_by_conn(conn_id);
    registry.on_conn_close(conn_id, reason);
    if !reason.is_temporary() {
        for device in members {
            emitter.publish(Event::DeviceOffline {
                device_id: device.device_id,
            });
        }
    }

    // The writer task exits on its own once the outbound sender (held by the
    // Registry) is dropped; join it so its socket is fully torn down before
    // this task returns.
    drop(outbound_tx);
    match writer_handle.await {
        Ok(WriterExit::WriteFailed) => debug!(%conn_id, "writer reported a failed write"),
        Ok(WriterExit::ChannelClosed) => {}
        Err(e) => warn!(%conn_id, error = %e, "writer task join error"),
    }

    info!(%conn_id, reason = reason.as_str(), "connection closed");
    ConnectionOutcome::Closed(reason)
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut read_half: ReadHalf<TcpStream>,
    conn_id: ConnId,
    remote_addr: SocketAddr,
    registry: &Arc<Registry>,
    dispatcher: &Arc<Dispatcher>,
    emitter: &Arc<EventEmitter>,
    optimizer: &Arc<StatusOptimizer>,
    config: &ConnectionConfig,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
    shutdown: &Arc<tokio::sync::Notify>,
) -> CloseReason {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut handshake_state = HandshakeState::Connected;

    loop {
        let deadline = read_deadline(handshake_state, config);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnCommand::Close(reason)) => return reason,
                    None => return CloseReason::NetworkDisconnect,
                }
            }

            _ = shutdown.notified() => {
                return CloseReason::AdminDisconnect;
            }

            read_result = tokio::time::timeout(deadline, read_half.read(&mut chunk)) => {
                let n = match read_result {
                    Err(_) => {
                        warn!(%conn_id, %remote_addr, "read deadline exceeded");
                        return if handshake_state == HandshakeState::Connected {
                            CloseReason::IdleTimeout
                        } else {
                            CloseReason::ReadTimeout
                        };
                    }
                    Ok(Err(e)) => {
                        debug!(%conn_id, error = %e, "read error");
                        return CloseReason::NetworkDisconnect;
                    }
                    Ok(Ok(0)) => {
                        return if buf.is_empty() {
                            debug!(%conn_id, "peer closed connection");
                            CloseReason::ClientShutdown
                        } else {
                            // A clean EOF with an incomplete unit still
                            // buffered: the peer hung up mid-frame rather
                            // than sending malformed bytes, so this is a
                            // quiet close, not a protocol error (spec §7
                            // "Truncated at EOF").
                            debug!(
                                %conn_id,
                                error = %crate::error::DecodeError::Truncated,
                                buffered = buf.len(),
                                "connection closed with a partial frame buffered"
                            );
                            CloseReason::ClientShutdown
                        };
                    }
                    Ok(Ok(n)) => n,
                };

                buf.extend_from_slice(&chunk[..n]);
                registry.touch_conn_rx(conn_id, n);

                match drain_units(
                    &mut buf,
                    conn_id,
                    registry,
                    dispatcher,
                    emitter,
                    optimizer,
                    config,
                    &mut handshake_state,
                )
                .await
                {
                    Ok(()) => {}
                    Err(reason) => return reason,
                }
            }
        }
    }
}

fn read_deadline(state: HandshakeState, config: &ConnectionConfig) -> Duration {
    match state {
        HandshakeState::Connected | HandshakeState::IccidReceived => config.initial_read_deadline,
        HandshakeState::Registered => config.default_read_deadline,
        HandshakeState::Online => config.heartbeat_timeout,
    }
}

/// Drains every complete unit currently available in `buf`, dispatching each
/// one, until the codec reports it needs more bytes.
#[allow(clippy::too_many_arguments)]
async fn drain_units(
    buf: &mut Vec<u8>,
    conn_id: ConnId,
    registry: &Arc<Registry>,
    dispatcher: &Arc<Dispatcher>,
    emitter: &Arc<EventEmitter>,
    optimizer: &Arc<StatusOptimizer>,
    config: &ConnectionConfig,
    handshake_state: &mut HandshakeState,
) -> Result<(), CloseReason> {
    loop {
        match codec::decode(buf, *handshake_state, config.max_packet_size) {
            DecodeOutcome::NeedMoreData => return Ok(()),
            DecodeOutcome::Resync { skip } => {
                buf.drain(..skip);
                continue;
            }
            DecodeOutcome::Error(e) => {
                warn!(%conn_id, error = %e, "decode error, closing connection");
                return Err(CloseReason::ProtocolError);
            }
            DecodeOutcome::Unit { unit, consumed } => {
                buf.drain(..consumed);
                handle_unit(
                    unit,
                    conn_id,
                    registry,
                    dispatcher,
                    emitter,
                    optimizer,
                    handshake_state,
                )?;
            }
        }
    }
}

fn handle_unit(
    unit: Unit,
    conn_id: ConnId,
    registry: &Arc<Registry>,
    dispatcher: &Arc<Dispatcher>,
    emitter: &Arc<EventEmitter>,
    optimizer: &Arc<StatusOptimizer>,
    handshake_state: &mut HandshakeState,
) -> Result<(), CloseReason> {
    match unit {
        Unit::Iccid(bytes) => {
            let Some(iccid) = crate::registry::Iccid::parse(&bytes) else {
                return Err(CloseReason::ProtocolError);
            };
            registry.set_conn_iccid(conn_id, iccid);
            registry.set_handshake_state(conn_id, HandshakeState::IccidReceived);
            *handshake_state = HandshakeState::IccidReceived;
            Ok(())
        }

        Unit::Link => {
            // Refreshes liveness for every device currently bound to this
            // connection; never dispatched, never changes state on its own
            // (spec §6.2, §8 S2).
            for device in registry.lookup_by_conn(conn_id) {
                optimizer.assert_status(device.device_id, device.iccid, crate::registry::DeviceState::Online);
            }
            Ok(())
        }

        Unit::Frame(frame) => {
            if frame.command == CMD_REGISTER {
                handle_registration(conn_id, &frame, registry, emitter, handshake_state)?;
            }

            let Some(outbound) = registry.conn_outbound(conn_id) else {
                // The connection was torn down concurrently (e.g. migrated
                // away mid-frame); nothing left to dispatch into.
                return Ok(());
            };
            let ctx = HandlerContext {
                conn_id,
                frame: &frame,
                registry,
                outbound: &outbound,
                optimizer,
                emitter,
            };
            dispatcher.dispatch(ctx);
            Ok(())
        }
    }
}

fn handle_registration(
    conn_id: ConnId,
    frame: &crate::codec::Frame,
    registry: &Arc<Registry>,
    emitter: &Arc<EventEmitter>,
    handshake_state: &mut HandshakeState,
) -> Result<(), CloseReason> {
    let Some(iccid) = registry.conn_iccid(conn_id) else {
        warn!(%conn_id, "registration frame before ICCID handshake");
        return Err(CloseReason::ProtocolError);
    };

    let device_id = DeviceId::from_physical_id(frame.physical_id);
    registry
        .bind(device_id.clone(), frame.physical_id, conn_id, iccid.clone())
        .map_err(|_| CloseReason::ProtocolError)?;

    registry.set_handshake_state(conn_id, HandshakeState::Registered);
    registry.set_handshake_state(conn_id, HandshakeState::Online);
    *handshake_state = HandshakeState::Online;

    emitter.publish(Event::DeviceRegistered {
        device_id: device_id.clone(),
        iccid,
    });
    emitter.publish(Event::DeviceOnline { device_id, conn_id });
    Ok(())
}
