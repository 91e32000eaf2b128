// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection Writer (spec §4.3).
//!
//! A single task per connection serially drains a bounded `mpsc` channel of
//! outbound byte slices and writes them to the socket's write half, applying
//! a write deadline that differs by [`WriteClass`]. Grounded on the
//! teacher's `ClientConnectionHandle` (`server/relay.rs`): one `mpsc::Sender`
//! per connection stashed in a registry, with a single consumer owning the
//! actual write. The teacher has only one write path and one timeout; this
//! generalizes that to the four differentiated deadlines spec §4.3 requires.

use crate::registry::ConnId;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Write deadline class (spec §4.3, §6.3 `deviceConnection.timeouts.*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClass {
    /// Registration responses: the shorter `registerTimeoutSeconds`.
    Register,
    /// Heartbeat responses: `heartbeatResponseTimeoutSeconds`.
    HeartbeatResponse,
    /// Bulk data transfer: `dataTransferTimeoutSeconds`.
    DataTransfer,
    /// Everything else: `defaultWriteTimeoutSeconds`.
    Default,
}

/// One outbound write request handed to the Writer task.
#[derive(Debug)]
pub struct OutboundMessage {
    pub bytes: Vec<u8>,
    pub class: WriteClass,
}

impl OutboundMessage {
    pub fn new(bytes: Vec<u8>, class: WriteClass) -> Self {
        Self { bytes, class }
    }
}

/// Deadlines consulted by the Writer task, one per [`WriteClass`] (spec
/// §6.3).
#[derive(Debug, Clone, Copy)]
pub struct WriteTimeouts {
    pub register: Duration,
    pub heartbeat_response: Duration,
    pub data_transfer: Duration,
    pub default: Duration,
}

impl WriteTimeouts {
    pub fn for_class(&self, class: WriteClass) -> Duration {
        match class {
            WriteClass::Register => self.register,
            WriteClass::HeartbeatResponse => self.heartbeat_response,
            WriteClass::DataTransfer => self.data_transfer,
            WriteClass::Default => self.default,
        }
    }
}

/// Outcome of running a Writer task to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The outbound channel was closed (the owning connection is tearing
    /// down) with no write error.
    ChannelClosed,
    /// A write failed or timed out; the connection must be closed.
    WriteFailed,
}

/// Drains `rx`, writing each [`OutboundMessage`] to `sink` under its class's
/// deadline (spec §4.3). Returns once the channel closes or a write fails;
/// per §4.3 "a write error transitions the connection to `Closing` and
/// enqueues no further frames" — the caller is responsible for acting on
/// [`WriterExit::WriteFailed`] by closing the connection.
pub async fn run<W>(
    conn_id: ConnId,
    mut sink: W,
    mut rx: mpsc::Receiver<OutboundMessage>,
    timeouts: WriteTimeouts,
    bytes_tx_counter: impl Fn(usize),
) -> WriterExit
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let deadline = timeouts.for_class(msg.class);
        let len = msg.bytes.len();
        match tokio::time::timeout(deadline, sink.write_all(&msg.bytes)).await {
            Ok(Ok(())) => {
                bytes_tx_counter(len);
                debug!(%conn_id, bytes = len, class = ?msg.class, "wrote outbound frame");
            }
            Ok(Err(e)) => {
                warn!(%conn_id, error = %e, "write error, closing connection");
                return WriterExit::WriteFailed;
            }
            Err(_) => {
                warn!(%conn_id, class = ?msg.class, timeout = ?deadline, "write deadline exceeded");
                return WriterExit::WriteFailed;
            }
        }
    }
    WriterExit::ChannelClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnIdGenerator;

    #[tokio::test]
    async fn writes_all_queued_messages_in_order() {
        let mut buf = Vec::new();
        let (tx, rx) = mpsc::channel(8);
        let gen = ConnIdGenerator::new();
        let conn_id = gen.next();

        tx.send(OutboundMessage::new(vec![1, 2, 3], WriteClass::Register))
            .await
            .unwrap();
        tx.send(OutboundMessage::new(vec![4, 5], WriteClass::Default))
            .await
            .unwrap();
        drop(tx);

        let timeouts = WriteTimeouts {
            register: Duration::from_secs(5),
            heartbeat_response: Duration::from_secs(5),
            data_transfer: Duration::from_secs(30),
            default: Duration::from_secs(10),
        };

        let exit = run(conn_id, &mut buf, rx, timeouts, |_| {}).await;
        assert_eq!(exit, WriterExit::ChannelClosed);
        assert_eq!(buf, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn write_deadline_exceeded_reports_failure() {
        struct NeverReady;
        impl AsyncWrite for NeverReady {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &[u8],
            ) -> std::task::Poll<Result<usize, std::io::Error>> {
                std::task::Poll::Pending
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), std::io::Error>> {
                std::task::Poll::Pending
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), std::io::Error>> {
                std::task::Poll::Pending
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let gen = ConnIdGenerator::new();
        let conn_id = gen.next();
        tx.send(OutboundMessage::new(vec![1], WriteClass::Register))
            .await
            .unwrap();

        let timeouts = WriteTimeouts {
            register: Duration::from_millis(10),
            heartbeat_response: Duration::from_millis(10),
            data_transfer: Duration::from_millis(10),
            default: Duration::from_millis(10),
        };

        let exit = run(conn_id, NeverReady, rx, timeouts, |_| {}).await;
        assert_eq!(exit, WriterExit::WriteFailed);
    }
}
