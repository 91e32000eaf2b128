// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event Emitter (spec §4.8).
//!
//! Fan-out of session/device lifecycle events to subscribers, grounded on
//! the wider `hdds` crate's `engine::hub::Hub` (a `Vec` of subscriber
//! transports with a lossy, drop-and-count full-queue policy). This crate's
//! Emitter generalizes `Hub`'s fixed `Event` enum to the four kinds spec
//! §4.8 names and swaps `Hub`'s SPSC ring transport for a plain bounded
//! `tokio::sync::mpsc::Sender<Event>` per subscriber, since these events are
//! not a hot per-sample data path the way `Hub`'s are.

use crate::registry::{ConnId, DeviceId, Iccid};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle/state-change events published by the core (spec §4.8).
#[derive(Debug, Clone)]
pub enum Event {
    DeviceOnline { device_id: DeviceId, conn_id: ConnId },
    DeviceOffline { device_id: DeviceId },
    DeviceRegistered { device_id: DeviceId, iccid: Iccid },
    PortStatusChanged { device_id: DeviceId, port: u8, status: u8 },
}

/// Bound on each subscriber's queue; publication is fire-and-forget, so a
/// full queue drops the event rather than blocking the publisher (spec
/// §4.8).
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<Event>,
}

/// Process-wide event fan-out (spec §4.8).
pub struct EventEmitter {
    subscribers: RwLock<Vec<Subscriber>>,
    dropped: AtomicU64,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber and returns the receiving end of its
    /// queue (spec §6.4 `registerEventListener`).
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers.write().push(Subscriber { tx });
        rx
    }

    /// Publishes an event to every subscriber. Never blocks: a full
    /// subscriber queue drops the event and increments [`Self::dropped_count`]
    /// (spec §4.8 "a full queue drops the event and increments a counter").
    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.read();
        for sub in subs.iter() {
            if sub.tx.try_send(event.clone()).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("event subscriber queue full, dropping event");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
