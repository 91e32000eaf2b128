// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Heartbeat / Timeout Engine (spec §4.5).
//!
//! A single supervisor task, grounded on the teacher's lease-checker
//! (`server.rs`: `tokio::spawn` loop, `tokio::select! { _ = sleep(interval)
//! => ..., _ = shutdown.notified() => break }` calling
//! `registry.remove_expired(lease_duration)`). This generalizes that single
//! sweep into the spec's four-step tick: compute the timeout threshold,
//! scan live devices, close stale ones, and warn on devices approaching
//! their deadline.

use crate::registry::{CloseReason, Registry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Supervises device liveness on a fixed interval (spec §4.5).
pub struct HeartbeatEngine {
    registry: Arc<Registry>,
    started_at: Instant,
}

impl HeartbeatEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }

    /// Runs the scan loop until `shutdown` fires. In-flight disconnections
    /// within a tick complete before this returns (spec §4.5
    /// "Cancellation").
    pub async fn run(
        self: Arc<Self>,
        check_interval: Duration,
        heartbeat_timeout: Duration,
        warning_threshold: Duration,
        startup_grace: Duration,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(heartbeat_timeout, warning_threshold, startup_grace);
                }
                _ = shutdown.notified() => {
                    info!("heartbeat engine shutting down");
                    break;
                }
            }
        }
    }

    /// One scan tick (spec §4.5 steps 1-4).
    fn tick(&self, heartbeat_timeout: Duration, warning_threshold: Duration, startup_grace: Duration) {
        if self.started_at.elapsed() < startup_grace {
            // Grace period: a restart surge should not be mistaken for mass
            // timeout (spec §4.4 "Grace period").
            return;
        }

        for device_id in self.registry.finalize_expired_sessions() {
            warn!(device_id = %device_id, "session expired while reconnecting, device now offline");
        }

        let now = crate::registry::now_secs();

        for device in self.registry.snapshot_live_devices() {
            let elapsed = now.saturating_sub(device.last_heartbeat_at);
            if elapsed >= heartbeat_timeout.as_secs() {
                let conn = self.registry.lookup_by_device(&device.device_id);
                self.registry
                    .unbind(&device.device_id, CloseReason::HeartbeatTimeout);
                if let Some((view, _)) = conn {
                    warn!(device_id = %device.device_id, "heartbeat timeout, closing connection");
                    view.request_close(CloseReason::HeartbeatTimeout);
                }
            } else {
                let remaining = heartbeat_timeout.as_secs() - elapsed;
                if remaining <= warning_threshold.as_secs() {
                    warn!(
                        device_id = %device.device_id,
                        remaining_secs = remaining,
                        "device approaching heartbeat timeout"
                    );
                }
            }
        }
    }
}
