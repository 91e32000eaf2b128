// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DNY Device Gateway.
//!
//! Accepts DNY protocol device connections over TCP, carries them through
//! the pre-registration handshake, and maintains the Session & Group
//! Registry that a business-level surface (not part of this crate) would
//! query and dispatch into. Grounded on the teacher's `DiscoveryServer`
//! (`server.rs`): an accept loop plus a supervisor task, wrapped in a
//! `Clone`-able handle with a shared `Arc<Notify>` shutdown signal.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod heartbeat;
pub mod optimizer;
pub mod registry;
pub mod transport;

use config::GatewayConfig;
use dispatcher::Dispatcher;
use emitter::EventEmitter;
use error::GatewayError;
use heartbeat::HeartbeatEngine;
use optimizer::StatusOptimizer;
use registry::{ConnIdGenerator, DeviceId, Group, Iccid, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use transport::writer::WriteTimeouts;
use transport::{connection, ConnectionConfig};

/// The running gateway: owns the Registry, Dispatcher, Heartbeat Engine,
/// Status Update Optimizer, and Event Emitter, and drives the accept loop
/// (spec §1, §4, Supplemental module "Admin/introspection seam").
#[derive(Clone)]
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    emitter: Arc<EventEmitter>,
    optimizer: Arc<StatusOptimizer>,
    conn_ids: Arc<ConnIdGenerator>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    /// Set once [`Self::run`] has bound its listener; lets callers using
    /// `tcp.port: 0` (an ephemeral port, as tests do) discover what actually
    /// got bound.
    bound_addr: Arc<std::sync::OnceLock<std::net::SocketAddr>>,
}

impl GatewayServer {
    /// Builds a gateway from validated configuration. Does not bind a
    /// socket yet; call [`Self::run`] to start accepting connections.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let registry = Arc::new(Registry::new(config.session_timeout().as_secs()));
        let optimizer = Arc::new(StatusOptimizer::new(
            registry.clone(),
            config.optimizer_dedup_window(),
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            dispatcher: Arc::new(Dispatcher::new()),
            emitter: Arc::new(EventEmitter::new()),
            optimizer,
            conn_ids: Arc::new(ConnIdGenerator::new()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            bound_addr: Arc::new(std::sync::OnceLock::new()),
        })
    }

    /// Registers (or overrides) a business-level handler for a command byte
    /// (spec §6.4). Must be called before [`Self::run`]; the Dispatcher is
    /// shared read-only once the accept loop starts spawning connections.
    pub fn register_handler(&mut self, command: u8, handler: dispatcher::HandlerFn) {
        Arc::get_mut(&mut self.dispatcher)
            .expect("register_handler must be called before run()")
            .register_handler(command, handler);
    }

    /// Subscribes to lifecycle events (spec §6.4 `registerEventListener`).
    pub fn subscribe(&self) -> tokio::sync::mpsc::Receiver<emitter::Event> {
        self.emitter.subscribe()
    }

    /// Binds the listener and runs the accept loop, heartbeat supervisor,
    /// and optimizer flush timer until [`Self::shutdown`] is called.
    pub async fn run(&self) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyRunning);
        }

        let addr = std::net::SocketAddr::new(self.config.tcp.host, self.config.tcp.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(e.to_string()))?;

        let local_addr = listener.local_addr().map_err(|e| GatewayError::Bind(e.to_string()))?;
        let _ = self.bound_addr.set(local_addr);
        info!(addr = %local_addr, "gateway listening");

        let heartbeat = Arc::new(HeartbeatEngine::new(self.registry.clone()));
        let heartbeat_task = tokio::spawn(heartbeat.run(
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
            self.config.heartbeat_warning_threshold(),
            self.config.startup_grace(),
            self.shutdown.clone(),
        ));

        let optimizer_task = tokio::spawn(
            self.optimizer
                .clone()
                .run(self.config.optimizer_batch_interval(), self.shutdown.clone()),
        );

        let result = self.accept_loop(listener).await;

        self.shutdown.notify_waiters();
        if let Err(e) = heartbeat_task.await {
            warn!(error = %e, "heartbeat engine task join error");
        }
        if let Err(e) = optimizer_task.await {
            warn!(error = %e, "optimizer flush task join error");
        }

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), GatewayError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            if self.registry.connection_count() >= self.config.tcp.max_conn {
                                warn!(%remote_addr, "max connections reached, rejecting");
                                continue;
                            }
                            self.spawn_connection(stream, remote_addr);
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, remote_addr: std::net::SocketAddr) {
        let conn_id = self.conn_ids.next();
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let emitter = self.emitter.clone();
        let optimizer = self.optimizer.clone();
        let shutdown = self.shutdown.clone();
        let conn_config = ConnectionConfig {
            initial_read_deadline: self.config.initial_read_deadline(),
            default_read_deadline: self.config.default_read_deadline(),
            heartbeat_timeout: self.config.heartbeat_timeout(),
            max_packet_size: self.config.tcp.max_packet_size,
            dispatch_enqueue_timeout: std::time::Duration::from_secs(
                self.config.tcp.dispatch_enqueue_timeout_seconds,
            ),
            write_timeouts: WriteTimeouts {
                register: std::time::Duration::from_secs(
                    self.config.device_connection.timeouts.register_timeout_seconds,
                ),
                heartbeat_response: std::time::Duration::from_secs(
                    self.config
                        .device_connection
                        .timeouts
                        .heartbeat_response_timeout_seconds,
                ),
                data_transfer: std::time::Duration::from_secs(
                    self.config.device_connection.timeouts.data_transfer_timeout_seconds,
                ),
                default: std::time::Duration::from_secs(
                    self.config.device_connection.timeouts.default_write_timeout_seconds,
                ),
            },
            outbound_queue_depth: 128,
        };

        debug!(%conn_id, %remote_addr, "accepted connection");
        tokio::spawn(async move {
            connection::run(
                stream,
                remote_addr,
                conn_id,
                registry,
                dispatcher,
                emitter,
                optimizer,
                conn_config,
                shutdown,
            )
            .await
        });
    }

    /// Signals every running task to stop (spec §5 shutdown propagation).
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The address actually bound by [`Self::run`], once it has started
    /// listening. `None` before `run` reaches that point.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.bound_addr.get().copied()
    }

    // --- Admin/introspection seam (spec's Supplemental module) ---

    pub fn device_count(&self) -> usize {
        self.registry.device_count()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn lookup_device(&self, device_id: &DeviceId) -> Option<registry::Device> {
        self.registry.device_snapshot(device_id)
    }

    pub fn group_snapshot(&self) -> Vec<Group> {
        self.registry.group_snapshot()
    }

    pub fn lookup_group(&self, iccid: &Iccid) -> Option<Group> {
        self.registry.lookup_by_iccid(iccid)
    }
}
