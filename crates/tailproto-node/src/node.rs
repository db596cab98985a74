//! Node lifecycle and state machine.
//!
//! The [`Node`] owns one server process's share of the session layer:
//! the session store, the envelope codec, live connections, the rekey
//! scheduler, and cluster sync. Transports hand it raw frames via
//! [`Node::handle_frame`] and drain each connection's outbound channel.
//!
//! # State machine
//!
//! ```text
//! Initializing ──start()──▶ Running ──shutdown()──▶ ShuttingDown
//! ```
//!
//! - `Initializing` — components created, bus subscribed, no loop yet.
//!   Frames can already be handled; ticks and bus events can be driven
//!   by hand.
//! - `Running` — the event loop ticks the scheduler and consumes the
//!   bus.
//! - `ShuttingDown` — the loop was told to stop.
//!
//! Double-start and shutdown-from-initializing are rejected with
//! `TailProtoError::ConfigError`. Repeated shutdown is a no-op.

use std::sync::{Arc, Mutex, MutexGuard};

use tailproto_crypto::secrets::ServerSecrets;
use tailproto_protocol::codec::{EnvelopeCodec, InboundKind, Outbound};
use tailproto_protocol::executor::OrderedOutbound;
use tailproto_protocol::inner::{AppEvent, RequestHandler};
use tailproto_protocol::resumption::TokenIssuer;
use tailproto_storage::kv::KvStore;
use tailproto_storage::store::{SessionStore, StoreHealth};
use tailproto_types::config::ProtoConfig;
use tailproto_types::{NodeId, Result, SessionId, TailProtoError, Timestamp, UserId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{AuditAction, BusEvent, EventBus};
use crate::cluster_sync::{ClusterSync, ClusterSyncStats};
use crate::config::NodeConfig;
use crate::connections::ConnectionRegistry;
use crate::event_loop;
use crate::fanout::RekeyFanout;
use crate::lock::LockService;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{RekeyScheduler, TickReport};

/// Reason carried by notices sent after a failed decryption.
pub const DECRYPT_FAILED_REASON: &str = "decrypt_failed";

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Components created, event loop not started.
    Initializing,
    /// Event loop is active.
    Running,
    /// Shutdown signalled.
    ShuttingDown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared services
// ---------------------------------------------------------------------------

/// Everything the public API and the event loop both touch.
pub(crate) struct NodeServices {
    pub(crate) node_id: NodeId,
    pub(crate) store: Arc<SessionStore>,
    codec: EnvelopeCodec,
    connections: Arc<ConnectionRegistry>,
    scheduler: RekeyScheduler,
    sync: Arc<ClusterSync>,
    limiter: RateLimiter,
    outbound: Mutex<OrderedOutbound>,
    handler: Arc<dyn RequestHandler>,
}

impl NodeServices {
    /// One scheduler pass plus dedupe housekeeping.
    pub(crate) fn tick(&self, now: Timestamp) -> Result<TickReport> {
        let report = self.scheduler.tick(now)?;
        self.sync.purge_seen(now)?;
        Ok(report)
    }

    pub(crate) fn handle_bus_event(&self, event: &BusEvent, now: Timestamp) -> Result<Vec<SessionId>> {
        self.sync.handle_event(event, now)
    }

    fn lock_outbound(&self) -> Result<MutexGuard<'_, OrderedOutbound>> {
        self.outbound.lock().map_err(|_| TailProtoError::LockError {
            reason: "outbound ordering lock poisoned".into(),
        })
    }

    /// Sends replies; sealed frames are released in outbound seq order.
    fn deliver(&self, session_id: &SessionId, replies: Vec<Outbound>) -> Result<()> {
        for reply in replies {
            match reply {
                Outbound::Plain(frame) => {
                    self.connections.send(session_id, frame)?;
                }
                Outbound::Sealed { seq, frame } => {
                    let mut outbound = self.lock_outbound()?;
                    for ready in outbound.complete(session_id, seq, frame) {
                        self.connections.send(session_id, ready)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Bus publications and defensive notices after an inbound frame.
    /// Failures here are logged; the frame itself was already answered.
    fn after_inbound(&self, session_id: &SessionId, kind: &InboundKind, now: Timestamp) {
        let result = match kind {
            InboundKind::Handshake { rotated, .. } => {
                self.after_key_change(session_id, *rotated, AuditAction::Handshake, now)
            }
            InboundKind::Resumed { .. } => {
                self.after_key_change(session_id, false, AuditAction::Resume, now)
            }
            InboundKind::Rejected(TailProtoError::DecryptFailed { reason }) => {
                self.after_decrypt_failure(session_id, reason, now)
            }
            InboundKind::Request { .. } | InboundKind::Rejected(_) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(session_id = %session_id, error = %e, "post-frame bookkeeping failed");
        }
    }

    fn after_key_change(
        &self,
        session_id: &SessionId,
        rotated: bool,
        action: AuditAction,
        now: Timestamp,
    ) -> Result<()> {
        let Some(session) = self.store.get(session_id)? else {
            return Ok(());
        };
        if let Some(user_id) = &session.user_id {
            self.scheduler.register(session_id.clone(), user_id.clone())?;
        }
        self.sync.forget_remote(session_id);
        self.sync.publish_session_update(&session)?;
        if rotated {
            self.sync.publish_key_rotated(&session)?;
        }
        self.sync.publish_audit(
            action,
            Some(session_id),
            session.user_id.as_ref(),
            Some(format!("key_version={}", session.key_version)),
            now,
        )
    }

    fn after_decrypt_failure(&self, session_id: &SessionId, reason: &str, now: Timestamp) -> Result<()> {
        if self.limiter.try_acquire(session_id)? {
            let notice = self.codec.rekey_notice(DECRYPT_FAILED_REASON, None)?;
            self.connections.send(session_id, notice)?;
            tracing::info!(session_id = %session_id, "re-handshake requested after decrypt failure");
        } else {
            tracing::debug!(session_id = %session_id, "re-handshake notice rate limited");
        }
        let user_id = self.store.get(session_id)?.and_then(|s| s.user_id);
        self.sync.publish_audit(
            AuditAction::DecryptFailure,
            Some(session_id),
            user_id.as_ref(),
            Some(reason.to_owned()),
            now,
        )
    }
}

// ---------------------------------------------------------------------------
// NodeRuntime
// ---------------------------------------------------------------------------

/// Owned state moved into the event loop task.
pub(crate) struct NodeRuntime {
    pub services: Arc<NodeServices>,
    pub bus_rx: broadcast::Receiver<BusEvent>,
    pub tick_secs: u64,
    pub shutdown_rx: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One TailProto server node.
pub struct Node {
    services: Arc<NodeServices>,
    state: NodeState,
    tick_secs: u64,
    bus_rx: Option<broadcast::Receiver<BusEvent>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    /// Builds a node over the shared cluster collaborators.
    ///
    /// Subscribes to the bus immediately so events published before
    /// [`start`](Self::start) are not missed.
    ///
    /// # Errors
    ///
    /// `ConfigError` for an invalid config or master secret.
    pub fn new(
        config: NodeConfig,
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn EventBus>,
        locks: Arc<dyn LockService>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let secrets = ServerSecrets::from_hex(&config.master_secret_hex).map_err(|e| {
            TailProtoError::ConfigError {
                reason: format!("invalid master secret: {e}"),
            }
        })?;
        let proto: ProtoConfig = config.protocol.clone();

        let store = Arc::new(SessionStore::new(kv, secrets.store_keys().clone(), &proto));
        let tokens = TokenIssuer::new(secrets.token_keys().clone(), proto.resume_token_ttl_secs);
        let codec = EnvelopeCodec::new(store.clone(), tokens, proto.clone());
        let connections = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(RekeyFanout::new(store.clone(), connections.clone()));
        let bus_rx = bus.subscribe();
        let sync = Arc::new(ClusterSync::new(
            config.node_id.clone(),
            *secrets.bus_mac_key(),
            bus,
            fanout.clone(),
            proto.bus_dedupe_ttl_secs,
        ));
        let scheduler = RekeyScheduler::new(
            config.node_id.clone(),
            store.clone(),
            locks,
            fanout,
            sync.clone(),
            proto.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(node_id = %config.node_id, "node initialized");

        Ok(Self {
            services: Arc::new(NodeServices {
                node_id: config.node_id,
                store,
                codec,
                connections,
                scheduler,
                sync,
                limiter: RateLimiter::new(proto.rehandshake_per_min),
                outbound: Mutex::new(OrderedOutbound::new()),
                handler,
            }),
            state: NodeState::Initializing,
            tick_secs: config.tick_secs,
            bus_rx: Some(bus_rx),
            shutdown_tx,
            shutdown_rx,
        })
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Starts the event loop.
    ///
    /// Transitions `Initializing → Running`. The returned handle
    /// completes after [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// `ConfigError` if the node is not in `Initializing` state.
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        if self.state != NodeState::Initializing {
            return Err(TailProtoError::ConfigError {
                reason: format!(
                    "cannot start node in state '{}'; expected 'initializing'",
                    self.state,
                ),
            });
        }
        let bus_rx = self.bus_rx.take().ok_or_else(|| TailProtoError::ConfigError {
            reason: "bus subscription already consumed".into(),
        })?;

        let runtime = NodeRuntime {
            services: self.services.clone(),
            bus_rx,
            tick_secs: self.tick_secs,
            shutdown_rx: self.shutdown_rx.clone(),
        };
        self.state = NodeState::Running;
        tracing::info!(node_id = %self.services.node_id, "node started");
        Ok(tokio::spawn(event_loop::run_event_loop(runtime)))
    }

    /// Signals the event loop to stop. Idempotent once running.
    ///
    /// # Errors
    ///
    /// `ConfigError` if the node was never started.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            NodeState::Initializing => Err(TailProtoError::ConfigError {
                reason: "cannot shut down a node that was never started".into(),
            }),
            NodeState::ShuttingDown => Ok(()),
            NodeState::Running => {
                self.state = NodeState::ShuttingDown;
                // A dropped receiver means the loop already exited.
                let _ = self.shutdown_tx.send(true);
                tracing::info!(node_id = %self.services.node_id, "node shutdown signalled");
                Ok(())
            }
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn node_id(&self) -> &NodeId {
        &self.services.node_id
    }

    // -----------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------

    /// Registers a connection; frames for the client arrive on the
    /// returned channel.
    pub fn open_connection(&self, session_id: SessionId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        tracing::debug!(session_id = %session_id, "connection opened");
        self.services.connections.register(session_id)
    }

    /// Processes one raw inbound frame. Every reply is queued on the
    /// connection's channel.
    ///
    /// Protocol rejections are answered to the peer and reported in the
    /// returned [`InboundKind`]; `Err` is reserved for local failures.
    pub async fn handle_frame(&self, session_id: &SessionId, raw: &[u8], now: Timestamp) -> Result<InboundKind> {
        let services = &self.services;
        let processed = services
            .codec
            .process(session_id, raw, services.handler.as_ref(), now)
            .await?;

        let fresh_session = matches!(
            processed.kind,
            InboundKind::Handshake { rotated: false, .. } | InboundKind::Resumed { .. }
        );
        if fresh_session {
            services.lock_outbound()?.reset(session_id);
        }

        services.deliver(session_id, processed.replies)?;
        services.after_inbound(session_id, &processed.kind, now);
        Ok(processed.kind)
    }

    /// Binds the session to a user after login and schedules it for
    /// rotation.
    pub fn bind_user(&self, session_id: &SessionId, user_id: UserId) -> Result<()> {
        self.services.store.bind_user(session_id, user_id.clone())?;
        self.services.scheduler.register(session_id.clone(), user_id.clone())?;
        tracing::info!(session_id = %session_id, user_id = %user_id, "session bound to user");

        if let Some(session) = self.services.store.get(session_id)? {
            if let Err(e) = self.services.sync.publish_session_update(&session) {
                tracing::warn!(session_id = %session_id, error = %e, "session update not published");
            }
        }
        Ok(())
    }

    /// Seals and sends a server-initiated push.
    pub async fn push(&self, session_id: &SessionId, event: AppEvent) -> Result<()> {
        let outbound = self.services.codec.push(session_id, event).await?;
        self.services.deliver(session_id, vec![outbound])
    }

    /// Cleans up after a disconnect: the connection, scheduler entry,
    /// rate-limit bucket, ordering state, and the session itself. Siblings
    /// learn of the close over the bus.
    pub fn close_connection(&self, session_id: &SessionId, now: Timestamp) -> Result<()> {
        let services = &self.services;
        services.connections.unregister(session_id)?;
        services.scheduler.unregister(session_id)?;
        services.limiter.forget(session_id);
        services.lock_outbound()?.reset(session_id);
        services.store.destroy(session_id)?;
        if let Err(e) = services.sync.publish_session_closed(session_id, now) {
            tracing::warn!(session_id = %session_id, error = %e, "session close not published");
        }
        tracing::info!(session_id = %session_id, "connection closed");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Scheduler and bus
    // -----------------------------------------------------------------

    /// Runs one scheduler pass now, outside the event loop.
    pub fn tick(&self, now: Timestamp) -> Result<TickReport> {
        self.services.tick(now)
    }

    /// Applies one bus event, outside the event loop.
    pub fn handle_bus_event(&self, event: &BusEvent, now: Timestamp) -> Result<Vec<SessionId>> {
        self.services.handle_bus_event(event, now)
    }

    // -----------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.services.store
    }

    pub fn store_health(&self) -> StoreHealth {
        self.services.store.health()
    }

    pub fn cluster(&self) -> &ClusterSync {
        &self.services.sync
    }

    pub fn sync_stats(&self) -> ClusterSyncStats {
        self.services.sync.stats()
    }

    pub fn connection_count(&self) -> usize {
        self.services.connections.len()
    }

    /// Sessions registered with the rekey scheduler.
    pub fn scheduled_sessions(&self) -> usize {
        self.services.scheduler.registered()
    }
}
