//! Main event loop of a running node.
//!
//! [`run_event_loop`] is spawned as a tokio task by [`Node::start`].
//! It uses `tokio::select!` to multiplex:
//!
//! 1. **Scheduler tick** — rekey scheduling, old-key expiry, store
//!    resync.
//! 2. **Bus events** — rekey requests and session updates from the
//!    cluster (including this node's own echoes).
//! 3. **Shutdown signal** — graceful exit via `watch` channel.
//!
//! Inbound client frames do not pass through here; transports call
//! [`Node::handle_frame`] from their own tasks.
//!
//! [`Node::start`]: crate::node::Node::start
//! [`Node::handle_frame`]: crate::node::Node::handle_frame

use std::time::Duration;

use tailproto_types::Timestamp;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};

use crate::node::NodeRuntime;

/// Runs until the shutdown watch channel fires.
///
/// The first tick happens one full interval after start.
pub(crate) async fn run_event_loop(mut rt: NodeRuntime) {
    let node_id = rt.services.node_id.clone();
    tracing::info!(node_id = %node_id, tick_secs = rt.tick_secs, "node event loop started");

    let period = Duration::from_secs(rt.tick_secs);
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut bus_open = true;

    loop {
        tokio::select! {
            // -----------------------------------------------------------
            // 1. Scheduler tick.
            // -----------------------------------------------------------
            _ = tick.tick() => {
                match rt.services.tick(Timestamp::now()) {
                    Ok(report) => {
                        if !report.users_rekeyed.is_empty() || report.old_keys_destroyed > 0 {
                            tracing::info!(
                                rekeyed = report.users_rekeyed.len(),
                                contended = report.users_contended.len(),
                                old_keys_destroyed = report.old_keys_destroyed,
                                records_synced = report.records_synced,
                                "scheduler tick"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "scheduler tick failed"),
                }
            }

            // -----------------------------------------------------------
            // 2. Cluster bus.
            // -----------------------------------------------------------
            received = rt.bus_rx.recv(), if bus_open => {
                match received {
                    Ok(event) => {
                        if let Err(e) = rt.services.handle_bus_event(&event, Timestamp::now()) {
                            tracing::warn!(topic = %event.topic, error = %e, "bus event not applied");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "bus consumer lagged; events were lost");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("bus closed; continuing without cluster events");
                        bus_open = false;
                    }
                }
            }

            // -----------------------------------------------------------
            // 3. Shutdown.
            // -----------------------------------------------------------
            changed = rt.shutdown_rx.changed() => {
                if changed.is_err() || *rt.shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    match rt.services.store.sync_dirty() {
        Ok(0) => {}
        Ok(n) => tracing::info!(records = n, "flushed buffered session writes"),
        Err(e) => tracing::warn!(error = %e, "buffered session writes not flushed on shutdown"),
    }
    tracing::info!(node_id = %node_id, "node event loop stopped");
}
