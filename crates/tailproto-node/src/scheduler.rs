//! Periodic key-rotation trigger and old-key lifecycle.
//!
//! Each [`RekeyScheduler::tick`]:
//!
//! 1. destroys retained old keys older than the grace window, whatever
//!    their hit and duration budgets say
//! 2. collects users owning a registered session whose key is older
//!    than the rekey interval and has no deadline pending
//! 3. per user, takes the cluster lock `rekey:<userId>` without waiting;
//!    on success sets deadlines and notifies the user's local
//!    connections, then publishes a rekey request for sibling nodes
//! 4. pushes store writes that were buffered during an outage
//!
//! Rotation is per user, not per session: one user may hold several
//! sessions here and on other nodes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tailproto_storage::store::SessionStore;
use tailproto_types::config::ProtoConfig;
use tailproto_types::{NodeId, Result, SessionId, TailProtoError, Timestamp, UserId};

use crate::bus::AuditAction;
use crate::cluster_sync::ClusterSync;
use crate::fanout::RekeyFanout;
use crate::lock::LockService;

/// Reason carried by scheduler-issued notices.
pub const KEY_EXPIRED_REASON: &str = "key_expired";

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub old_keys_destroyed: usize,
    /// Users this node issued a rotation for.
    pub users_rekeyed: Vec<UserId>,
    /// Users skipped because another holder had the lock.
    pub users_contended: Vec<UserId>,
    pub local_notices: usize,
    pub records_synced: usize,
}

pub struct RekeyScheduler {
    node_id: NodeId,
    registry: Mutex<HashMap<SessionId, UserId>>,
    store: Arc<SessionStore>,
    locks: Arc<dyn LockService>,
    fanout: Arc<RekeyFanout>,
    sync: Arc<ClusterSync>,
    config: ProtoConfig,
}

impl RekeyScheduler {
    pub fn new(
        node_id: NodeId,
        store: Arc<SessionStore>,
        locks: Arc<dyn LockService>,
        fanout: Arc<RekeyFanout>,
        sync: Arc<ClusterSync>,
        config: ProtoConfig,
    ) -> Self {
        Self {
            node_id,
            registry: Mutex::new(HashMap::new()),
            store,
            locks,
            fanout,
            sync,
            config,
        }
    }

    pub fn register(&self, session_id: SessionId, user_id: UserId) -> Result<()> {
        self.lock_registry()?.insert(session_id, user_id);
        Ok(())
    }

    pub fn unregister(&self, session_id: &SessionId) -> Result<()> {
        self.lock_registry()?.remove(session_id);
        Ok(())
    }

    pub fn registered(&self) -> usize {
        self.lock_registry().map(|r| r.len()).unwrap_or(0)
    }

    /// Runs one scheduler pass at `now`.
    pub fn tick(&self, now: Timestamp) -> Result<TickReport> {
        let mut report = TickReport {
            old_keys_destroyed: self.expire_old_keys(&now)?,
            ..TickReport::default()
        };

        for user_id in self.users_due(&now)? {
            let lock_key = format!("rekey:{user_id}");
            match self
                .locks
                .try_lock(&lock_key, &self.node_id, self.config.rekey_lock_ttl_secs, now)
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(user_id = %user_id, "rekey lock held elsewhere; retrying next tick");
                    report.users_contended.push(user_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "rekey lock unavailable");
                    report.users_contended.push(user_id);
                    continue;
                }
            }

            let deadline = now.plus_secs(self.config.rekey_deadline_grace_secs);
            let notified = self.fanout.notify_user(&user_id, deadline, KEY_EXPIRED_REASON)?;
            report.local_notices += notified.len();

            // The lock is kept until its TTL unless the request could not
            // go out, so the next tick can retry.
            if let Err(e) =
                self.sync
                    .publish_rekey_request(&user_id, deadline, KEY_EXPIRED_REASON, now)
            {
                tracing::warn!(user_id = %user_id, error = %e, "failed to publish rekey request");
                self.locks.unlock(&lock_key, &self.node_id)?;
                continue;
            }
            if let Err(e) = self.sync.publish_audit(
                AuditAction::RekeyIssued,
                None,
                Some(&user_id),
                Some(format!("deadline={deadline}")),
                now,
            ) {
                tracing::debug!(error = %e, "rekey audit not published");
            }

            tracing::info!(
                user_id = %user_id,
                local_sessions = notified.len(),
                deadline = %deadline,
                "user rekey issued"
            );
            report.users_rekeyed.push(user_id);
        }

        report.records_synced = match self.store.sync_dirty() {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "store still unavailable; sync deferred");
                0
            }
        };
        Ok(report)
    }

    /// Destroys every retained old key past the grace window.
    fn expire_old_keys(&self, now: &Timestamp) -> Result<usize> {
        let window = self.config.accept_old_key_window_secs;
        let mut destroyed = 0;
        for session in self.store.snapshot_all()? {
            if !session.old_key_expired(now, window) {
                continue;
            }
            let id = &session.session_id;
            let done = self.store.update(id, |s| {
                if s.old_key_expired(now, window) {
                    s.destroy_old_key();
                    Ok(true)
                } else {
                    Ok(false)
                }
            });
            match done {
                Ok(true) => {
                    destroyed += 1;
                    tracing::debug!(session_id = %id, "old key expired");
                }
                Ok(false) => {}
                // Destroyed concurrently.
                Err(TailProtoError::SessionNotReady { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(destroyed)
    }

    /// Distinct users with at least one registered session due for
    /// rotation, in a stable order.
    fn users_due(&self, now: &Timestamp) -> Result<BTreeSet<UserId>> {
        let registry: Vec<(SessionId, UserId)> = self
            .lock_registry()?
            .iter()
            .map(|(s, u)| (s.clone(), u.clone()))
            .collect();

        let mut due = BTreeSet::new();
        for (session_id, user_id) in registry {
            let Some(session) = self.store.get(&session_id)? else {
                continue;
            };
            if session.rekey_deadline.is_some() {
                continue;
            }
            if now.exceeds(&session.key_version_timestamp, self.config.rekey_interval_secs) {
                due.insert(user_id);
            }
        }
        Ok(due)
    }

    fn lock_registry(&self) -> Result<MutexGuard<'_, HashMap<SessionId, UserId>>> {
        self.registry.lock().map_err(|_| TailProtoError::LockError {
            reason: "scheduler registry poisoned".into(),
        })
    }
}
