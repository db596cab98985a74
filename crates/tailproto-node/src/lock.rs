//! Short-lived advisory locks shared by the cluster.
//!
//! The rekey scheduler takes `lock(userId)` before issuing a rotation
//! request so concurrent ticks on different nodes do not duplicate it.
//! Acquisition never waits: a contended lock reports `false` and the
//! caller retries on its next tick. Locks expire on their own after
//! the TTL, so a crashed holder cannot wedge a user.

use std::collections::HashMap;
use std::sync::Mutex;

use tailproto_types::{NodeId, Result, TailProtoError, Timestamp};

/// Distributed mutex contract.
pub trait LockService: Send + Sync {
    /// Attempts to take `key` for `holder` until `now + ttl_secs`.
    ///
    /// Returns `Ok(true)` on acquisition, `Ok(false)` if another holder
    /// has an unexpired lock. Re-acquiring one's own lock refreshes it.
    fn try_lock(&self, key: &str, holder: &NodeId, ttl_secs: u64, now: Timestamp) -> Result<bool>;

    /// Releases `key` if `holder` owns it.
    fn unlock(&self, key: &str, holder: &NodeId) -> Result<()>;
}

struct Lease {
    holder: NodeId,
    expires_at: Timestamp,
}

/// In-process [`LockService`]; share one instance between nodes to
/// model a cluster.
#[derive(Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, ignoring expiry.
    pub fn holder(&self, key: &str) -> Option<NodeId> {
        self.leases
            .lock()
            .ok()
            .and_then(|leases| leases.get(key).map(|l| l.holder.clone()))
    }
}

impl LockService for MemoryLockService {
    fn try_lock(&self, key: &str, holder: &NodeId, ttl_secs: u64, now: Timestamp) -> Result<bool> {
        let mut leases = self.leases.lock().map_err(|_| TailProtoError::LockError {
            reason: "lock table poisoned".into(),
        })?;

        if let Some(lease) = leases.get(key) {
            if lease.holder != *holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            key.to_owned(),
            Lease {
                holder: holder.clone(),
                expires_at: now.plus_secs(ttl_secs),
            },
        );
        Ok(true)
    }

    fn unlock(&self, key: &str, holder: &NodeId) -> Result<()> {
        let mut leases = self.leases.lock().map_err(|_| TailProtoError::LockError {
            reason: "lock table poisoned".into(),
        })?;
        if leases.get(key).map(|l| &l.holder) == Some(holder) {
            leases.remove(key);
        }
        Ok(())
    }
}
