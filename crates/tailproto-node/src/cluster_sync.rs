//! Cross-node propagation of rekey requests and session state.
//!
//! [`ClusterSync`] signs and publishes [`ClusterEvent`]s, and consumes
//! events from sibling nodes (and its own echoes):
//!
//! - `rekey_request` — deduplicated by request id (first writer wins,
//!   bounded TTL), then fanned out to every locally connected session
//!   of the user, whichever node issued it.
//! - `session_update` / `key_rotated` — recorded in the
//!   [`RemoteSession`] index when they come from another node.
//! - `session_closed` — drops the index entry, but only if the closing
//!   node is still the one the index places the session on.
//! - `audit` — logged.
//!
//! Payloads that fail verification are dropped and counted; they never
//! reach the peer and never stop the consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::RngCore;
use tailproto_storage::session::Session;
use tailproto_types::{NodeId, Result, SessionId, TailProtoError, Timestamp, UserId};

use crate::bus::{
    AuditAction, AuditRecord, BusEvent, BusSigner, ClusterEvent, EventBus, RekeyRequest,
    SessionClosed, SessionSnapshot,
};
use crate::fanout::RekeyFanout;

// ---------------------------------------------------------------------------
// Dedupe
// ---------------------------------------------------------------------------

/// Request ids seen recently, in arrival order.
///
/// Expiry is FIFO: entries are inserted with monotonically
/// non-decreasing expiry, so purging pops from the front.
struct SeenRequests {
    expiry: HashMap<String, Timestamp>,
    order: VecDeque<String>,
    ttl_secs: u64,
}

impl SeenRequests {
    fn new(ttl_secs: u64) -> Self {
        Self {
            expiry: HashMap::new(),
            order: VecDeque::new(),
            ttl_secs,
        }
    }

    /// Records `id`; `false` if it was already live.
    fn first_seen(&mut self, id: &str, now: Timestamp) -> bool {
        self.purge(now);
        if self.expiry.contains_key(id) {
            return false;
        }
        self.expiry.insert(id.to_owned(), now.plus_secs(self.ttl_secs));
        self.order.push_back(id.to_owned());
        true
    }

    fn purge(&mut self, now: Timestamp) {
        while let Some(front) = self.order.front() {
            let expired = self.expiry.get(front).map_or(true, |expires| *expires <= now);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.expiry.remove(&id);
            }
        }
    }

    fn len(&self) -> usize {
        self.expiry.len()
    }
}

// ---------------------------------------------------------------------------
// Stats and remote index
// ---------------------------------------------------------------------------

/// Consumer counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterSyncStats {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    /// Payloads dropped for failing verification or decoding.
    pub rejected: u64,
    /// Rekey requests ignored as redeliveries.
    pub duplicates: u64,
    pub rekey_requests_applied: u64,
    pub notices_delivered: u64,
}

/// Where a session living on another node was last seen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSession {
    pub node_id: NodeId,
    pub user_id: Option<UserId>,
    pub auth_key_id: String,
    pub key_version: u32,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    rekey_requests_applied: AtomicU64,
    notices_delivered: AtomicU64,
}

// ---------------------------------------------------------------------------
// ClusterSync
// ---------------------------------------------------------------------------

pub struct ClusterSync {
    node_id: NodeId,
    signer: BusSigner,
    bus: Arc<dyn EventBus>,
    fanout: Arc<RekeyFanout>,
    seen: Mutex<SeenRequests>,
    remote: Mutex<HashMap<SessionId, RemoteSession>>,
    counters: Counters,
}

impl ClusterSync {
    pub fn new(
        node_id: NodeId,
        bus_mac_key: [u8; 32],
        bus: Arc<dyn EventBus>,
        fanout: Arc<RekeyFanout>,
        dedupe_ttl_secs: u64,
    ) -> Self {
        Self {
            node_id,
            signer: BusSigner::new(bus_mac_key),
            bus,
            fanout,
            seen: Mutex::new(SeenRequests::new(dedupe_ttl_secs)),
            remote: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    // -----------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------

    /// Signs and publishes `event`.
    pub fn publish(&self, event: &ClusterEvent) -> Result<()> {
        let signed = self.signer.sign(event)?;
        match self.bus.publish(signed) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Publishes a rekey request for `user_id` and returns its id.
    ///
    /// The id is recorded as seen before publishing, so this node's own
    /// echo is not applied a second time.
    pub fn publish_rekey_request(
        &self,
        user_id: &UserId,
        deadline: Timestamp,
        reason: &str,
        now: Timestamp,
    ) -> Result<String> {
        let request_id = new_request_id();
        self.lock_seen()?.first_seen(&request_id, now);
        self.publish(&ClusterEvent::RekeyRequest(RekeyRequest {
            request_id: request_id.clone(),
            user_id: user_id.as_str().to_owned(),
            origin_node: self.node_id.as_str().to_owned(),
            reason: reason.to_owned(),
            deadline_ms: deadline.as_millis(),
            issued_at_ms: now.as_millis(),
        }))?;
        tracing::debug!(user_id = %user_id, request_id = %request_id, "rekey request published");
        Ok(request_id)
    }

    /// Publishes the public state of `session`.
    pub fn publish_session_update(&self, session: &Session) -> Result<()> {
        self.publish(&ClusterEvent::SessionUpdate(self.snapshot(session)))
    }

    /// Publishes that `session` now runs on a new key version.
    pub fn publish_key_rotated(&self, session: &Session) -> Result<()> {
        self.publish(&ClusterEvent::KeyRotated(self.snapshot(session)))
    }

    /// Publishes that `session_id` was closed on this node.
    pub fn publish_session_closed(&self, session_id: &SessionId, now: Timestamp) -> Result<()> {
        self.publish(&ClusterEvent::SessionClosed(SessionClosed {
            session_id: session_id.as_str().to_owned(),
            node_id: self.node_id.as_str().to_owned(),
            at_ms: now.as_millis(),
        }))
    }

    pub fn publish_audit(
        &self,
        action: AuditAction,
        session_id: Option<&SessionId>,
        user_id: Option<&UserId>,
        detail: Option<String>,
        now: Timestamp,
    ) -> Result<()> {
        self.publish(&ClusterEvent::Audit(AuditRecord {
            action,
            node_id: self.node_id.as_str().to_owned(),
            session_id: session_id.map(|s| s.as_str().to_owned()),
            user_id: user_id.map(|u| u.as_str().to_owned()),
            detail,
            at_ms: now.as_millis(),
        }))
    }

    fn snapshot(&self, session: &Session) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session.session_id.as_str().to_owned(),
            user_id: session.user_id.as_ref().map(|u| u.as_str().to_owned()),
            node_id: self.node_id.as_str().to_owned(),
            auth_key_id: session.auth_key_id.to_string(),
            key_version: session.key_version,
            key_version_timestamp_ms: session.key_version_timestamp.as_millis(),
        }
    }

    // -----------------------------------------------------------------
    // Consuming
    // -----------------------------------------------------------------

    /// Applies one bus event. Returns the sessions that received a
    /// rekey notice.
    ///
    /// Unverifiable payloads are dropped and counted, not returned as
    /// errors. `Err` means local state could not be updated.
    pub fn handle_event(&self, event: &BusEvent, now: Timestamp) -> Result<Vec<SessionId>> {
        self.counters.received.fetch_add(1, Ordering::SeqCst);

        let decoded = match self.signer.verify(event) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    topic = %event.topic,
                    partition_key = %event.partition_key,
                    error = %e,
                    "dropping unverifiable bus payload"
                );
                return Ok(Vec::new());
            }
        };

        match decoded {
            ClusterEvent::RekeyRequest(request) => self.apply_rekey_request(&request, now),
            ClusterEvent::SessionUpdate(snapshot) | ClusterEvent::KeyRotated(snapshot) => {
                self.record_remote(snapshot)?;
                Ok(Vec::new())
            }
            ClusterEvent::SessionClosed(closed) => {
                self.drop_remote(&closed)?;
                Ok(Vec::new())
            }
            ClusterEvent::Audit(record) => {
                tracing::debug!(
                    action = ?record.action,
                    node_id = %record.node_id,
                    session_id = record.session_id.as_deref().unwrap_or("-"),
                    "audit record"
                );
                Ok(Vec::new())
            }
        }
    }

    fn apply_rekey_request(&self, request: &RekeyRequest, now: Timestamp) -> Result<Vec<SessionId>> {
        if !self.lock_seen()?.first_seen(&request.request_id, now) {
            self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(request_id = %request.request_id, "duplicate rekey request ignored");
            return Ok(Vec::new());
        }

        let user_id = UserId::new(request.user_id.clone());
        let notified = self.fanout.notify_user(
            &user_id,
            Timestamp::from_millis(request.deadline_ms),
            &request.reason,
        )?;
        self.counters.rekey_requests_applied.fetch_add(1, Ordering::SeqCst);
        self.counters
            .notices_delivered
            .fetch_add(notified.len() as u64, Ordering::SeqCst);
        tracing::debug!(
            request_id = %request.request_id,
            origin = %request.origin_node,
            user_id = %user_id,
            notified = notified.len(),
            "rekey request applied"
        );
        Ok(notified)
    }

    fn record_remote(&self, snapshot: SessionSnapshot) -> Result<()> {
        if snapshot.node_id == self.node_id.as_str() {
            return Ok(());
        }
        let mut remote = self.lock_remote()?;
        remote.insert(
            SessionId::new(snapshot.session_id),
            RemoteSession {
                node_id: NodeId::new(snapshot.node_id),
                user_id: snapshot.user_id.map(UserId::new),
                auth_key_id: snapshot.auth_key_id,
                key_version: snapshot.key_version,
            },
        );
        Ok(())
    }

    fn drop_remote(&self, closed: &SessionClosed) -> Result<()> {
        if closed.node_id == self.node_id.as_str() {
            return Ok(());
        }
        let session_id = SessionId::new(closed.session_id.clone());
        let mut remote = self.lock_remote()?;
        // A close from a node the session already left must not evict
        // the newer placement.
        let owned = remote
            .get(&session_id)
            .is_some_and(|entry| entry.node_id.as_str() == closed.node_id);
        if owned {
            remote.remove(&session_id);
            tracing::debug!(session_id = %session_id, node_id = %closed.node_id, "remote session closed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    /// Last known state of a session owned by another node.
    pub fn remote_session(&self, session_id: &SessionId) -> Option<RemoteSession> {
        self.remote
            .lock()
            .ok()
            .and_then(|remote| remote.get(session_id).cloned())
    }

    /// Number of sessions in the remote index.
    pub fn remote_sessions(&self) -> usize {
        self.remote.lock().map_or(0, |remote| remote.len())
    }

    /// Drops a session from the remote index (e.g. it reconnected here).
    pub fn forget_remote(&self, session_id: &SessionId) {
        if let Ok(mut remote) = self.remote.lock() {
            remote.remove(session_id);
        }
    }

    /// Expires old dedupe entries. Returns how many remain.
    pub fn purge_seen(&self, now: Timestamp) -> Result<usize> {
        let mut seen = self.lock_seen()?;
        seen.purge(now);
        Ok(seen.len())
    }

    pub fn stats(&self) -> ClusterSyncStats {
        ClusterSyncStats {
            published: self.counters.published.load(Ordering::SeqCst),
            publish_failures: self.counters.publish_failures.load(Ordering::SeqCst),
            received: self.counters.received.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            duplicates: self.counters.duplicates.load(Ordering::SeqCst),
            rekey_requests_applied: self.counters.rekey_requests_applied.load(Ordering::SeqCst),
            notices_delivered: self.counters.notices_delivered.load(Ordering::SeqCst),
        }
    }

    fn lock_remote(&self) -> Result<MutexGuard<'_, HashMap<SessionId, RemoteSession>>> {
        self.remote.lock().map_err(|_| TailProtoError::LockError {
            reason: "remote session index poisoned".into(),
        })
    }

    fn lock_seen(&self) -> Result<MutexGuard<'_, SeenRequests>> {
        self.seen.lock().map_err(|_| TailProtoError::LockError {
            reason: "rekey dedupe cache poisoned".into(),
        })
    }
}

fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
