//! Cache-fronted session store with an observable degraded mode.
//!
//! Every mutation is applied to the in-process cache first and then
//! written through to the [`KvStore`] as a sealed record:
//!
//! ```text
//! key:   tailproto:session:<session_id>
//! value: seal(store_keys, bincode(Session))
//! ```
//!
//! When the durable store is unreachable the store enters degraded
//! mode: writes still succeed locally, the affected entries are marked
//! dirty, and the in-process state stays authoritative until the store
//! recovers. Dirty entries are pushed again on recovery (any successful
//! store call, or an explicit [`SessionStore::sync_dirty`]).
//!
//! Entries created or mutated on this node are authoritative. Entries
//! loaded from the store (restart recovery, sibling handover) are
//! refreshed after `cache_staleness_secs`; during an outage they are
//! served stale.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tailproto_crypto::key::AuthKey;
use tailproto_crypto::sealed;
use tailproto_crypto::secrets::SealingKeys;
use tailproto_types::config::ProtoConfig;
use tailproto_types::{Result, SessionId, TailProtoError, Timestamp, UserId};

use crate::kv::KvStore;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Key prefix for persisted session records.
pub const SESSION_KEY_PREFIX: &str = "tailproto:session:";

fn record_key(id: &SessionId) -> String {
    format!("{SESSION_KEY_PREFIX}{}", id.as_str())
}

// ---------------------------------------------------------------------------
// StoreHealth
// ---------------------------------------------------------------------------

/// Point-in-time view of the store's degraded-mode counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreHealth {
    /// `true` while the durable store is considered unavailable.
    pub degraded: bool,
    /// Writes that only reached the local cache.
    pub fallback_writes: u64,
    /// Reads answered from the cache because the store failed.
    pub fallback_reads: u64,
    /// Number of degraded periods entered so far.
    pub outages: u64,
    /// Cached entries not yet persisted.
    pub dirty_entries: usize,
    /// Records rejected on load (bad MAC or undecodable).
    pub corrupt_records: u64,
}

// ---------------------------------------------------------------------------
// Cache state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum Origin {
    /// Created or mutated on this node.
    Local,
    /// Read from the durable store at the given instant.
    Loaded(Instant),
}

struct CachedSession {
    session: Session,
    origin: Origin,
    dirty: bool,
}

#[derive(Default)]
struct CacheState {
    sessions: HashMap<SessionId, CachedSession>,
    /// Deletes that could not reach the store yet.
    pending_deletes: HashSet<SessionId>,
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Constructor-injected session registry shared by the codec, the
/// scheduler and cluster sync.
///
/// All mutations of one session are serialized under an internal lock,
/// so a scheduler tick and inbound frame processing never interleave
/// partial updates.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    keys: SealingKeys,
    record_ttl_secs: u64,
    staleness: Duration,
    state: Mutex<CacheState>,
    degraded: AtomicBool,
    fallback_writes: AtomicU64,
    fallback_reads: AtomicU64,
    outages: AtomicU64,
    corrupt_records: AtomicU64,
}

// SessionStore does not implement Debug to prevent leakage of key
// material held in the cache.

impl SessionStore {
    /// Creates a store over `kv`, sealing records with `keys`.
    pub fn new(kv: Arc<dyn KvStore>, keys: SealingKeys, config: &ProtoConfig) -> Self {
        Self {
            kv,
            keys,
            record_ttl_secs: config.session_record_ttl_secs,
            staleness: Duration::from_secs(config.cache_staleness_secs),
            state: Mutex::new(CacheState::default()),
            degraded: AtomicBool::new(false),
            fallback_writes: AtomicU64::new(0),
            fallback_reads: AtomicU64::new(0),
            outages: AtomicU64::new(0),
            corrupt_records: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Returns a copy of the session, or `None` if it does not exist.
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, id);
        Ok(state.sessions.get(id).map(|c| c.session.clone()))
    }

    /// Like [`get`](Self::get) but fails with
    /// [`TailProtoError::SessionNotReady`] when the session is absent.
    pub fn require(&self, id: &SessionId) -> Result<Session> {
        self.get(id)?.ok_or_else(|| not_ready(id))
    }

    /// Number of sessions held by this node.
    pub fn size(&self) -> usize {
        self.lock().map(|s| s.sessions.len()).unwrap_or(0)
    }

    /// Copies of every cached session.
    pub fn snapshot_all(&self) -> Result<Vec<Session>> {
        let state = self.lock()?;
        Ok(state.sessions.values().map(|c| c.session.clone()).collect())
    }

    /// Ids of cached sessions bound to `user_id`.
    pub fn sessions_for_user(&self, user_id: &UserId) -> Result<Vec<SessionId>> {
        let state = self.lock()?;
        let mut ids: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|c| c.session.user_id.as_ref() == Some(user_id))
            .map(|c| c.session.session_id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// Current degraded-mode counters.
    pub fn health(&self) -> StoreHealth {
        let dirty_entries = self
            .lock()
            .map(|s| {
                s.sessions.values().filter(|c| c.dirty).count() + s.pending_deletes.len()
            })
            .unwrap_or(0);
        StoreHealth {
            degraded: self.degraded.load(Ordering::SeqCst),
            fallback_writes: self.fallback_writes.load(Ordering::SeqCst),
            fallback_reads: self.fallback_reads.load(Ordering::SeqCst),
            outages: self.outages.load(Ordering::SeqCst),
            dirty_entries,
            corrupt_records: self.corrupt_records.load(Ordering::SeqCst),
        }
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Creates and persists a new session with a fresh key.
    ///
    /// An existing session with the same id is replaced.
    pub fn create(
        &self,
        session_id: SessionId,
        user_id: Option<UserId>,
        auth_key: AuthKey,
        key_version: u32,
        now: Timestamp,
    ) -> Result<Session> {
        let session = Session::new(session_id, user_id, auth_key, key_version, now);
        self.install(session.clone())?;
        Ok(session)
    }

    /// Installs a fully-formed session, replacing any existing one.
    pub fn install(&self, session: Session) -> Result<()> {
        let mut state = self.lock()?;
        let id = session.session_id.clone();
        state.pending_deletes.remove(&id);
        state.sessions.insert(
            id.clone(),
            CachedSession {
                session,
                origin: Origin::Local,
                dirty: true,
            },
        );
        self.write_through_locked(&mut state, &id);
        Ok(())
    }

    /// Replaces the session with the one `f` builds from the current
    /// state (`None` if unknown), atomically.
    ///
    /// `f` may refuse by returning `Err`; the session is then left
    /// untouched.
    pub fn replace_with<F>(&self, id: &SessionId, f: F) -> Result<Session>
    where
        F: FnOnce(Option<&Session>) -> Result<Session>,
    {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, id);

        let session = f(state.sessions.get(id).map(|c| &c.session))?;
        if session.session_id != *id {
            return Err(TailProtoError::StorageError {
                reason: format!(
                    "replacement for '{id}' carries id '{}'",
                    session.session_id
                ),
            });
        }

        state.pending_deletes.remove(id);
        state.sessions.insert(
            id.clone(),
            CachedSession {
                session: session.clone(),
                origin: Origin::Local,
                dirty: true,
            },
        );
        self.write_through_locked(&mut state, id);
        Ok(session)
    }

    /// Applies `f` to the session atomically.
    ///
    /// `f` runs on a copy; the copy is committed and written through
    /// only if `f` returns `Ok`. A failing `f` leaves the session
    /// untouched.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::SessionNotReady`] if the session is absent,
    /// or whatever `f` returns.
    pub fn update<T, F>(&self, id: &SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, id);

        let mut working = match state.sessions.get(id) {
            Some(cached) => cached.session.clone(),
            None => return Err(not_ready(id)),
        };
        let out = f(&mut working)?;

        state.sessions.insert(
            id.clone(),
            CachedSession {
                session: working,
                origin: Origin::Local,
                dirty: true,
            },
        );
        self.write_through_locked(&mut state, id);
        Ok(out)
    }

    /// Rotates the session to `new_key`; see [`Session::rotate`].
    pub fn rotate(&self, id: &SessionId, new_key: AuthKey, now: Timestamp) -> Result<Session> {
        let session = self.update(id, |s| {
            s.rotate(new_key, now)?;
            Ok(s.clone())
        })?;
        tracing::info!(
            session_id = %id,
            key_version = session.key_version,
            "session key rotated"
        );
        Ok(session)
    }

    /// Drops the retained previous key, if any.
    pub fn destroy_old_key(&self, id: &SessionId) -> Result<()> {
        self.update(id, |s| {
            s.destroy_old_key();
            Ok(())
        })
    }

    /// Sets (or with `None`, clears) the hard rekey deadline.
    pub fn set_rekey_deadline(&self, id: &SessionId, deadline: Option<Timestamp>) -> Result<()> {
        self.update(id, |s| {
            s.rekey_deadline = deadline;
            Ok(())
        })
    }

    /// Binds the session to a user after login.
    pub fn bind_user(&self, id: &SessionId, user_id: UserId) -> Result<()> {
        self.update(id, |s| {
            s.user_id = Some(user_id);
            Ok(())
        })
    }

    /// Removes the session from the cache and the durable store.
    ///
    /// Destroying an unknown session is not an error.
    pub fn destroy(&self, id: &SessionId) -> Result<()> {
        let mut state = self.lock()?;
        state.sessions.remove(id);
        match self.kv.delete(&record_key(id)) {
            Ok(()) => {
                state.pending_deletes.remove(id);
                self.on_store_ok(&mut state);
            }
            Err(e) => {
                state.pending_deletes.insert(id.clone());
                self.on_store_err(&e);
                self.fallback_writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Pushes dirty entries and pending deletes to the durable store.
    ///
    /// Stops at the first failure. Returns the number of records
    /// synced. Called from the scheduler tick so recovery happens even
    /// on an idle node.
    pub fn sync_dirty(&self) -> Result<usize> {
        let mut state = self.lock()?;
        self.flush_locked(&mut state)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| TailProtoError::StorageError {
            reason: "session cache lock poisoned".into(),
        })
    }

    /// Makes sure the cache entry for `id` reflects the store, unless
    /// it is locally authoritative or still fresh.
    fn refresh_locked(&self, state: &mut CacheState, id: &SessionId) {
        if state.pending_deletes.contains(id) {
            return;
        }
        match state.sessions.get(id).map(|c| (c.origin, c.dirty)) {
            Some((Origin::Local, _)) | Some((_, true)) => return,
            Some((Origin::Loaded(at), false)) if at.elapsed() < self.staleness => return,
            _ => {}
        }

        match self.load(id) {
            Ok(Some(session)) => {
                self.on_store_ok(state);
                state.sessions.insert(
                    id.clone(),
                    CachedSession {
                        session,
                        origin: Origin::Loaded(Instant::now()),
                        dirty: false,
                    },
                );
            }
            Ok(None) => {
                self.on_store_ok(state);
                state.sessions.remove(id);
            }
            Err(e) => {
                self.on_store_err(&e);
                if state.sessions.contains_key(id) {
                    self.fallback_reads.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Reads and opens one record. Corrupt records read as absent.
    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let raw = match self.kv.get(&record_key(id))? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let decoded = sealed::open(&self.keys, &raw).and_then(|plain| {
            bincode::deserialize::<Session>(&plain).map_err(|e| TailProtoError::StorageError {
                reason: format!("session record decode failed: {e}"),
            })
        });
        match decoded {
            Ok(session) if session.session_id == *id => Ok(Some(session)),
            Ok(_) => {
                self.corrupt_records.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(session_id = %id, "session record id mismatch, ignoring");
                Ok(None)
            }
            Err(e) => {
                self.corrupt_records.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(session_id = %id, error = %e, "session record rejected");
                Ok(None)
            }
        }
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let plain = bincode::serialize(session).map_err(|e| TailProtoError::StorageError {
            reason: format!("session record encode failed: {e}"),
        })?;
        let blob = sealed::seal(&self.keys, &plain)?;
        self.kv
            .set(&record_key(&session.session_id), &blob, self.record_ttl_secs)
    }

    /// Writes one dirty entry. On failure the entry stays dirty and
    /// the store degrades; the caller still succeeds.
    fn write_through_locked(&self, state: &mut CacheState, id: &SessionId) {
        let result = match state.sessions.get(id) {
            Some(cached) => self.persist(&cached.session),
            None => return,
        };
        match result {
            Ok(()) => {
                if let Some(cached) = state.sessions.get_mut(id) {
                    cached.dirty = false;
                }
                self.on_store_ok(state);
            }
            Err(e) => {
                self.on_store_err(&e);
                self.fallback_writes.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(session_id = %id, "session kept in cache only");
            }
        }
    }

    fn flush_locked(&self, state: &mut CacheState) -> Result<usize> {
        let mut synced = 0usize;

        let deletes: Vec<SessionId> = state.pending_deletes.iter().cloned().collect();
        for id in deletes {
            if let Err(e) = self.kv.delete(&record_key(&id)) {
                self.on_store_err(&e);
                return Ok(synced);
            }
            state.pending_deletes.remove(&id);
            synced += 1;
        }

        let dirty: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dirty {
            let result = match state.sessions.get(&id) {
                Some(cached) => self.persist(&cached.session),
                None => continue,
            };
            if let Err(e) = result {
                self.on_store_err(&e);
                return Ok(synced);
            }
            if let Some(cached) = state.sessions.get_mut(&id) {
                cached.dirty = false;
            }
            synced += 1;
        }

        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(synced, "session store recovered, leaving degraded mode");
        }
        Ok(synced)
    }

    /// A store call succeeded: leave degraded mode and resync.
    fn on_store_ok(&self, state: &mut CacheState) {
        if self.degraded.load(Ordering::SeqCst) {
            // flush_locked clears the flag only if every entry lands.
            let _ = self.flush_locked(state);
        }
    }

    fn on_store_err(&self, err: &TailProtoError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.outages.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                error = %err,
                "session store unavailable, entering degraded mode (cache authoritative)"
            );
        }
    }
}

fn not_ready(id: &SessionId) -> TailProtoError {
    TailProtoError::SessionNotReady {
        reason: format!("no session for '{id}'"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_millis(1_700_000_000_000 + secs * 1000)
    }

    fn keys() -> SealingKeys {
        SealingKeys::new([0x11; 32], [0x22; 32])
    }

    fn store(kv: Arc<MemoryKvStore>) -> SessionStore {
        SessionStore::new(kv, keys(), &ProtoConfig::default())
    }

    #[test]
    fn create_persists_sealed_record() -> std::result::Result<(), TailProtoError> {
        let kv = Arc::new(MemoryKvStore::new());
        let s = store(kv.clone());
        let id = SessionId::new("s1");
        s.create(id.clone(), None, AuthKey::from_bytes([1; 32]), 1, ts(0))?;

        let raw = kv.get(&record_key(&id))?;
        let raw = raw.ok_or_else(|| TailProtoError::StorageError { reason: "missing".into() })?;
        // Key material never lands in the store in the clear.
        assert!(!raw.windows(32).any(|w| w == [1u8; 32]));
        assert_eq!(s.size(), 1);
        Ok(())
    }

    #[test]
    fn failing_update_leaves_session_untouched() -> std::result::Result<(), TailProtoError> {
        let s = store(Arc::new(MemoryKvStore::new()));
        let id = SessionId::new("s1");
        s.create(id.clone(), None, AuthKey::from_bytes([1; 32]), 1, ts(0))?;

        let r: Result<()> = s.update(&id, |sess| {
            sess.last_seq = 99;
            Err(TailProtoError::InvalidSequence { reason: "nope".into() })
        });
        assert!(r.is_err());
        assert_eq!(s.require(&id)?.last_seq, 0);
        Ok(())
    }

    #[test]
    fn missing_session_is_not_ready() {
        let s = store(Arc::new(MemoryKvStore::new()));
        assert!(matches!(
            s.require(&SessionId::new("ghost")),
            Err(TailProtoError::SessionNotReady { .. })
        ));
        assert!(s.destroy_old_key(&SessionId::new("ghost")).is_err());
    }

    #[test]
    fn corrupt_record_reads_as_absent() -> std::result::Result<(), TailProtoError> {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(&record_key(&SessionId::new("bad")), &[0u8; 80], 0)?;
        let s = store(kv);
        assert!(s.get(&SessionId::new("bad"))?.is_none());
        assert_eq!(s.health().corrupt_records, 1);
        Ok(())
    }
}
