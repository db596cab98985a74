//! The per-connection [`Session`] entity.
//!
//! # Invariants
//!
//! - `auth_key_id` is always the fingerprint of the current `auth_key`.
//! - `old_key` is never equal to `auth_key`.
//! - `key_version` never decreases.

use serde::{Deserialize, Serialize};
use tailproto_crypto::key::AuthKey;
use tailproto_types::{AuthKeyId, Result, SessionId, TailProtoError, Timestamp, UserId};

/// Security state of one logical connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Connection identity.
    pub session_id: SessionId,
    /// User bound after login, if any.
    pub user_id: Option<UserId>,
    /// Current symmetric key.
    pub auth_key: AuthKey,
    /// Fingerprint of `auth_key`.
    pub auth_key_id: AuthKeyId,
    /// Rotation counter, starting at 1.
    pub key_version: u32,
    /// When the current key was installed.
    pub key_version_timestamp: Timestamp,
    /// Highest accepted inbound sequence number.
    pub last_seq: u64,
    /// Last sequence number used for an outbound envelope.
    pub out_seq: u64,
    /// Previous key, retained during the rotation grace window.
    pub old_key: Option<AuthKey>,
    /// When `old_key` was retired.
    pub old_key_created_at: Option<Timestamp>,
    /// Frames accepted under `old_key` so far.
    pub old_key_hit_count: u32,
    /// First time a frame was accepted under `old_key`.
    pub old_key_first_hit_at: Option<Timestamp>,
    /// Hard cut-over instant after a rekey notice.
    pub rekey_deadline: Option<Timestamp>,
    /// When the session was first established.
    pub created_at: Timestamp,
}

impl Session {
    /// Creates a session for a freshly derived key.
    ///
    /// A `key_version` of 0 is raised to 1.
    pub fn new(
        session_id: SessionId,
        user_id: Option<UserId>,
        auth_key: AuthKey,
        key_version: u32,
        now: Timestamp,
    ) -> Self {
        let auth_key_id = auth_key.id();
        Self {
            session_id,
            user_id,
            auth_key,
            auth_key_id,
            key_version: key_version.max(1),
            key_version_timestamp: now,
            last_seq: 0,
            out_seq: 0,
            old_key: None,
            old_key_created_at: None,
            old_key_hit_count: 0,
            old_key_first_hit_at: None,
            rekey_deadline: None,
            created_at: now,
        }
    }

    /// Installs `new_key` as the current key.
    ///
    /// The current key moves to `old_key` with a fresh timestamp and
    /// reset hit counters, `key_version` increments, and
    /// `key_version_timestamp` resets to `now`.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::CryptoError`] if `new_key` equals the current
    /// key, or the version counter would overflow.
    pub fn rotate(&mut self, new_key: AuthKey, now: Timestamp) -> Result<()> {
        if new_key == self.auth_key {
            return Err(TailProtoError::CryptoError {
                reason: "rotation key equals the current key".into(),
            });
        }
        let next_version = self.key_version.checked_add(1).ok_or_else(|| {
            TailProtoError::CryptoError {
                reason: "key version overflow".into(),
            }
        })?;

        let retired = std::mem::replace(&mut self.auth_key, new_key);
        self.auth_key_id = self.auth_key.id();
        self.old_key = Some(retired);
        self.old_key_created_at = Some(now);
        self.old_key_hit_count = 0;
        self.old_key_first_hit_at = None;
        self.key_version = next_version;
        self.key_version_timestamp = now;
        Ok(())
    }

    /// Drops the retained previous key and its bookkeeping.
    pub fn destroy_old_key(&mut self) {
        self.old_key = None;
        self.old_key_created_at = None;
        self.old_key_hit_count = 0;
        self.old_key_first_hit_at = None;
    }

    /// `true` if an old key is held and was retired more than
    /// `window_secs` ago.
    pub fn old_key_expired(&self, now: &Timestamp, window_secs: u64) -> bool {
        match (&self.old_key, &self.old_key_created_at) {
            (Some(_), Some(created)) => now.exceeds(created, window_secs),
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// `true` if a rekey deadline is set and has passed.
    pub fn deadline_passed(&self, now: &Timestamp) -> bool {
        self.rekey_deadline.map(|d| *now > d).unwrap_or(false)
    }

    /// Allocates the next outbound sequence number.
    pub fn next_out_seq(&mut self) -> u64 {
        self.out_seq = self.out_seq.saturating_add(1);
        self.out_seq
    }
}
