//! Protocol configuration with sensible defaults.
//!
//! All operational parameters of the session layer are centralized
//! here. Every value has a documented default.

use serde::{Deserialize, Serialize};

use crate::{Result, TailProtoError};

/// Upper bound for every duration setting (ten years, in seconds) and
/// for the replay window.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

/// Tunables for the envelope codec, rekey scheduler, resumption, and
/// cluster sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtoConfig {
    /// How long after a rotation frames under the previous key version
    /// are still accepted, in seconds. Also bounds the lifetime of the
    /// retained old key.
    pub accept_old_key_window_secs: u64,

    /// Maximum number of frames accepted under the old key.
    pub max_old_key_hits: u32,

    /// Maximum time between the first and last accepted old-key frame,
    /// in seconds.
    pub max_old_key_duration_secs: u64,

    /// Number of sequence numbers behind `lastSeq` tolerated as benign
    /// reordering.
    pub replay_window: u64,

    /// When `true`, frames older than the replay window are rejected
    /// with `InvalidSequence` instead of soft-accepted.
    pub strict_replay_window: bool,

    /// Lifetime of cached responses for idempotent requests, in seconds.
    pub response_cache_ttl_secs: u64,

    /// Maximum number of cached responses held per node.
    pub response_cache_capacity: usize,

    /// Scheduler tick interval and key age that triggers a rekey, in seconds.
    pub rekey_interval_secs: u64,

    /// Time a client has to complete a fresh handshake after a rekey
    /// notice, in seconds.
    pub rekey_deadline_grace_secs: u64,

    /// Lifetime of the per-user rotation lock, in seconds.
    pub rekey_lock_ttl_secs: u64,

    /// Lifetime of issued resume tokens, in seconds.
    pub resume_token_ttl_secs: u64,

    /// TTL applied to persisted session records, in seconds.
    pub session_record_ttl_secs: u64,

    /// Maximum age of a cached session before it is re-read from the
    /// durable store while the store is healthy, in seconds.
    pub cache_staleness_secs: u64,

    /// Defensive re-handshake notices allowed per session per minute.
    pub rehandshake_per_min: u32,

    /// Plaintext size at or above which AEAD work is moved off the
    /// calling task, in bytes.
    pub offload_threshold_bytes: usize,

    /// How long processed rekey request ids are remembered, in seconds.
    pub bus_dedupe_ttl_secs: u64,

    /// Maximum number of inner items in one batch frame.
    pub max_batch_items: usize,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        Self {
            accept_old_key_window_secs: 60,
            max_old_key_hits: 64,
            max_old_key_duration_secs: 30,
            replay_window: 64,
            strict_replay_window: false,
            response_cache_ttl_secs: 60,
            response_cache_capacity: 10_000,
            rekey_interval_secs: 3600,
            rekey_deadline_grace_secs: 120,
            rekey_lock_ttl_secs: 30,
            resume_token_ttl_secs: 86_400,
            session_record_ttl_secs: 86_400,
            cache_staleness_secs: 5,
            rehandshake_per_min: 2,
            offload_threshold_bytes: 65_536,
            bus_dedupe_ttl_secs: 300,
            max_batch_items: 32,
        }
    }
}

impl ProtoConfig {
    /// Validates all configuration values.
    ///
    /// Returns an error if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        let non_zero: [(&str, u64); 9] = [
            ("accept_old_key_window_secs", self.accept_old_key_window_secs),
            ("max_old_key_duration_secs", self.max_old_key_duration_secs),
            ("replay_window", self.replay_window),
            ("response_cache_ttl_secs", self.response_cache_ttl_secs),
            ("rekey_interval_secs", self.rekey_interval_secs),
            ("rekey_deadline_grace_secs", self.rekey_deadline_grace_secs),
            ("rekey_lock_ttl_secs", self.rekey_lock_ttl_secs),
            ("resume_token_ttl_secs", self.resume_token_ttl_secs),
            ("session_record_ttl_secs", self.session_record_ttl_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(TailProtoError::ConfigError {
                    reason: format!("{name} must be greater than 0"),
                });
            }
        }

        let bounded: [(&str, u64); 11] = [
            ("accept_old_key_window_secs", self.accept_old_key_window_secs),
            ("max_old_key_duration_secs", self.max_old_key_duration_secs),
            ("response_cache_ttl_secs", self.response_cache_ttl_secs),
            ("rekey_interval_secs", self.rekey_interval_secs),
            ("rekey_deadline_grace_secs", self.rekey_deadline_grace_secs),
            ("rekey_lock_ttl_secs", self.rekey_lock_ttl_secs),
            ("resume_token_ttl_secs", self.resume_token_ttl_secs),
            ("session_record_ttl_secs", self.session_record_ttl_secs),
            ("cache_staleness_secs", self.cache_staleness_secs),
            ("bus_dedupe_ttl_secs", self.bus_dedupe_ttl_secs),
            ("replay_window", self.replay_window),
        ];
        for (name, value) in bounded {
            if value > MAX_DURATION_SECS {
                return Err(TailProtoError::ConfigError {
                    reason: format!("{name} ({value}) exceeds {MAX_DURATION_SECS}"),
                });
            }
        }

        if self.max_old_key_hits == 0 {
            return Err(TailProtoError::ConfigError {
                reason: "max_old_key_hits must be greater than 0".into(),
            });
        }

        if self.response_cache_capacity == 0 {
            return Err(TailProtoError::ConfigError {
                reason: "response_cache_capacity must be greater than 0".into(),
            });
        }

        if self.max_batch_items == 0 {
            return Err(TailProtoError::ConfigError {
                reason: "max_batch_items must be greater than 0".into(),
            });
        }

        if self.accept_old_key_window_secs >= self.rekey_interval_secs {
            return Err(TailProtoError::ConfigError {
                reason: format!(
                    "accept_old_key_window_secs ({}) must be shorter than rekey_interval_secs ({})",
                    self.accept_old_key_window_secs, self.rekey_interval_secs,
                ),
            });
        }

        Ok(())
    }
}
