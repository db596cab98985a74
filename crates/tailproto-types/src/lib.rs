//! Core shared types for the TailProto secure session layer.
//!
//! This crate defines the identifiers, timestamps, error enum, and
//! configuration shared by every crate in the workspace. No other
//! crate should define shared types; everything lives here.

pub mod config;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identity of one logical connection.
///
/// Assigned by the transport when a connection is accepted. A session
/// id is opaque to the protocol core; it is only compared and hashed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new `SessionId` from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Application user bound to a session after login.
///
/// A user may hold several live sessions at once (multiple devices,
/// or connections terminating on different nodes).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a new `UserId`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identifier of one server process in the cluster.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new `NodeId`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// AuthKeyId
// ---------------------------------------------------------------------------

/// Fingerprint of an auth key: the first 16 bytes of `SHA-256(authKey)`.
///
/// Rendered as 32 lowercase hex characters on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AuthKeyId([u8; 16]);

impl AuthKeyId {
    /// The fixed byte length of a fingerprint.
    pub const LEN: usize = 16;

    /// Creates an `AuthKeyId` from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AuthKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for AuthKeyId {
    type Err = TailProtoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TailProtoError::ProtocolError {
            reason: "invalid hex encoding for auth key id".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(TailProtoError::ProtocolError {
                reason: format!("expected 16 bytes for auth key id, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC instant with millisecond precision.
///
/// Every time-dependent protocol decision takes a `Timestamp` argument
/// instead of reading the clock, so callers and tests control time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` representing the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a `Timestamp` from a `DateTime<Utc>`.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Creates a `Timestamp` from milliseconds since the Unix epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    pub fn from_millis(millis: i64) -> Self {
        let dt = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self(dt)
    }

    /// Returns the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns this instant shifted forward by `secs` seconds, saturating
    /// at the latest representable instant.
    pub fn plus_secs(&self, secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        let shifted = self
            .0
            .checked_add_signed(Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self(shifted)
    }

    /// Milliseconds elapsed from `earlier` to `self`. Negative if
    /// `earlier` lies in the future.
    pub fn millis_since(&self, earlier: &Timestamp) -> i64 {
        (self.0 - earlier.0).num_milliseconds()
    }

    /// `true` if more than `secs` seconds separate `earlier` and `self`.
    pub fn exceeds(&self, earlier: &Timestamp, secs: u64) -> bool {
        let limit = i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000);
        self.millis_since(earlier) > limit
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// TailProtoError
// ---------------------------------------------------------------------------

/// Central error type for the TailProto session layer.
///
/// All crates in the workspace convert their internal errors into
/// variants of this enum. The protocol kinds are reported to the peer
/// as structured failure results (see [`TailProtoError::code`]).
#[derive(Debug, Error)]
pub enum TailProtoError {
    /// Envelope key version is neither current nor an acceptable previous version.
    #[error("invalid key version: {reason}")]
    InvalidKeyVersion {
        /// Human-readable description of the version mismatch.
        reason: String,
    },

    /// AEAD decryption failed (tag mismatch, truncated input, wrong key).
    #[error("decrypt failed: {reason}")]
    DecryptFailed {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// Sequence number rejected.
    #[error("invalid sequence: {reason}")]
    InvalidSequence {
        /// Human-readable description of the sequence problem.
        reason: String,
    },

    /// The session's rekey deadline has passed without a fresh handshake.
    #[error("rekey deadline exceeded: {reason}")]
    RekeyDeadlineExceeded {
        /// Human-readable description including the deadline.
        reason: String,
    },

    /// The previous key's reuse budget is exhausted.
    #[error("old key reuse exceeded: {reason}")]
    KeyReuseExceeded {
        /// Human-readable description of the exhausted budget.
        reason: String,
    },

    /// A non-whitelisted frame arrived without a valid envelope.
    #[error("protocol required: {reason}")]
    ProtocolRequired {
        /// Human-readable description of the offending frame.
        reason: String,
    },

    /// An operation was attempted before the handshake completed.
    #[error("session not ready: {reason}")]
    SessionNotReady {
        /// Human-readable description of the missing state.
        reason: String,
    },

    /// The key agreement could not be completed.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Human-readable description of the handshake failure.
        reason: String,
    },

    /// A resume token failed authentication, decryption, or expiry checks.
    #[error("resume token invalid: {reason}")]
    ResumeTokenInvalid {
        /// Human-readable description of why the token was rejected.
        reason: String,
    },

    /// A cryptographic primitive failed.
    #[error("crypto error: {reason}")]
    CryptoError {
        /// Human-readable description of the cryptographic failure.
        reason: String,
    },

    /// A storage or record-format operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// The durable session store is unreachable.
    #[error("store unavailable: {reason}")]
    StoreUnavailable {
        /// Human-readable description of the outage.
        reason: String,
    },

    /// Frame or payload could not be parsed or serialized.
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Human-readable description of the malformed input.
        reason: String,
    },

    /// Publishing to or consuming from the cluster bus failed.
    #[error("bus error: {reason}")]
    BusError {
        /// Human-readable description of the bus failure.
        reason: String,
    },

    /// The distributed lock service failed.
    #[error("lock error: {reason}")]
    LockError {
        /// Human-readable description of the lock failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

impl TailProtoError {
    /// Stable snake_case code sent to the peer in failure frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKeyVersion { .. } => "invalid_key_version",
            Self::DecryptFailed { .. } => "decrypt_failed",
            Self::InvalidSequence { .. } => "invalid_sequence",
            Self::RekeyDeadlineExceeded { .. } => "rekey_deadline_exceeded",
            Self::KeyReuseExceeded { .. } => "key_reuse_exceeded",
            Self::ProtocolRequired { .. } => "protocol_required",
            Self::SessionNotReady { .. } => "session_not_ready",
            Self::HandshakeFailed { .. } => "handshake_failed",
            Self::ResumeTokenInvalid { .. } => "resume_token_invalid",
            Self::CryptoError { .. } => "crypto_error",
            Self::StorageError { .. } => "storage_error",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::ProtocolError { .. } => "protocol_error",
            Self::BusError { .. } => "bus_error",
            Self::LockError { .. } => "lock_error",
            Self::ConfigError { .. } => "config_error",
        }
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`TailProtoError`].
pub type Result<T> = std::result::Result<T, TailProtoError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
