//! The session [`AuthKey`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tailproto_types::AuthKeyId;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::auth_key_id;

/// 256-bit symmetric session key.
///
/// Cloned into session snapshots and resume tokens, so it implements
/// `Clone` and `Serialize`; every copy is zeroized on drop and `Debug`
/// never prints key bytes.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey([u8; 32]);

impl AuthKey {
    /// Fixed byte length of an AuthKey.
    pub const LEN: usize = 32;

    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fingerprint of this key.
    pub fn id(&self) -> AuthKeyId {
        auth_key_id(&self.0)
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey({})", self.id())
    }
}
