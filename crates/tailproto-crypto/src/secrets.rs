//! Server-side secrets derived from the cluster master secret.
//!
//! Every node of a cluster is configured with the same 32-byte master
//! secret. Sub-keys are split off with HKDF-SHA256 so that resume
//! tokens, bus signatures, and persisted records never share a key.

use tailproto_types::{Result, TailProtoError};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hkdf::hkdf_sha256;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// HKDF salt for all server sub-keys.
const SECRETS_SALT: &[u8] = b"tailproto/server-secrets";

const INFO_TOKEN_ENC: &[u8] = b"resume-token/enc";
const INFO_TOKEN_MAC: &[u8] = b"resume-token/mac";
const INFO_STORE_ENC: &[u8] = b"session-store/enc";
const INFO_STORE_MAC: &[u8] = b"session-store/mac";
const INFO_BUS_MAC: &[u8] = b"cluster-bus/mac";

// ---------------------------------------------------------------------------
// SealingKeys
// ---------------------------------------------------------------------------

/// Encryption + MAC key pair for Encrypt-then-MAC blobs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKeys {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl SealingKeys {
    /// Builds a key pair from raw bytes.
    pub fn new(enc_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        Self { enc_key, mac_key }
    }

    /// Key for ChaCha20-Poly1305.
    pub fn enc_key(&self) -> &[u8; 32] {
        &self.enc_key
    }

    /// Key for HMAC-SHA256.
    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }
}

// ---------------------------------------------------------------------------
// ServerSecrets
// ---------------------------------------------------------------------------

/// Domain-separated sub-keys of the cluster master secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ServerSecrets {
    token: SealingKeys,
    store: SealingKeys,
    bus_mac_key: [u8; 32],
}

impl ServerSecrets {
    /// Derives all sub-keys from a 32-byte master secret.
    pub fn derive(master: &[u8; 32]) -> Result<Self> {
        let sub = |info: &[u8]| -> Result<[u8; 32]> {
            hkdf_sha256(master, SECRETS_SALT, info, 32)?.to_key32()
        };

        Ok(Self {
            token: SealingKeys::new(sub(INFO_TOKEN_ENC)?, sub(INFO_TOKEN_MAC)?),
            store: SealingKeys::new(sub(INFO_STORE_ENC)?, sub(INFO_STORE_MAC)?),
            bus_mac_key: sub(INFO_BUS_MAC)?,
        })
    }

    /// Parses a hex-encoded master secret and derives all sub-keys.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::ConfigError`] if the string is not 64 hex chars.
    pub fn from_hex(master_hex: &str) -> Result<Self> {
        let mut bytes = hex::decode(master_hex.trim()).map_err(|_| TailProtoError::ConfigError {
            reason: "master secret is not valid hex".into(),
        })?;
        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(TailProtoError::ConfigError {
                reason: format!("master secret must be 32 bytes, got {len}"),
            });
        }
        let mut master = [0u8; 32];
        master.copy_from_slice(&bytes);
        bytes.zeroize();

        let secrets = Self::derive(&master);
        master.zeroize();
        secrets
    }

    /// Keys protecting resume tokens.
    pub fn token_keys(&self) -> &SealingKeys {
        &self.token
    }

    /// Keys protecting persisted session records.
    pub fn store_keys(&self) -> &SealingKeys {
        &self.store
    }

    /// Key signing cluster bus payloads.
    pub fn bus_mac_key(&self) -> &[u8; 32] {
        &self.bus_mac_key
    }
}

// ServerSecrets does not implement Debug to prevent leakage.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_keys_are_distinct() -> std::result::Result<(), TailProtoError> {
        let s = ServerSecrets::derive(&[0x42; 32])?;
        assert_ne!(s.token_keys().enc_key(), s.token_keys().mac_key());
        assert_ne!(s.token_keys().enc_key(), s.store_keys().enc_key());
        assert_ne!(s.bus_mac_key(), s.store_keys().mac_key());
        Ok(())
    }

    #[test]
    fn derivation_is_deterministic_across_nodes() -> std::result::Result<(), TailProtoError> {
        let a = ServerSecrets::derive(&[0x07; 32])?;
        let b = ServerSecrets::derive(&[0x07; 32])?;
        assert_eq!(a.bus_mac_key(), b.bus_mac_key());
        assert_eq!(a.token_keys().mac_key(), b.token_keys().mac_key());
        Ok(())
    }

    #[test]
    fn from_hex_validates_length() {
        assert!(ServerSecrets::from_hex(&"ab".repeat(32)).is_ok());
        assert!(ServerSecrets::from_hex("abcd").is_err());
        assert!(ServerSecrets::from_hex("zz").is_err());
    }
}
