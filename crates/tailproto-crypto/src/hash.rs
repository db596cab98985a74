//! SHA-256 hashing and auth key fingerprints.

use sha2::{Digest, Sha256};
use tailproto_types::AuthKeyId;

/// Computes the SHA-256 digest of arbitrary data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Computes the fingerprint of an auth key:
/// `SHA-256(key)` truncated to its first 16 bytes.
pub fn auth_key_id(key: &[u8; 32]) -> AuthKeyId {
    let digest = sha256(key);
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    AuthKeyId::new(id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// NIST SHA-256 test vector: "abc".
    #[test]
    fn sha256_abc() {
        let expected = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea,
            0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22, 0x23,
            0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c,
            0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00, 0x15, 0xad,
        ];
        assert_eq!(sha256(b"abc"), expected);
    }

    #[test]
    fn auth_key_id_is_digest_prefix() {
        let key = [0x42u8; 32];
        let id = auth_key_id(&key);
        assert_eq!(id.as_bytes().as_slice(), &sha256(&key)[..16]);
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn different_keys_different_ids() {
        assert_ne!(auth_key_id(&[0x01; 32]), auth_key_id(&[0x02; 32]));
    }
}
