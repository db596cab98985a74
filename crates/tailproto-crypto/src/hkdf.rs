//! HKDF-SHA256 key derivation.
//!
//! Implements the HMAC-based Extract-and-Expand Key Derivation Function
//! (RFC 5869) using SHA-256. Used to turn ECDH shared secrets into
//! session AuthKeys and to split the cluster master secret into
//! domain-separated sub-keys.

use hkdf::Hkdf;
use sha2::Sha256;
use tailproto_types::{Result, TailProtoError};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ecdh::SharedSecret;
use crate::key::AuthKey;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum output length in bytes.
const MAX_OUTPUT_LEN: usize = 64;

/// Fixed HKDF `info` for AuthKey derivation.
///
/// The salt is empty, so both parties derive the same key from the
/// same shared secret regardless of who initiated.
pub const AUTH_KEY_CONTEXT: &[u8] = b"tailproto/v2/auth-key";

// ---------------------------------------------------------------------------
// HkdfOutput
// ---------------------------------------------------------------------------

/// Variable-length key material derived by HKDF-SHA256.
///
/// Zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HkdfOutput {
    bytes: Vec<u8>,
}

impl HkdfOutput {
    /// Returns the derived key material as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the length of the derived key material.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the output is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copies the first 32 bytes into a fixed array.
    ///
    /// # Errors
    ///
    /// Returns [`TailProtoError::CryptoError`] if the output is not
    /// exactly 32 bytes long.
    pub fn to_key32(&self) -> Result<[u8; 32]> {
        if self.bytes.len() != 32 {
            return Err(TailProtoError::CryptoError {
                reason: format!(
                    "HKDF output length mismatch: expected 32, got {}",
                    self.bytes.len()
                ),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.bytes);
        Ok(key)
    }
}

// HkdfOutput does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derives key material using HKDF-SHA256.
///
/// An empty `salt` is valid per RFC 5869 §3.1 (treated as a zero-filled
/// salt of hash length). `output_len` must be in `1..=64`.
///
/// # Errors
///
/// [`TailProtoError::CryptoError`] if `output_len` is out of range or
/// expansion fails.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<HkdfOutput> {
    if output_len == 0 || output_len > MAX_OUTPUT_LEN {
        return Err(TailProtoError::CryptoError {
            reason: format!("HKDF output length {output_len} outside 1..={MAX_OUTPUT_LEN}"),
        });
    }

    let salt_opt: Option<&[u8]> = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm).map_err(|e| TailProtoError::CryptoError {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })?;

    Ok(HkdfOutput { bytes: okm })
}

/// Derives the 32-byte session AuthKey from an ECDH shared secret.
///
/// ```text
/// authKey = HKDF-SHA256(IKM = shared, salt = "", info = AUTH_KEY_CONTEXT, L = 32)
/// ```
pub fn derive_auth_key(shared: &SharedSecret) -> Result<AuthKey> {
    let out = hkdf_sha256(shared.as_bytes(), &[], AUTH_KEY_CONTEXT, 32)?;
    Ok(AuthKey::from_bytes(out.to_key32()?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_32_bytes_deterministic() -> std::result::Result<(), TailProtoError> {
        let out1 = hkdf_sha256(&[0x42; 32], b"salt", b"info", 32)?;
        let out2 = hkdf_sha256(&[0x42; 32], b"salt", b"info", 32)?;
        assert_eq!(out1.as_bytes(), out2.as_bytes());
        assert_eq!(out1.len(), 32);
        Ok(())
    }

    #[test]
    fn different_info_different_output() -> std::result::Result<(), TailProtoError> {
        let a = hkdf_sha256(&[0x42; 32], b"", b"info-a", 32)?;
        let b = hkdf_sha256(&[0x42; 32], b"", b"info-b", 32)?;
        assert_ne!(a.as_bytes(), b.as_bytes());
        Ok(())
    }

    #[test]
    fn output_len_bounds() {
        assert!(hkdf_sha256(&[0x01; 32], b"", b"info", 0).is_err());
        assert!(hkdf_sha256(&[0x01; 32], b"", b"info", 65).is_err());
        assert!(hkdf_sha256(&[0x01; 32], b"", b"info", 64).is_ok());
    }

    #[test]
    fn to_key32_rejects_wrong_length() -> std::result::Result<(), TailProtoError> {
        let out = hkdf_sha256(&[0x01; 32], b"", b"info", 16)?;
        assert!(out.to_key32().is_err());
        Ok(())
    }

    /// RFC 5869 Test Case 1 (HKDF-SHA256).
    #[test]
    fn rfc5869_test_vector_1() -> std::result::Result<(), TailProtoError> {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00u8..=0x0c).collect();
        let info: Vec<u8> = (0xf0u8..=0xf9).collect();

        let out = hkdf_sha256(&ikm, &salt, &info, 42)?;
        let expected = [
            0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a,
            0x90, 0x43, 0x4f, 0x64, 0xd0, 0x36, 0x2f, 0x2a,
            0x2d, 0x2d, 0x0a, 0x90, 0xcf, 0x1a, 0x5a, 0x4c,
            0x5d, 0xb0, 0x2d, 0x56, 0xec, 0xc4, 0xc5, 0xbf,
            0x34, 0x00, 0x72, 0x08, 0xd5, 0xb8, 0x87, 0x18,
            0x58, 0x65,
        ];
        assert_eq!(out.as_bytes(), &expected);
        Ok(())
    }
}
