//! HMAC-SHA256 message authentication codes.
//!
//! Signs resume tokens, sealed session records, and cluster bus
//! payloads. Verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tailproto_types::{Result, TailProtoError};

type HmacSha256 = Hmac<Sha256>;

/// Fixed output length of HMAC-SHA256 in bytes.
pub const HMAC_SHA256_LEN: usize = 32;

/// Computes HMAC-SHA256 over `data` using `key`.
///
/// # Errors
///
/// Returns [`TailProtoError::CryptoError`] if HMAC initialisation fails
/// (should not happen with SHA-256, but we avoid `unwrap`).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| TailProtoError::CryptoError {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    mac.update(data);

    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

/// Verifies an HMAC-SHA256 tag in constant time.
///
/// `expected` may be any length; anything other than a matching
/// 32-byte tag fails.
///
/// # Errors
///
/// Returns [`TailProtoError::CryptoError`] on initialisation failure or
/// tag mismatch.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| TailProtoError::CryptoError {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    mac.update(data);

    mac.verify_slice(expected).map_err(|_| TailProtoError::CryptoError {
        reason: "HMAC-SHA256 verification failed: tag mismatch".into(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_roundtrip() -> std::result::Result<(), TailProtoError> {
        let key = [0x42u8; 32];
        let tag = hmac_sha256(&key, b"rekey-request")?;
        verify_hmac_sha256(&key, b"rekey-request", &tag)?;
        Ok(())
    }

    #[test]
    fn wrong_data_fails_verify() -> std::result::Result<(), TailProtoError> {
        let key = [0x42; 32];
        let tag = hmac_sha256(&key, b"correct")?;
        assert!(verify_hmac_sha256(&key, b"wrong", &tag).is_err());
        Ok(())
    }

    #[test]
    fn wrong_key_fails_verify() -> std::result::Result<(), TailProtoError> {
        let tag = hmac_sha256(&[0x01; 32], b"data")?;
        assert!(verify_hmac_sha256(&[0x02; 32], b"data", &tag).is_err());
        Ok(())
    }

    #[test]
    fn truncated_tag_fails_verify() -> std::result::Result<(), TailProtoError> {
        let key = [0x42; 32];
        let tag = hmac_sha256(&key, b"data")?;
        assert!(verify_hmac_sha256(&key, b"data", &tag[..16]).is_err());
        Ok(())
    }

    /// RFC 4231 Test Case 2: HMAC-SHA-256.
    #[test]
    fn rfc4231_test_case_2() -> std::result::Result<(), TailProtoError> {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?")?;
        let expected: [u8; 32] = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e,
            0x6a, 0x04, 0x24, 0x26, 0x08, 0x95, 0x75, 0xc7,
            0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83,
            0x9d, 0xec, 0x58, 0xb9, 0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(tag, expected);
        Ok(())
    }
}
