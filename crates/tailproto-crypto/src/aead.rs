//! ChaCha20-Poly1305 authenticated encryption with 96-bit IVs.
//!
//! Every envelope, sealed record, and resume token is encrypted with
//! ChaCha20-Poly1305 (RFC 8439). IVs are 12 random bytes from OS
//! entropy and **must never be reused** with the same key.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tailproto_types::{Result, TailProtoError};

/// Length of the Poly1305 authentication tag appended to ciphertexts.
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Iv
// ---------------------------------------------------------------------------

/// 96-bit (12-byte) AEAD initialisation vector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Iv([u8; 12]);

impl Iv {
    /// Fixed byte length of an IV.
    pub const LEN: usize = 12;

    /// Creates an [`Iv`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Parses an IV from a slice.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::ProtocolError`] if the slice is not 12 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 12] = bytes.try_into().map_err(|_| TailProtoError::ProtocolError {
            reason: format!("IV must be {} bytes, got {}", Self::LEN, bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Returns the underlying 12-byte array.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Generates a fresh random IV from OS entropy.
pub fn generate_iv() -> Iv {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    Iv(bytes)
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` and returns `ciphertext || tag`.
///
/// `aad` is authenticated but not encrypted; pass `&[]` if unused.
///
/// # Errors
///
/// [`TailProtoError::CryptoError`] if the cipher rejects the input.
pub fn encrypt(key: &[u8; 32], iv: &Iv, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&iv.0), Payload { msg: plaintext, aad })
        .map_err(|e| TailProtoError::CryptoError {
            reason: format!("ChaCha20-Poly1305 encryption failed: {e}"),
        })
}

/// Decrypts `ciphertext || tag`.
///
/// # Errors
///
/// [`TailProtoError::DecryptFailed`] if the input is shorter than the
/// tag or the tag does not verify (wrong key, wrong IV, wrong AAD,
/// tampered ciphertext).
pub fn decrypt(key: &[u8; 32], iv: &Iv, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(TailProtoError::DecryptFailed {
            reason: format!(
                "ciphertext truncated: {} bytes, need at least {TAG_LEN}",
                ciphertext.len()
            ),
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&iv.0), Payload { msg: ciphertext, aad })
        .map_err(|_| TailProtoError::DecryptFailed {
            reason: "authentication tag mismatch".into(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
