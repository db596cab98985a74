//! Encrypt-then-MAC blobs.
//!
//! Used for persisted session records and resume tokens. Layout:
//!
//! ```text
//! [header variable] [iv 12B] [ciphertext || tag variable] [hmac 32B]
//! ```
//!
//! The header is optional cleartext (resume tokens carry their expiry
//! there). It is bound both as AEAD associated data and under the
//! HMAC. On open, the HMAC over `header || iv || ciphertext` is
//! verified **before** any decryption attempt.

use tailproto_types::{Result, TailProtoError};

use crate::aead::{decrypt, encrypt, generate_iv, Iv, TAG_LEN};
use crate::mac::{hmac_sha256, verify_hmac_sha256, HMAC_SHA256_LEN};
use crate::secrets::SealingKeys;

/// Minimum sealed body size: IV + AEAD tag + HMAC.
const MIN_SEALED_LEN: usize = Iv::LEN + TAG_LEN + HMAC_SHA256_LEN;

/// Encrypts `plaintext` under `keys.enc_key` and appends an HMAC
/// under `keys.mac_key`. A fresh IV is generated per call.
pub fn seal(keys: &SealingKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
    seal_with_header(keys, &[], plaintext)
}

/// Verifies and decrypts a blob produced by [`seal`].
///
/// # Errors
///
/// - [`TailProtoError::CryptoError`] if the blob is too short or the
///   HMAC does not verify.
/// - [`TailProtoError::DecryptFailed`] if the MAC verified but the AEAD
///   tag did not (only possible with mismatched sub-keys).
pub fn open(keys: &SealingKeys, raw: &[u8]) -> Result<Vec<u8>> {
    verify(keys, raw, 0)?.decrypt()
}

/// Like [`seal`] but prefixes an authenticated cleartext `header`.
pub fn seal_with_header(keys: &SealingKeys, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let iv = generate_iv();
    let ciphertext = encrypt(keys.enc_key(), &iv, plaintext, header)?;

    let mut output =
        Vec::with_capacity(header.len() + Iv::LEN + ciphertext.len() + HMAC_SHA256_LEN);
    output.extend_from_slice(header);
    output.extend_from_slice(iv.as_bytes());
    output.extend_from_slice(&ciphertext);

    let tag = hmac_sha256(keys.mac_key(), &output)?;
    output.extend_from_slice(&tag);
    Ok(output)
}

/// A blob whose HMAC has been checked but which is not yet decrypted.
///
/// Lets callers inspect the cleartext header (e.g. an expiry) between
/// authentication and decryption.
pub struct VerifiedBlob<'a> {
    keys: &'a SealingKeys,
    header: &'a [u8],
    iv: Iv,
    ciphertext: &'a [u8],
}

impl<'a> VerifiedBlob<'a> {
    /// The authenticated cleartext header.
    pub fn header(&self) -> &'a [u8] {
        self.header
    }

    /// Decrypts the body.
    pub fn decrypt(self) -> Result<Vec<u8>> {
        decrypt(self.keys.enc_key(), &self.iv, self.ciphertext, self.header)
    }
}

/// Checks the HMAC of a blob with a `header_len`-byte header.
///
/// # Errors
///
/// [`TailProtoError::CryptoError`] if the blob is too short or the
/// HMAC does not verify.
pub fn verify<'a>(keys: &'a SealingKeys, raw: &'a [u8], header_len: usize) -> Result<VerifiedBlob<'a>> {
    let min_len = header_len.saturating_add(MIN_SEALED_LEN);
    if raw.len() < min_len {
        return Err(TailProtoError::CryptoError {
            reason: format!(
                "sealed blob too short: expected at least {min_len} bytes, got {}",
                raw.len()
            ),
        });
    }

    let mac_start = raw.len() - HMAC_SHA256_LEN;
    let (authenticated, tag) = raw.split_at(mac_start);
    verify_hmac_sha256(keys.mac_key(), authenticated, tag)?;

    let (header, body) = authenticated.split_at(header_len);
    let (iv_bytes, ciphertext) = body.split_at(Iv::LEN);
    Ok(VerifiedBlob {
        keys,
        header,
        iv: Iv::from_slice(iv_bytes)?,
        ciphertext,
    })
}
