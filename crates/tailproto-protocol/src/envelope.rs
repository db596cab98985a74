//! The encrypted wire unit.
//!
//! Every header field is bound to the ciphertext as AEAD associated
//! data, so a relay cannot move a ciphertext to another sequence
//! number, key version, or request id without failing decryption.

use serde::{Deserialize, Serialize};
use tailproto_crypto::aead::{self, Iv};
use tailproto_crypto::key::AuthKey;
use tailproto_types::{Result, TailProtoError};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 2;

/// One encrypted protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Wire protocol version; always [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Hex fingerprint of the key that sealed this envelope.
    pub auth_key_id: String,
    /// Sender's sequence number, starting at 1.
    pub seq: u64,
    /// Key version the sender used.
    pub key_version: u32,
    /// 12 random bytes.
    #[serde(with = "crate::b64")]
    pub iv: Vec<u8>,
    /// AEAD output (`ciphertext || tag`).
    #[serde(with = "crate::b64")]
    pub ciphertext: Vec<u8>,
    /// Request correlation id (requests only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Echo of the peer's `request_id` (responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

/// Header fields of an envelope about to be sealed.
#[derive(Clone, Debug)]
pub struct EnvelopeHeader {
    pub seq: u64,
    pub key_version: u32,
    pub request_id: Option<String>,
    pub ack_id: Option<String>,
}

impl Envelope {
    /// Encrypts `plaintext` under `key` with a fresh IV.
    pub fn seal(key: &AuthKey, header: EnvelopeHeader, plaintext: &[u8]) -> Result<Self> {
        let iv = aead::generate_iv();
        let mut envelope = Self {
            version: PROTOCOL_VERSION,
            auth_key_id: key.id().to_string(),
            seq: header.seq,
            key_version: header.key_version,
            iv: iv.as_bytes().to_vec(),
            ciphertext: Vec::new(),
            request_id: header.request_id,
            ack_id: header.ack_id,
        };
        envelope.ciphertext = aead::encrypt(key.as_bytes(), &iv, plaintext, &envelope.aad())?;
        Ok(envelope)
    }

    /// Decrypts with `key`.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::DecryptFailed`] if the envelope was not sealed
    /// by `key`, or any header field was altered.
    pub fn open(&self, key: &AuthKey) -> Result<Vec<u8>> {
        if self.auth_key_id != key.id().to_string() {
            return Err(TailProtoError::DecryptFailed {
                reason: format!("envelope sealed under unknown key {}", self.auth_key_id),
            });
        }
        let iv = Iv::from_slice(&self.iv)?;
        aead::decrypt(key.as_bytes(), &iv, &self.ciphertext, &self.aad())
    }

    /// Rejects envelopes that are malformed before any key lookup.
    pub fn check_shape(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(TailProtoError::ProtocolError {
                reason: format!(
                    "unsupported envelope version {} (expected {PROTOCOL_VERSION})",
                    self.version
                ),
            });
        }
        if self.iv.len() != Iv::LEN {
            return Err(TailProtoError::ProtocolError {
                reason: format!("IV must be {} bytes, got {}", Iv::LEN, self.iv.len()),
            });
        }
        Ok(())
    }

    /// Associated data binding every header field.
    ///
    /// Layout: `b"tailproto-env"`, version (u8), then `auth_key_id`,
    /// `seq` (u64 BE), `key_version` (u32 BE), `request_id`, `ack_id`.
    /// Strings are u32 BE length-prefixed; optional ones carry a
    /// presence byte first, so no field can bleed into its neighbour.
    fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(64);
        aad.extend_from_slice(b"tailproto-env");
        aad.push(self.version);
        put_str(&mut aad, &self.auth_key_id);
        aad.extend_from_slice(&self.seq.to_be_bytes());
        aad.extend_from_slice(&self.key_version.to_be_bytes());
        put_opt_str(&mut aad, self.request_id.as_deref());
        put_opt_str(&mut aad, self.ack_id.as_deref());
        aad
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    // Header strings come from frames far below 4 GiB.
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn put_opt_str(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(v) => {
            out.push(1);
            put_str(out, v);
        }
        None => out.push(0),
    }
}
