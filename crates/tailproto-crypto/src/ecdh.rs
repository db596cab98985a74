//! Ephemeral P-256 Elliptic-Curve Diffie-Hellman key agreement.
//!
//! Each full handshake generates one fresh keypair per side. Public
//! keys travel as SEC1 uncompressed points (65 bytes, `0x04 || X || Y`);
//! compressed points are accepted on input.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use tailproto_types::{Result, TailProtoError};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Length of an uncompressed SEC1 P-256 public key.
pub const PUBLIC_KEY_LEN: usize = 65;

// ---------------------------------------------------------------------------
// EcdhPublicKey
// ---------------------------------------------------------------------------

/// Validated P-256 public key received from, or sent to, a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EcdhPublicKey(PublicKey);

impl EcdhPublicKey {
    /// Parses a SEC1-encoded point.
    ///
    /// # Errors
    ///
    /// Returns [`TailProtoError::HandshakeFailed`] if the bytes are not
    /// a valid point on the curve (including the identity point).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| TailProtoError::HandshakeFailed {
                reason: format!("invalid P-256 public key ({} bytes)", bytes.len()),
            })
    }

    /// Returns the uncompressed SEC1 encoding (65 bytes).
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(false).as_bytes().to_vec()
    }
}

// ---------------------------------------------------------------------------
// EphemeralKeypair
// ---------------------------------------------------------------------------

/// Single-use P-256 secret with its public half.
///
/// Consumed by [`EphemeralKeypair::agree`]; the underlying secret scalar
/// is zeroized by `p256` when dropped.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: EcdhPublicKey,
}

// EphemeralKeypair does not implement Clone/Debug to prevent leakage.

impl EphemeralKeypair {
    /// Generates a fresh keypair from OS entropy.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = EcdhPublicKey(secret.public_key());
        Self { secret, public }
    }

    /// Returns the public key to send to the peer.
    pub fn public_key(&self) -> &EcdhPublicKey {
        &self.public
    }

    /// Performs ECDH with the peer's public key, consuming the secret.
    ///
    /// Both parties obtain the identical shared secret (the affine
    /// x-coordinate of the shared point).
    pub fn agree(self, their_public: &EcdhPublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.0);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());
        SharedSecret(bytes)
    }
}

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Raw ECDH output (32 bytes). Never used directly as a key; feed it
/// to [`crate::hkdf::derive_auth_key`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Returns the raw shared secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// SharedSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
