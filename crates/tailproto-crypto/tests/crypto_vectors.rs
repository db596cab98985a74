//! Cross-module tests for the handshake primitives.
//!
//! - Derivation symmetry: both ends of an ECDH exchange compute the
//!   same AuthKey and fingerprint.
//! - AEAD round-trip over a spread of sizes, plus wrong-key and
//!   tamper rejection.
//! - Sealed blobs under server secrets.

use rand::rngs::OsRng;
use rand::RngCore;

use tailproto_crypto::aead::{decrypt, encrypt, generate_iv, Iv};
use tailproto_crypto::ecdh::{EcdhPublicKey, EphemeralKeypair};
use tailproto_crypto::hash::auth_key_id;
use tailproto_crypto::hkdf::derive_auth_key;
use tailproto_crypto::sealed::{open, seal};
use tailproto_crypto::secrets::ServerSecrets;
use tailproto_types::TailProtoError;

// ===================================================================
// Derivation symmetry
// ===================================================================

#[test]
fn both_sides_derive_identical_auth_key_id() -> std::result::Result<(), TailProtoError> {
    for _ in 0..16 {
        let client = EphemeralKeypair::generate();
        let server = EphemeralKeypair::generate();

        // Public keys cross the wire as SEC1 bytes.
        let client_pub = EcdhPublicKey::from_sec1_bytes(&client.public_key().to_sec1_bytes())?;
        let server_pub = EcdhPublicKey::from_sec1_bytes(&server.public_key().to_sec1_bytes())?;

        let client_key = derive_auth_key(&client.agree(&server_pub))?;
        let server_key = derive_auth_key(&server.agree(&client_pub))?;

        assert_eq!(client_key.as_bytes(), server_key.as_bytes());
        assert_eq!(client_key.id(), server_key.id());
        assert_eq!(client_key.id(), auth_key_id(server_key.as_bytes()));
    }
    Ok(())
}

#[test]
fn auth_key_is_not_the_raw_shared_secret() -> std::result::Result<(), TailProtoError> {
    let a = EphemeralKeypair::generate();
    let b = EphemeralKeypair::generate();
    let b_pub = b.public_key().clone();
    let shared = a.agree(&b_pub);
    let key = derive_auth_key(&shared)?;
    assert_ne!(key.as_bytes(), shared.as_bytes());
    Ok(())
}

// ===================================================================
// AEAD
// ===================================================================

#[test]
fn aead_roundtrip_various_sizes() -> std::result::Result<(), TailProtoError> {
    for len in [0usize, 1, 15, 16, 17, 255, 4096, 70_000] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let mut pt = vec![0u8; len];
        OsRng.fill_bytes(&mut pt);
        let iv = generate_iv();

        let ct = encrypt(&key, &iv, &pt, b"aad")?;
        assert_eq!(decrypt(&key, &iv, &ct, b"aad")?, pt);

        let mut other = key;
        other[0] ^= 0x80;
        assert!(decrypt(&other, &iv, &ct, b"aad").is_err());

        let mut tampered = ct.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(decrypt(&key, &iv, &tampered, b"aad").is_err());
    }
    Ok(())
}

#[test]
fn aead_is_deterministic_for_fixed_iv() -> std::result::Result<(), TailProtoError> {
    let iv = Iv::from_bytes([0xBB; 12]);
    let a = encrypt(&[0xAA; 32], &iv, b"determinism", b"")?;
    let b = encrypt(&[0xAA; 32], &iv, b"determinism", b"")?;
    assert_eq!(a, b);
    Ok(())
}

// ===================================================================
// Sealed blobs under server secrets
// ===================================================================

#[test]
fn sibling_nodes_open_each_others_blobs() -> std::result::Result<(), TailProtoError> {
    let node_a = ServerSecrets::derive(&[0x5A; 32])?;
    let node_b = ServerSecrets::derive(&[0x5A; 32])?;
    let blob = seal(node_a.token_keys(), b"resume me")?;
    assert_eq!(open(node_b.token_keys(), &blob)?, b"resume me");
    // Token keys never open store blobs.
    assert!(open(node_b.store_keys(), &blob).is_err());
    Ok(())
}
