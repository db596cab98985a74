//! Cryptographic primitives for the TailProto session layer.
//!
//! This crate is the **sole** location for all cryptographic operations.
//! No other crate in the workspace may perform raw crypto directly.
//! Everything here is a pure function over byte buffers.
//!
//! # Modules
//!
//! - [`ecdh`] — ephemeral P-256 key agreement
//! - [`hkdf`] — HKDF-SHA256 and AuthKey derivation
//! - [`aead`] — ChaCha20-Poly1305 with 96-bit IVs
//! - [`mac`] — HMAC-SHA256 signing and constant-time verification
//! - [`hash`] — SHA-256 and auth key fingerprints
//! - [`key`] — the [`key::AuthKey`] session key type
//! - [`sealed`] — Encrypt-then-MAC blobs for records and tokens
//! - [`secrets`] — server-side sub-keys derived from the cluster secret

pub mod aead;
pub mod ecdh;
pub mod hash;
pub mod hkdf;
pub mod key;
pub mod mac;
pub mod sealed;
pub mod secrets;
