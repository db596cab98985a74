//! Wire protocol for the TailProto secure session layer.
//!
//! Defines the JSON frame format, the encrypted [`envelope::Envelope`],
//! the inner request/response union, the server-side handshake and
//! resume tokens, and the [`codec::EnvelopeCodec`] pipeline that every
//! inbound frame passes through.
//!
//! # Modules
//!
//! - [`frame`] — top-level frames and the plaintext whitelist
//! - [`envelope`] — AEAD envelope with header-bound associated data
//! - [`inner`] — decrypted request/response shapes and the handler seam
//! - [`handshake`] — server half of the P-256 key exchange
//! - [`resumption`] — sealed resume tokens
//! - [`response_cache`] — TTL cache for idempotent retries
//! - [`executor`] — inline vs pooled crypto and ordered outbound release
//! - [`codec`] — the per-frame validation and dispatch pipeline
//! - [`client`] — client-side session state

pub mod b64;
pub mod client;
pub mod codec;
pub mod envelope;
pub mod executor;
pub mod frame;
pub mod handshake;
pub mod inner;
pub mod response_cache;
pub mod resumption;
