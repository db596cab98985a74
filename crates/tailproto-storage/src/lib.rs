//! Session persistence for TailProto.
//!
//! Holds the [`session::Session`] entity and the [`store::SessionStore`]
//! that fronts a durable keyed store with an in-process cache. Records
//! are sealed (ChaCha20-Poly1305 + HMAC-SHA256) before they leave the
//! process. When the durable store is unreachable the session store
//! keeps serving from its cache and reports the degraded state.
//!
//! # Modules
//!
//! - [`session`] — `Session` entity and its rotation rules
//! - [`kv`] — the `KvStore` contract and an in-memory implementation
//! - [`sled_kv`] — on-disk `KvStore` backed by sled
//! - [`store`] — `SessionStore` with write-through and fallback

pub mod kv;
pub mod session;
pub mod sled_kv;
pub mod store;
