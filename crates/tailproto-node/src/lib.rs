//! TailProto node runtime.
//!
//! Ties the session layer to a running server process: live
//! connections, the rekey scheduler, and cluster synchronization over a
//! signed event bus. Transport framing stays outside; a transport hands
//! raw frames to [`node::Node::handle_frame`] and writes whatever the
//! connection's channel yields.
//!
//! # Modules
//!
//! - [`config`] — JSON node configuration
//! - [`node`] — `Node` lifecycle and public API
//! - [`connections`] — session id to outbound channel registry
//! - [`scheduler`] — per-user rekey trigger and old-key expiry
//! - [`cluster_sync`] — signed bus publishing, dedupe, remote index
//! - [`bus`] — event bus contract, payloads, canonical CBOR signing
//! - [`lock`] — non-blocking advisory lock contract
//! - [`fanout`] — local delivery of rekey notices
//! - [`rate_limiter`] — per-session re-handshake notice budget

pub mod bus;
pub mod cluster_sync;
pub mod config;
pub mod connections;
mod event_loop;
pub mod fanout;
pub mod lock;
pub mod node;
pub mod rate_limiter;
pub mod scheduler;
