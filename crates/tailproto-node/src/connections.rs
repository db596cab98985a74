//! Live connections held by this node.
//!
//! Each connected session owns an unbounded outbound channel; the
//! transport task on the other end writes whatever arrives to the
//! socket. Anything the node sends to a client (replies, pushes, rekey
//! notices) goes through [`ConnectionRegistry::send`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tailproto_types::{Result, SessionId, TailProtoError};
use tokio::sync::mpsc;

/// Map of `sessionId → outbound channel`.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the receiving half of its
    /// outbound channel. Re-registering replaces the previous channel.
    pub fn register(&self, session_id: SessionId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()?.insert(session_id, tx);
        Ok(rx)
    }

    /// Removes a connection. Returns `true` if it was registered.
    pub fn unregister(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.lock()?.remove(session_id).is_some())
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.lock()
            .map(|map| map.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Queues `frame` for the connection.
    ///
    /// Returns `false` if the session is not connected here. A closed
    /// receiver counts as a disconnect and the entry is dropped.
    pub fn send(&self, session_id: &SessionId, frame: Vec<u8>) -> Result<bool> {
        let mut map = self.lock()?;
        let Some(tx) = map.get(session_id) else {
            return Ok(false);
        };
        if tx.send(frame).is_err() {
            map.remove(session_id);
            tracing::debug!(session_id = %session_id, "outbound channel closed; connection dropped");
            return Ok(false);
        }
        Ok(true)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SessionId, mpsc::UnboundedSender<Vec<u8>>>>> {
        self.inner.lock().map_err(|_| TailProtoError::LockError {
            reason: "connection registry lock poisoned".into(),
        })
    }
}
