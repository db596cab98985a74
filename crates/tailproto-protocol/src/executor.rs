//! Where AEAD work runs, and in what order sealed frames leave.
//!
//! [`CryptoExecutor`] runs small payloads inline and hands large ones
//! to tokio's blocking pool. Because a pooled job can finish after a
//! later inline one, [`OrderedOutbound`] releases a session's sealed
//! frames strictly in outbound sequence order.

use std::collections::{BTreeMap, HashMap};

use tailproto_types::{Result, SessionId, TailProtoError};

// ---------------------------------------------------------------------------
// CryptoExecutor
// ---------------------------------------------------------------------------

/// Placement policy for CPU-bound crypto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoExecutor {
    /// Always on the calling task.
    Inline,
    /// Payloads of at least `threshold` bytes go to `spawn_blocking`.
    Pool { threshold: usize },
}

impl CryptoExecutor {
    /// Builds the policy from `offload_threshold_bytes` (0 = inline).
    pub fn from_threshold(threshold: usize) -> Self {
        if threshold == 0 {
            Self::Inline
        } else {
            Self::Pool { threshold }
        }
    }

    /// `true` if a payload of `size` bytes would be offloaded.
    pub fn offloads(&self, size: usize) -> bool {
        match self {
            Self::Inline => false,
            Self::Pool { threshold } => size >= *threshold,
        }
    }

    /// Runs `job`, offloading it when `size` reaches the threshold.
    ///
    /// # Errors
    ///
    /// Whatever `job` returns, or [`TailProtoError::CryptoError`] if
    /// the blocking task panicked or was cancelled.
    pub async fn run<T, F>(&self, size: usize, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.offloads(size) {
            return job();
        }
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| TailProtoError::CryptoError {
                reason: format!("crypto worker failed: {e}"),
            })?
    }
}

// ---------------------------------------------------------------------------
// OrderedOutbound
// ---------------------------------------------------------------------------

/// Per-session completion queue keyed by outbound sequence number.
///
/// Sequence numbers are expected to start at 1 and be allocated
/// without gaps. A seal that failed must still be reported (with
/// `None`) so later frames are not held back forever.
#[derive(Default)]
pub struct OrderedOutbound {
    next: HashMap<SessionId, u64>,
    pending: HashMap<SessionId, BTreeMap<u64, Option<Vec<u8>>>>,
}

impl OrderedOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished seal and returns every frame now releasable,
    /// in order.
    pub fn complete(&mut self, session: &SessionId, seq: u64, frame: Option<Vec<u8>>) -> Vec<Vec<u8>> {
        let next = self.next.entry(session.clone()).or_insert(1);
        if seq < *next {
            // Already released or skipped; never re-emit.
            return Vec::new();
        }
        let queue = self.pending.entry(session.clone()).or_default();
        queue.insert(seq, frame);

        let mut ready = Vec::new();
        while let Some(slot) = queue.remove(&*next) {
            if let Some(frame) = slot {
                ready.push(frame);
            }
            *next += 1;
        }
        if queue.is_empty() {
            self.pending.remove(session);
        }
        ready
    }

    /// Restarts numbering for a session whose outbound counter reset
    /// (resume installs a fresh session).
    pub fn reset(&mut self, session: &SessionId) {
        self.next.remove(session);
        self.pending.remove(session);
    }

    /// Frames held back for a session.
    pub fn pending_len(&self, session: &SessionId) -> usize {
        self.pending.get(session).map(BTreeMap::len).unwrap_or(0)
    }
}
