//! The durable keyed-store contract.
//!
//! The session layer only needs get / set-with-TTL / delete of small
//! opaque byte records with single-key atomicity. Production clusters
//! plug in a shared network store; [`MemoryKvStore`] serves tests and
//! single-process deployments and can simulate an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tailproto_types::{Result, TailProtoError};

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Keyed store of opaque byte records.
///
/// Implementations must be safe to share between threads. Outages are
/// reported as [`TailProtoError::StoreUnavailable`]; callers decide
/// whether to degrade.
pub trait KvStore: Send + Sync {
    /// Fetches a record. Expired records read as `None`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a record that expires after `ttl_secs` (0 = never).
    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()>;

    /// Removes a record. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryKvStore
// ---------------------------------------------------------------------------

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Thread-safe in-memory [`KvStore`] with TTL support.
///
/// [`set_available`](Self::set_available) toggles a simulated outage:
/// while unavailable every call fails with `StoreUnavailable` and the
/// stored data is left untouched.
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryKvStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the store going down (`false`) or recovering (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|map| {
                map.values()
                    .filter(|e| e.expires_at.map(|t| t > now).unwrap_or(true))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Returns `true` if no live records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TailProtoError::StoreUnavailable {
                reason: "memory store marked unavailable".into(),
            })
        }
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| TailProtoError::StoreUnavailable {
            reason: "memory store lock poisoned".into(),
        })
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let mut map = self.lock_entries()?;

        let expired = match map.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.map(|t| t <= Instant::now()).unwrap_or(false),
        };
        if expired {
            map.remove(key);
            return Ok(None);
        }
        Ok(map.get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        let expires_at = if ttl_secs == 0 {
            None
        } else {
            Instant::now().checked_add(Duration::from_secs(ttl_secs))
        };
        self.lock_entries()?.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.lock_entries()?.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() -> std::result::Result<(), TailProtoError> {
        let kv = MemoryKvStore::new();
        kv.set("a", b"one", 0)?;
        assert_eq!(kv.get("a")?, Some(b"one".to_vec()));
        kv.delete("a")?;
        assert_eq!(kv.get("a")?, None);
        kv.delete("a")?;
        Ok(())
    }

    #[test]
    fn overwrite_replaces_value() -> std::result::Result<(), TailProtoError> {
        let kv = MemoryKvStore::new();
        kv.set("a", b"one", 60)?;
        kv.set("a", b"two", 60)?;
        assert_eq!(kv.get("a")?, Some(b"two".to_vec()));
        assert_eq!(kv.len(), 1);
        Ok(())
    }

    #[test]
    fn unavailable_store_fails_every_call() -> std::result::Result<(), TailProtoError> {
        let kv = MemoryKvStore::new();
        kv.set("a", b"one", 0)?;
        kv.set_available(false);
        assert!(matches!(kv.get("a"), Err(TailProtoError::StoreUnavailable { .. })));
        assert!(kv.set("b", b"x", 0).is_err());
        assert!(kv.delete("a").is_err());

        kv.set_available(true);
        assert_eq!(kv.get("a")?, Some(b"one".to_vec()));
        assert_eq!(kv.get("b")?, None);
        Ok(())
    }
}
