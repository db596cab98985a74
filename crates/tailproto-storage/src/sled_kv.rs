//! sled-backed [`KvStore`] for single-host deployments.
//!
//! Each stored value carries an 8-byte big-endian expiry prefix:
//!
//! ```text
//! [expires_at_millis u64 BE] [value variable]
//! ```
//!
//! An expiry of 0 means the record never expires. Expired records are
//! removed lazily on read.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tailproto_types::{Result, TailProtoError};

use crate::kv::KvStore;

/// Length of the expiry prefix.
const EXPIRY_LEN: usize = 8;

/// Name of the sled tree holding session records.
const TREE_NAME: &str = "kv";

/// A [`KvStore`] persisted in a local sled database.
pub struct SledKvStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledKvStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::StorageError`] if the database or its tree
    /// cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| TailProtoError::StorageError {
            reason: format!("failed to open sled database: {e}"),
        })?;
        let tree = db.open_tree(TREE_NAME).map_err(|e| TailProtoError::StorageError {
            reason: format!("failed to open tree '{TREE_NAME}': {e}"),
        })?;
        Ok(Self { db, tree })
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| TailProtoError::StoreUnavailable {
            reason: format!("failed to flush database: {e}"),
        })?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn unavailable(op: &str, e: sled::Error) -> TailProtoError {
    TailProtoError::StoreUnavailable {
        reason: format!("sled {op} failed: {e}"),
    }
}

impl KvStore for SledKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = match self.tree.get(key.as_bytes()).map_err(|e| unavailable("get", e))? {
            None => return Ok(None),
            Some(raw) => raw,
        };

        if raw.len() < EXPIRY_LEN {
            return Err(TailProtoError::StorageError {
                reason: format!("stored value for '{key}' is missing its expiry prefix"),
            });
        }

        let mut prefix = [0u8; EXPIRY_LEN];
        prefix.copy_from_slice(&raw[..EXPIRY_LEN]);
        let expires_at = u64::from_be_bytes(prefix);
        if expires_at != 0 && expires_at <= now_millis() {
            self.tree
                .remove(key.as_bytes())
                .map_err(|e| unavailable("remove", e))?;
            return Ok(None);
        }

        Ok(Some(raw[EXPIRY_LEN..].to_vec()))
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let expires_at = if ttl_secs == 0 {
            0
        } else {
            now_millis().saturating_add(ttl_secs.saturating_mul(1000))
        };

        let mut stored = Vec::with_capacity(EXPIRY_LEN + value.len());
        stored.extend_from_slice(&expires_at.to_be_bytes());
        stored.extend_from_slice(value);

        self.tree
            .insert(key.as_bytes(), stored)
            .map_err(|e| unavailable("insert", e))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|e| unavailable("remove", e))?;
        Ok(())
    }
}
