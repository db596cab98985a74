//! Node configuration file.
//!
//! A node is configured from a single JSON file:
//!
//! ```json
//! {
//!   "node_id": "edge-1",
//!   "master_secret_hex": "<64 hex chars shared by the cluster>",
//!   "tick_secs": 30,
//!   "protocol": { "rekey_interval_secs": 3600 }
//! }
//! ```
//!
//! Missing optional fields fall back to defaults; `protocol` accepts
//! any subset of [`ProtoConfig`] fields.

use std::path::Path;

use serde::Deserialize;
use tailproto_types::config::ProtoConfig;
use tailproto_types::{NodeId, Result, TailProtoError};

/// Default scheduler tick interval in seconds.
pub const DEFAULT_TICK_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// On-disk format
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct NodeConfigFile {
    node_id: String,
    master_secret_hex: String,
    tick_secs: Option<u64>,
    protocol: Option<ProtoConfig>,
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Fully resolved node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Hex-encoded 32-byte cluster master secret.
    pub master_secret_hex: String,
    /// Scheduler tick interval in seconds.
    pub tick_secs: u64,
    pub protocol: ProtoConfig,
}

// NodeConfig does not implement Debug to prevent leakage.

impl NodeConfig {
    /// Builds a config with default tick and protocol settings.
    pub fn new(node_id: impl Into<String>, master_secret_hex: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            master_secret_hex: master_secret_hex.into(),
            tick_secs: DEFAULT_TICK_SECS,
            protocol: ProtoConfig::default(),
        }
    }

    /// Loads and validates a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| TailProtoError::ConfigError {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    /// Parses and validates a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: NodeConfigFile =
            serde_json::from_str(text).map_err(|e| TailProtoError::ConfigError {
                reason: format!("invalid config JSON: {e}"),
            })?;

        let config = Self {
            node_id: NodeId::new(file.node_id),
            master_secret_hex: file.master_secret_hex,
            tick_secs: file.tick_secs.unwrap_or(DEFAULT_TICK_SECS),
            protocol: file.protocol.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks node-level values and the embedded protocol config.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.as_str().is_empty() {
            return Err(TailProtoError::ConfigError {
                reason: "node_id must not be empty".into(),
            });
        }
        if self.tick_secs == 0 {
            return Err(TailProtoError::ConfigError {
                reason: "tick_secs must be greater than 0".into(),
            });
        }
        let secret_len = self.master_secret_hex.len();
        if secret_len != 64 || !self.master_secret_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TailProtoError::ConfigError {
                reason: format!(
                    "master_secret_hex must be 64 hex characters, got {secret_len} characters"
                ),
            });
        }
        self.protocol.validate()
    }
}
