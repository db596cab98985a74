//! Cluster event bus contract and signed payloads.
//!
//! The bus is an at-least-once, partition-ordered publish/subscribe
//! log. Nothing here relies on ordering across topics or partitions.
//!
//! Every payload is a [`ClusterEvent`] encoded as canonical CBOR
//! (map keys sorted by their encoded bytes, shortest first) and
//! authenticated with HMAC-SHA256 under the cluster bus key. On the
//! wire `signed_payload` is itself a CBOR map:
//!
//! | Key    | CBOR type | Content                         |
//! |--------|-----------|---------------------------------|
//! | `body` | Bytes     | canonical CBOR of the event     |
//! | `mac`  | Bytes     | HMAC-SHA256(bus key, body)      |

use std::sync::atomic::{AtomicU64, Ordering};

use ciborium::Value;
use serde::{Deserialize, Serialize};
use tailproto_crypto::mac::{hmac_sha256, verify_hmac_sha256};
use tailproto_types::{Result, TailProtoError};
use tokio::sync::broadcast;
use zeroize::Zeroize;

/// Default in-memory bus buffer per subscriber.
pub const MEMORY_BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Topics and events
// ---------------------------------------------------------------------------

/// Bus topics.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    RekeyRequest,
    SessionUpdate,
    KeyRotated,
    Audit,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RekeyRequest => "tailproto.rekey-request",
            Self::SessionUpdate => "tailproto.session-update",
            Self::KeyRotated => "tailproto.key-rotated",
            Self::Audit => "tailproto.audit",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record on the bus.
#[derive(Clone, Debug)]
pub struct BusEvent {
    pub topic: Topic,
    pub partition_key: String,
    pub signed_payload: Vec<u8>,
}

/// Ask every node to send "rekey required" to a user's sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyRequest {
    /// Unique per request; consumers deduplicate on it.
    pub request_id: String,
    pub user_id: String,
    pub origin_node: String,
    pub reason: String,
    /// Milliseconds since the Unix epoch.
    pub deadline_ms: i64,
    pub issued_at_ms: i64,
}

/// Public view of a session after handshake, resume, or rotation.
///
/// Never carries key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: Option<String>,
    pub node_id: String,
    pub auth_key_id: String,
    pub key_version: u32,
    pub key_version_timestamp_ms: i64,
}

/// A session was closed on `node_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: String,
    pub node_id: String,
    pub at_ms: i64,
}

/// What an audit record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Handshake,
    Resume,
    RekeyIssued,
    DecryptFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub node_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub detail: Option<String>,
    pub at_ms: i64,
}

/// Decoded bus payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterEvent {
    RekeyRequest(RekeyRequest),
    SessionUpdate(SessionSnapshot),
    KeyRotated(SessionSnapshot),
    SessionClosed(SessionClosed),
    Audit(AuditRecord),
}

impl ClusterEvent {
    /// Topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::RekeyRequest(_) => Topic::RekeyRequest,
            Self::SessionUpdate(_) | Self::SessionClosed(_) => Topic::SessionUpdate,
            Self::KeyRotated(_) => Topic::KeyRotated,
            Self::Audit(_) => Topic::Audit,
        }
    }

    /// Partition key: the user for rekey requests, otherwise the
    /// session (falling back to the node for session-less audits).
    pub fn partition_key(&self) -> String {
        match self {
            Self::RekeyRequest(r) => r.user_id.clone(),
            Self::SessionUpdate(s) | Self::KeyRotated(s) => s.session_id.clone(),
            Self::SessionClosed(c) => c.session_id.clone(),
            Self::Audit(a) => a.session_id.clone().unwrap_or_else(|| a.node_id.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical CBOR
// ---------------------------------------------------------------------------

/// Encodes `event` as canonical CBOR.
pub fn to_canonical_cbor(event: &ClusterEvent) -> Result<Vec<u8>> {
    let value = Value::serialized(event).map_err(|e| TailProtoError::BusError {
        reason: format!("CBOR value conversion failed: {e}"),
    })?;
    encode_value(&canonicalize(value)?)
}

/// Decodes a canonical CBOR event, rejecting non-canonical input.
pub fn from_canonical_cbor(bytes: &[u8]) -> Result<ClusterEvent> {
    let value: Value = ciborium::from_reader(bytes).map_err(|e| TailProtoError::BusError {
        reason: format!("CBOR deserialization failed: {e}"),
    })?;
    if encode_value(&canonicalize(value.clone())?)? != bytes {
        return Err(TailProtoError::BusError {
            reason: "payload is not canonical CBOR".into(),
        });
    }
    value.deserialized().map_err(|e| TailProtoError::BusError {
        reason: format!("unrecognised cluster event: {e}"),
    })
}

/// Sorts every map by encoded key bytes (length first, then bytewise).
fn canonicalize(value: Value) -> Result<Value> {
    Ok(match value {
        Value::Map(entries) => {
            let mut keyed = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let k = canonicalize(k)?;
                let encoded = encode_value(&k)?;
                keyed.push((encoded, k, canonicalize(v)?));
            }
            keyed.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));
            if keyed.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(TailProtoError::BusError {
                    reason: "duplicate map key".into(),
                });
            }
            Value::Map(keyed.into_iter().map(|(_, k, v)| (k, v)).collect())
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(canonicalize)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Tag(tag, inner) => Value::Tag(tag, Box::new(canonicalize(*inner)?)),
        other => other,
    })
}

fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| TailProtoError::BusError {
        reason: format!("CBOR serialization failed: {e}"),
    })?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Signs and verifies bus payloads with the cluster bus key.
pub struct BusSigner {
    mac_key: [u8; 32],
}

// BusSigner does not implement Debug to prevent leakage.

impl BusSigner {
    pub fn new(mac_key: [u8; 32]) -> Self {
        Self { mac_key }
    }

    /// Wraps `event` into a signed [`BusEvent`].
    pub fn sign(&self, event: &ClusterEvent) -> Result<BusEvent> {
        let body = to_canonical_cbor(event)?;
        let mac = hmac_sha256(&self.mac_key, &body)?;
        let wrapper = Value::Map(vec![
            (Value::Text("mac".into()), Value::Bytes(mac.to_vec())),
            (Value::Text("body".into()), Value::Bytes(body)),
        ]);
        Ok(BusEvent {
            topic: event.topic(),
            partition_key: event.partition_key(),
            signed_payload: encode_value(&canonicalize(wrapper)?)?,
        })
    }

    /// Verifies and decodes a [`BusEvent`].
    ///
    /// # Errors
    ///
    /// [`TailProtoError::BusError`] for malformed wrappers, bad MACs,
    /// non-canonical bodies, or a body that does not belong on the
    /// event's topic.
    pub fn verify(&self, event: &BusEvent) -> Result<ClusterEvent> {
        let wrapper: Value = ciborium::from_reader(event.signed_payload.as_slice()).map_err(|e| {
            TailProtoError::BusError {
                reason: format!("malformed signed payload: {e}"),
            }
        })?;
        let entries = match wrapper {
            Value::Map(entries) => entries,
            _ => {
                return Err(TailProtoError::BusError {
                    reason: "signed payload is not a map".into(),
                })
            }
        };

        let mut body = None;
        let mut mac = None;
        for (k, v) in entries {
            match (k, v) {
                (Value::Text(k), Value::Bytes(b)) if k == "body" => body = Some(b),
                (Value::Text(k), Value::Bytes(b)) if k == "mac" => mac = Some(b),
                _ => {
                    return Err(TailProtoError::BusError {
                        reason: "unexpected field in signed payload".into(),
                    })
                }
            }
        }
        let (body, mac) = match (body, mac) {
            (Some(body), Some(mac)) => (body, mac),
            _ => {
                return Err(TailProtoError::BusError {
                    reason: "signed payload missing body or mac".into(),
                })
            }
        };

        verify_hmac_sha256(&self.mac_key, &body, &mac).map_err(|_| TailProtoError::BusError {
            reason: "payload signature mismatch".into(),
        })?;

        let decoded = from_canonical_cbor(&body)?;
        if decoded.topic() != event.topic {
            return Err(TailProtoError::BusError {
                reason: format!("{} payload published on {}", decoded.topic(), event.topic),
            });
        }
        Ok(decoded)
    }
}

impl Drop for BusSigner {
    fn drop(&mut self) {
        self.mac_key.zeroize();
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Publish/subscribe contract for the cluster bus.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: BusEvent) -> Result<()>;

    /// Opens a subscription to every topic. Events published before
    /// the call are not delivered.
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// In-process bus over a tokio broadcast channel. Share one instance
/// between nodes to model a cluster; every subscriber, including the
/// publisher's own, sees every event.
pub struct MemoryEventBus {
    tx: broadcast::Sender<BusEvent>,
    published: AtomicU64,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Total events published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for MemoryEventBus {
    fn publish(&self, event: BusEvent) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
