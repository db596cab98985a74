//! Plaintext carried inside an envelope.
//!
//! Requests are a tagged union of the shapes the protocol core knows
//! about (`ping`, `batch`) plus an opaque application event whose body
//! is handed to the application untouched. Application bodies are
//! validated by the application, never here.

use serde::{Deserialize, Serialize};
use tailproto_types::{Result, TailProtoError};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One application event: a name and an opaque body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEvent {
    pub event: String,
    #[serde(with = "crate::b64")]
    pub body: Vec<u8>,
}

/// Decrypted request payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InnerRequest {
    /// Liveness check answered by the protocol core.
    Ping,
    /// Several events executed in array order inside one envelope.
    Batch { items: Vec<AppEvent> },
    /// A single application event.
    App(AppEvent),
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Outcome of one request or batch item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::b64::option")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn success(data: Vec<u8>) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &TailProtoError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
        }
    }

    fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(&e),
        }
    }
}

/// Decrypted response or server push payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InnerResponse {
    /// Reply to a ping.
    Pong,
    /// Reply to a single application event.
    Result(ItemResult),
    /// Same-length, same-order results of a batch.
    Batch { results: Vec<ItemResult> },
    /// Server-initiated push.
    Push(AppEvent),
}

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// Caller identity handed to application handlers.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub session_id: tailproto_types::SessionId,
    pub user_id: Option<tailproto_types::UserId>,
}

/// Application-side handler for decrypted events.
///
/// Errors become `{ok: false}` results inside the encrypted response;
/// they never tear down the session.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, ctx: &HandlerContext, event: &AppEvent) -> Result<Vec<u8>>;
}

/// Executes a decoded request against `handler`.
///
/// # Errors
///
/// [`TailProtoError::ProtocolError`] if a batch exceeds `max_batch_items`.
pub fn execute(
    request: &InnerRequest,
    handler: &dyn RequestHandler,
    ctx: &HandlerContext,
    max_batch_items: usize,
) -> Result<InnerResponse> {
    match request {
        InnerRequest::Ping => Ok(InnerResponse::Pong),
        InnerRequest::App(event) => Ok(InnerResponse::Result(ItemResult::from_result(
            handler.handle(ctx, event),
        ))),
        InnerRequest::Batch { items } => {
            if items.len() > max_batch_items {
                return Err(TailProtoError::ProtocolError {
                    reason: format!(
                        "batch of {} items exceeds limit of {max_batch_items}",
                        items.len()
                    ),
                });
            }
            let results = items
                .iter()
                .map(|item| ItemResult::from_result(handler.handle(ctx, item)))
                .collect();
            Ok(InnerResponse::Batch { results })
        }
    }
}

/// Parses decrypted request bytes.
pub fn decode_request(plaintext: &[u8]) -> Result<InnerRequest> {
    serde_json::from_slice(plaintext).map_err(|e| TailProtoError::ProtocolError {
        reason: format!("undecodable inner request: {e}"),
    })
}

/// Parses decrypted response bytes.
pub fn decode_response(plaintext: &[u8]) -> Result<InnerResponse> {
    serde_json::from_slice(plaintext).map_err(|e| TailProtoError::ProtocolError {
        reason: format!("undecodable inner response: {e}"),
    })
}

/// Serializes any inner payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| TailProtoError::ProtocolError {
        reason: format!("inner payload encode failed: {e}"),
    })
}
