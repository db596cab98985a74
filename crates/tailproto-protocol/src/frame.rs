//! Top-level wire frames.
//!
//! A frame is one JSON object tagged by `type`. Only the handshake,
//! resume, rekey-required and error frames travel in plaintext; all
//! other traffic is an [`Envelope`].

use serde::{Deserialize, Serialize};
use tailproto_types::{Result, TailProtoError};

use crate::envelope::Envelope;

// ---------------------------------------------------------------------------
// Plaintext frames
// ---------------------------------------------------------------------------

/// Client's opening handshake message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInit {
    /// Uncompressed SEC1 P-256 point.
    #[serde(with = "crate::b64")]
    pub client_public_key: Vec<u8>,
}

/// Server's handshake reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(with = "crate::b64")]
    pub server_public_key: Vec<u8>,
    pub auth_key_id: String,
    pub key_version: u32,
    /// Server clock, milliseconds since the Unix epoch.
    pub server_time: i64,
    pub resume_token: String,
}

/// Reconnect without a key exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub resume_token: String,
}

/// Server's resume reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub auth_key_id: String,
    pub key_version: u32,
    pub server_time: i64,
}

/// Push asking the client to perform a fresh handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekeyNotice {
    pub reason: String,
    /// Hard cut-over, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

/// Structured protocol-level failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    /// Stable error code (see `TailProtoError::code`).
    pub code: String,
    pub message: String,
    /// Echo of the failed request's id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

impl ErrorFrame {
    /// Builds a failure frame for `err`.
    pub fn from_error(err: &TailProtoError, ack_id: Option<String>) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
            ack_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Any frame that can cross the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    HandshakeInit(HandshakeInit),
    HandshakeResponse(HandshakeResponse),
    Resume(ResumeRequest),
    ResumeResponse(ResumeResponse),
    RekeyRequired(RekeyNotice),
    Error(ErrorFrame),
    Envelope(Envelope),
}

/// Frame type tags a server accepts from clients.
const CLIENT_FRAME_TYPES: [&str; 3] = ["handshake_init", "resume", "envelope"];

impl Frame {
    /// `true` for frames allowed to travel unencrypted.
    pub fn is_plaintext(&self) -> bool {
        !matches!(self, Self::Envelope(_))
    }

    /// Serializes to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TailProtoError::ProtocolError {
            reason: format!("frame encode failed: {e}"),
        })
    }

    /// Parses any frame.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::ProtocolRequired`] for JSON that is not a
    /// known frame type; [`TailProtoError::ProtocolError`] for
    /// malformed input.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| TailProtoError::ProtocolError {
                reason: format!("frame is not valid JSON: {e}"),
            })?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_owned();
        serde_json::from_value(value).map_err(|e| {
            if KNOWN_TYPES.contains(&tag.as_str()) {
                TailProtoError::ProtocolError {
                    reason: format!("malformed '{tag}' frame: {e}"),
                }
            } else {
                TailProtoError::ProtocolRequired {
                    reason: format!("unencrypted frame of type '{tag}' is not allowed"),
                }
            }
        })
    }

    /// Parses a frame sent by a client.
    ///
    /// Server-originated frame types are refused with
    /// [`TailProtoError::ProtocolRequired`].
    pub fn from_client_bytes(raw: &[u8]) -> Result<Self> {
        let frame = Self::from_bytes(raw)?;
        let tag = frame.type_tag();
        if !CLIENT_FRAME_TYPES.contains(&tag) {
            return Err(TailProtoError::ProtocolRequired {
                reason: format!("clients may not send '{tag}' frames"),
            });
        }
        Ok(frame)
    }

    /// Wire `type` tag of this frame.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::HandshakeInit(_) => "handshake_init",
            Self::HandshakeResponse(_) => "handshake_response",
            Self::Resume(_) => "resume",
            Self::ResumeResponse(_) => "resume_response",
            Self::RekeyRequired(_) => "rekey_required",
            Self::Error(_) => "error",
            Self::Envelope(_) => "envelope",
        }
    }
}

const KNOWN_TYPES: [&str; 7] = [
    "handshake_init",
    "handshake_response",
    "resume",
    "resume_response",
    "rekey_required",
    "error",
    "envelope",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plaintext_is_protocol_required() {
        let raw = br#"{"type":"send_message","text":"hi"}"#;
        assert!(matches!(
            Frame::from_client_bytes(raw),
            Err(TailProtoError::ProtocolRequired { .. })
        ));
        let untagged = br#"{"text":"hi"}"#;
        assert!(matches!(
            Frame::from_client_bytes(untagged),
            Err(TailProtoError::ProtocolRequired { .. })
        ));
    }

    #[test]
    fn server_frames_refused_from_clients() -> std::result::Result<(), TailProtoError> {
        let frame = Frame::RekeyRequired(RekeyNotice {
            reason: "rotate".into(),
            deadline: None,
        });
        let raw = frame.to_bytes()?;
        assert!(matches!(
            Frame::from_client_bytes(&raw),
            Err(TailProtoError::ProtocolRequired { .. })
        ));
        assert_eq!(Frame::from_bytes(&raw)?, frame);
        Ok(())
    }

    #[test]
    fn malformed_known_frame_is_protocol_error() {
        let raw = br#"{"type":"handshake_init","clientPublicKey":"!!"}"#;
        assert!(matches!(
            Frame::from_client_bytes(raw),
            Err(TailProtoError::ProtocolError { .. })
        ));
    }

    #[test]
    fn error_frame_carries_code() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let err = TailProtoError::InvalidKeyVersion { reason: "v9".into() };
        let frame = Frame::Error(ErrorFrame::from_error(&err, Some("r7".into())));
        let json: serde_json::Value = serde_json::from_slice(&frame.to_bytes()?)?;
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "invalid_key_version");
        assert_eq!(json["ackId"], "r7");
        Ok(())
    }
}
