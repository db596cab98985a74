//! Client side of the protocol.
//!
//! [`ClientSession`] performs the handshake, seals requests with its
//! own outbound sequence, opens responses and pushes, follows key
//! rotations, and resumes from a token.

use tailproto_crypto::ecdh::{EcdhPublicKey, EphemeralKeypair};
use tailproto_crypto::hkdf::derive_auth_key;
use tailproto_crypto::key::AuthKey;
use tailproto_types::{Result, TailProtoError};

use crate::envelope::{Envelope, EnvelopeHeader};
use crate::frame::{ErrorFrame, Frame, HandshakeInit, RekeyNotice, ResumeRequest};
use crate::inner::{self, InnerRequest, InnerResponse};

/// A decoded server frame.
#[derive(Debug)]
pub enum ClientEvent {
    HandshakeComplete { key_version: u32 },
    Resumed { key_version: u32 },
    Response {
        seq: u64,
        ack_id: Option<String>,
        body: InnerResponse,
    },
    RekeyRequired(RekeyNotice),
    Error(ErrorFrame),
}

struct VersionedKey {
    key: AuthKey,
    version: u32,
}

/// Client protocol state for one connection.
pub struct ClientSession {
    pending: Option<EphemeralKeypair>,
    current: Option<VersionedKey>,
    previous: Option<VersionedKey>,
    out_seq: u64,
    resume_token: Option<String>,
}

// ClientSession does not implement Debug to prevent leakage.

impl ClientSession {
    pub fn new() -> Self {
        Self {
            pending: None,
            current: None,
            previous: None,
            out_seq: 0,
            resume_token: None,
        }
    }

    /// Current key version, once a handshake or resume completed.
    pub fn key_version(&self) -> Option<u32> {
        self.current.as_ref().map(|k| k.version)
    }

    /// Hex fingerprint of the current key.
    pub fn auth_key_id(&self) -> Option<String> {
        self.current.as_ref().map(|k| k.key.id().to_string())
    }

    /// Token from the most recent handshake.
    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    /// Starts a handshake (initial, or a rotation of an established
    /// session). Requests keep using the current key until the response
    /// arrives.
    pub fn handshake_init(&mut self) -> Result<Vec<u8>> {
        let keypair = EphemeralKeypair::generate();
        let frame = Frame::HandshakeInit(HandshakeInit {
            client_public_key: keypair.public_key().to_sec1_bytes(),
        });
        self.pending = Some(keypair);
        frame.to_bytes()
    }

    /// Builds a resume request from the stored token.
    pub fn resume_request(&self) -> Result<Vec<u8>> {
        let token = self.resume_token.clone().ok_or_else(|| TailProtoError::SessionNotReady {
            reason: "no resume token".into(),
        })?;
        Frame::Resume(ResumeRequest { resume_token: token }).to_bytes()
    }

    /// Seals a request with the next outbound sequence number.
    pub fn seal_request(&mut self, request: &InnerRequest, request_id: Option<&str>) -> Result<Vec<u8>> {
        let seq = self.out_seq.saturating_add(1);
        let frame = self.seal_at(seq, request, request_id)?;
        self.out_seq = seq;
        Ok(frame)
    }

    /// Seals a request at an explicit sequence number without touching
    /// the counter (retransmissions).
    pub fn seal_at(&self, seq: u64, request: &InnerRequest, request_id: Option<&str>) -> Result<Vec<u8>> {
        let current = self.current.as_ref().ok_or_else(|| TailProtoError::SessionNotReady {
            reason: "handshake not completed".into(),
        })?;
        let header = EnvelopeHeader {
            seq,
            key_version: current.version,
            request_id: request_id.map(str::to_owned),
            ack_id: None,
        };
        let envelope = Envelope::seal(&current.key, header, &inner::encode(request)?)?;
        Frame::Envelope(envelope).to_bytes()
    }

    /// Decodes one server frame, updating key state as needed.
    pub fn receive(&mut self, raw: &[u8]) -> Result<ClientEvent> {
        match Frame::from_bytes(raw)? {
            Frame::HandshakeResponse(resp) => {
                let keypair = self.pending.take().ok_or_else(|| TailProtoError::HandshakeFailed {
                    reason: "unexpected handshake response".into(),
                })?;
                let server_public = EcdhPublicKey::from_sec1_bytes(&resp.server_public_key)?;
                let key = derive_auth_key(&keypair.agree(&server_public))?;
                if key.id().to_string() != resp.auth_key_id {
                    return Err(TailProtoError::HandshakeFailed {
                        reason: "server derived a different auth key".into(),
                    });
                }
                self.previous = self.current.take();
                self.current = Some(VersionedKey {
                    key,
                    version: resp.key_version,
                });
                self.resume_token = Some(resp.resume_token);
                Ok(ClientEvent::HandshakeComplete {
                    key_version: resp.key_version,
                })
            }
            Frame::ResumeResponse(resp) => {
                let current = self.current.as_mut().ok_or_else(|| TailProtoError::ResumeTokenInvalid {
                    reason: "no local key to resume".into(),
                })?;
                if current.key.id().to_string() != resp.auth_key_id {
                    return Err(TailProtoError::ResumeTokenInvalid {
                        reason: "server resumed a different key".into(),
                    });
                }
                current.version = resp.key_version;
                self.previous = None;
                self.out_seq = 0;
                Ok(ClientEvent::Resumed {
                    key_version: resp.key_version,
                })
            }
            Frame::Envelope(envelope) => {
                envelope.check_shape()?;
                let key = [self.current.as_ref(), self.previous.as_ref()]
                    .into_iter()
                    .flatten()
                    .find(|k| k.version == envelope.key_version)
                    .ok_or_else(|| TailProtoError::InvalidKeyVersion {
                        reason: format!("no key for version {}", envelope.key_version),
                    })?;
                let body = inner::decode_response(&envelope.open(&key.key)?)?;
                Ok(ClientEvent::Response {
                    seq: envelope.seq,
                    ack_id: envelope.ack_id,
                    body,
                })
            }
            Frame::RekeyRequired(notice) => Ok(ClientEvent::RekeyRequired(notice)),
            Frame::Error(err) => Ok(ClientEvent::Error(err)),
            other => Err(TailProtoError::ProtocolError {
                reason: format!("servers do not send '{}' frames", other.type_tag()),
            }),
        }
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
