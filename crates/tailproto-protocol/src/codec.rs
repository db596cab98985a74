//! The per-frame protocol pipeline.
//!
//! Inbound envelopes pass, in order:
//!
//! 1. shape check and session lookup
//! 2. rekey deadline
//! 3. key-version selection (current, or previous inside the grace
//!    window and reuse budget)
//! 4. decryption (outside the session lock, possibly on the pool)
//! 5. atomic commit: budget accounting, early old-key retirement,
//!    sequence validation
//! 6. response-cache lookup for retried request ids
//! 7. handler execution
//! 8. sealing under the current key with the next outbound seq
//!
//! Rejections before step 6 are answered with a plaintext `error`
//! frame; handler failures are encrypted `{ok: false}` results.

use std::sync::{Arc, Mutex};

use tailproto_crypto::key::AuthKey;
use tailproto_storage::session::Session;
use tailproto_storage::store::SessionStore;
use tailproto_types::config::ProtoConfig;
use tailproto_types::{Result, SessionId, TailProtoError, Timestamp};

use crate::envelope::{Envelope, EnvelopeHeader};
use crate::executor::CryptoExecutor;
use crate::frame::{ErrorFrame, Frame, RekeyNotice, ResumeRequest, ResumeResponse};
use crate::handshake::accept_handshake;
use crate::inner::{self, AppEvent, HandlerContext, InnerResponse, RequestHandler};
use crate::response_cache::{ResponseCache, ResponseKey};
use crate::resumption::TokenIssuer;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// A frame ready to leave the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Carries no outbound sequence number (plaintext frames and
    /// cached replays); send immediately.
    Plain(Vec<u8>),
    /// Envelope holding outbound `seq`. `frame` is `None` if sealing
    /// failed after the sequence number was allocated.
    Sealed { seq: u64, frame: Option<Vec<u8>> },
}

impl Outbound {
    /// Encoded frame bytes, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Plain(bytes) => Some(bytes),
            Self::Sealed { frame, .. } => frame.as_deref(),
        }
    }
}

/// What an inbound frame turned out to be.
#[derive(Debug)]
pub enum InboundKind {
    Handshake { key_version: u32, rotated: bool },
    Resumed { key_version: u32 },
    Request { request_id: Option<String>, replayed: bool },
    Rejected(TailProtoError),
}

/// Replies and classification for one inbound frame.
#[derive(Debug)]
pub struct Processed {
    pub replies: Vec<Outbound>,
    pub kind: InboundKind,
}

/// How a sequence number related to the session's high-water mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqDisposition {
    /// `seq > lastSeq`; `lastSeq` advanced.
    Advanced,
    /// Within the replay window; `lastSeq` unchanged.
    Reordered,
    /// Older than the replay window, soft-accepted.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeySlot {
    Current,
    Previous,
}

// ---------------------------------------------------------------------------
// EnvelopeCodec
// ---------------------------------------------------------------------------

/// Stateless-per-call pipeline over an injected [`SessionStore`].
pub struct EnvelopeCodec {
    store: Arc<SessionStore>,
    tokens: TokenIssuer,
    config: ProtoConfig,
    executor: CryptoExecutor,
    responses: Mutex<ResponseCache>,
}

impl EnvelopeCodec {
    pub fn new(store: Arc<SessionStore>, tokens: TokenIssuer, config: ProtoConfig) -> Self {
        let executor = CryptoExecutor::from_threshold(config.offload_threshold_bytes);
        let responses = Mutex::new(ResponseCache::new(
            config.response_cache_capacity,
            config.response_cache_ttl_secs,
        ));
        Self {
            store,
            tokens,
            config,
            executor,
            responses,
        }
    }

    /// Overrides the crypto placement policy.
    pub fn with_executor(mut self, executor: CryptoExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &ProtoConfig {
        &self.config
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Processes one raw inbound frame for `session_id`.
    ///
    /// Protocol failures are answered, never propagated: the returned
    /// [`Processed`] carries an `error` frame and
    /// [`InboundKind::Rejected`]. `Err` is reserved for failing to
    /// encode a reply at all.
    pub async fn process(
        &self,
        session_id: &SessionId,
        raw: &[u8],
        handler: &dyn RequestHandler,
        now: Timestamp,
    ) -> Result<Processed> {
        let frame = match Frame::from_client_bytes(raw) {
            Ok(frame) => frame,
            Err(e) => return self.reject(session_id, e, None),
        };

        match frame {
            Frame::HandshakeInit(init) => {
                match accept_handshake(&self.store, &self.tokens, session_id, &init, now) {
                    Ok(outcome) => Ok(Processed {
                        replies: vec![Outbound::Plain(
                            Frame::HandshakeResponse(outcome.response).to_bytes()?,
                        )],
                        kind: InboundKind::Handshake {
                            key_version: outcome.session.key_version,
                            rotated: outcome.rotated,
                        },
                    }),
                    Err(e) => self.reject(session_id, as_handshake_error(e), None),
                }
            }
            Frame::Resume(request) => match self.resume(session_id, &request, now) {
                Ok(response) => Ok(Processed {
                    kind: InboundKind::Resumed {
                        key_version: response.key_version,
                    },
                    replies: vec![Outbound::Plain(Frame::ResumeResponse(response).to_bytes()?)],
                }),
                Err(e) => self.reject(session_id, e, None),
            },
            Frame::Envelope(envelope) => {
                let request_id = envelope.request_id.clone();
                match self.process_envelope(session_id, envelope, handler, now).await {
                    Ok(processed) => Ok(processed),
                    Err(e) => self.reject(session_id, e, request_id),
                }
            }
            other => self.reject(
                session_id,
                TailProtoError::ProtocolRequired {
                    reason: format!("unexpected '{}' frame", other.type_tag()),
                },
                None,
            ),
        }
    }

    /// Reinstalls a session from a resume token.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::ResumeTokenInvalid`] for a bad or expired token,
    /// and on a live session for a token older than its key version or
    /// once its rekey deadline has passed. A pending deadline carries
    /// over into the resumed session.
    pub fn resume(
        &self,
        session_id: &SessionId,
        request: &ResumeRequest,
        now: Timestamp,
    ) -> Result<ResumeResponse> {
        let payload = self.tokens.verify_and_extract(&request.resume_token, &now)?;
        let session = self.store.replace_with(session_id, |existing| {
            let mut resumed = payload.into_session(session_id.clone(), now);
            if let Some(live) = existing {
                if resumed.key_version < live.key_version {
                    return Err(TailProtoError::ResumeTokenInvalid {
                        reason: format!(
                            "token for key version {} predates session key version {}",
                            resumed.key_version, live.key_version
                        ),
                    });
                }
                if live.deadline_passed(&now) {
                    return Err(TailProtoError::ResumeTokenInvalid {
                        reason: "rekey deadline passed; perform a fresh handshake".into(),
                    });
                }
                resumed.rekey_deadline = live.rekey_deadline;
            }
            Ok(resumed)
        })?;
        let response = ResumeResponse {
            auth_key_id: session.auth_key_id.to_string(),
            key_version: session.key_version,
            server_time: now.as_millis(),
        };
        tracing::info!(
            session_id = %session_id,
            key_version = response.key_version,
            "session resumed"
        );
        Ok(response)
    }

    async fn process_envelope(
        &self,
        session_id: &SessionId,
        envelope: Envelope,
        handler: &dyn RequestHandler,
        now: Timestamp,
    ) -> Result<Processed> {
        envelope.check_shape()?;
        let session = self.lookup(session_id)?;

        if session.deadline_passed(&now) {
            return Err(TailProtoError::RekeyDeadlineExceeded {
                reason: format!(
                    "rekey deadline {} passed; perform a fresh handshake",
                    session.rekey_deadline.map(|d| d.to_string()).unwrap_or_default()
                ),
            });
        }

        let (slot, key) = self.select_key(&session, &envelope, &now)?;
        let seq = envelope.seq;
        let key_version = envelope.key_version;
        let request_id = envelope.request_id.clone();
        // Keyed by the key that opens the frame, not the id the peer claims.
        let cache_key = request_id.clone().map(|rid| (key.id().to_string(), rid));

        let plaintext = {
            let size = envelope.ciphertext.len();
            self.executor
                .run(size, move || envelope.open(&key))
                .await?
        };

        if seq == 0 {
            return Err(TailProtoError::InvalidSequence {
                reason: "sequence numbers start at 1".into(),
            });
        }

        let (disposition, retired) = self.commit(session_id, slot, key_version, seq, &now)?;
        if retired {
            tracing::info!(session_id = %session_id, "old key retired on first current-key frame");
        }
        if disposition == SeqDisposition::Stale {
            tracing::warn!(
                session_id = %session_id,
                seq,
                "frame older than replay window soft-accepted"
            );
        }

        if let Some(key) = &cache_key {
            if let Some(frame) = self.cached_response(key, &now) {
                tracing::debug!(session_id = %session_id, request_id = %key.1, "replaying cached response");
                return Ok(Processed {
                    replies: vec![Outbound::Plain(frame)],
                    kind: InboundKind::Request {
                        request_id,
                        replayed: true,
                    },
                });
            }
        }

        let request = inner::decode_request(&plaintext)?;
        let ctx = HandlerContext {
            session_id: session_id.clone(),
            user_id: session.user_id.clone(),
        };
        let response = inner::execute(&request, handler, &ctx, self.config.max_batch_items)?;

        let reply = self.seal(session_id, &response, request_id.clone()).await?;
        // The reply already holds an outbound seq; caching must not lose it.
        if let (Some(key), Outbound::Sealed { frame: Some(frame), .. }) = (cache_key, &reply) {
            match self.lock_responses() {
                Ok(mut responses) => responses.insert(key, frame.clone(), now),
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "response not cached"),
            }
        }

        Ok(Processed {
            replies: vec![reply],
            kind: InboundKind::Request {
                request_id,
                replayed: false,
            },
        })
    }

    fn lookup(&self, session_id: &SessionId) -> Result<Session> {
        match self.store.get(session_id)? {
            Some(session) => Ok(session),
            None if self.store.health().degraded => Err(TailProtoError::SessionNotReady {
                reason: format!("session '{session_id}' unavailable while store is degraded"),
            }),
            None => Err(TailProtoError::ProtocolRequired {
                reason: "no session established; handshake first".into(),
            }),
        }
    }

    /// Picks the key an envelope claims, enforcing the grace window and
    /// the old-key reuse budget.
    fn select_key(
        &self,
        session: &Session,
        envelope: &Envelope,
        now: &Timestamp,
    ) -> Result<(KeySlot, AuthKey)> {
        if envelope.key_version == session.key_version {
            return Ok((KeySlot::Current, session.auth_key.clone()));
        }

        let previous = session.key_version.checked_sub(1).filter(|v| *v >= 1);
        if previous != Some(envelope.key_version) {
            return Err(TailProtoError::InvalidKeyVersion {
                reason: format!(
                    "key version {} (session at {})",
                    envelope.key_version, session.key_version
                ),
            });
        }

        let old_key = session
            .old_key
            .as_ref()
            .ok_or_else(|| TailProtoError::InvalidKeyVersion {
                reason: format!("key version {} already retired", envelope.key_version),
            })?;
        if now.exceeds(
            &session.key_version_timestamp,
            self.config.accept_old_key_window_secs,
        ) {
            return Err(TailProtoError::InvalidKeyVersion {
                reason: format!(
                    "key version {} outside the {}s grace window",
                    envelope.key_version, self.config.accept_old_key_window_secs
                ),
            });
        }
        self.check_budget(session, now)?;
        Ok((KeySlot::Previous, old_key.clone()))
    }

    fn check_budget(&self, session: &Session, now: &Timestamp) -> Result<()> {
        if session.old_key_hit_count >= self.config.max_old_key_hits {
            return Err(TailProtoError::KeyReuseExceeded {
                reason: format!("old key used {} times", session.old_key_hit_count),
            });
        }
        if let Some(first) = &session.old_key_first_hit_at {
            if now.exceeds(first, self.config.max_old_key_duration_secs) {
                return Err(TailProtoError::KeyReuseExceeded {
                    reason: format!(
                        "old key in use for more than {}s",
                        self.config.max_old_key_duration_secs
                    ),
                });
            }
        }
        Ok(())
    }

    /// Applies the post-decrypt session mutations atomically.
    ///
    /// Returns the sequence disposition and whether the old key was
    /// retired by this frame.
    fn commit(
        &self,
        session_id: &SessionId,
        slot: KeySlot,
        key_version: u32,
        seq: u64,
        now: &Timestamp,
    ) -> Result<(SeqDisposition, bool)> {
        let window = self.config.replay_window;
        let strict = self.config.strict_replay_window;

        self.store.update(session_id, |s| {
            let mut retired = false;
            match slot {
                KeySlot::Current => {
                    if s.key_version != key_version {
                        return Err(TailProtoError::InvalidKeyVersion {
                            reason: "session rotated while the frame was in flight".into(),
                        });
                    }
                    if s.old_key.is_some() {
                        s.destroy_old_key();
                        retired = true;
                    }
                }
                KeySlot::Previous => {
                    if s.old_key.is_none() || s.key_version.checked_sub(1) != Some(key_version) {
                        return Err(TailProtoError::InvalidKeyVersion {
                            reason: "previous key retired while the frame was in flight".into(),
                        });
                    }
                    self.check_budget(s, now)?;
                    s.old_key_hit_count = s.old_key_hit_count.saturating_add(1);
                    if s.old_key_first_hit_at.is_none() {
                        s.old_key_first_hit_at = Some(*now);
                    }
                }
            }

            let disposition = if seq > s.last_seq {
                s.last_seq = seq;
                SeqDisposition::Advanced
            } else if s.last_seq - seq < window {
                SeqDisposition::Reordered
            } else if strict {
                return Err(TailProtoError::InvalidSequence {
                    reason: format!("seq {seq} is older than the replay window (last {})", s.last_seq),
                });
            } else {
                SeqDisposition::Stale
            };
            Ok((disposition, retired))
        })
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    /// Wraps a server-initiated push for `session_id`.
    pub async fn push(&self, session_id: &SessionId, event: AppEvent) -> Result<Outbound> {
        self.seal(session_id, &InnerResponse::Push(event), None).await
    }

    /// Plaintext "rekey required" notice.
    pub fn rekey_notice(&self, reason: &str, deadline: Option<Timestamp>) -> Result<Vec<u8>> {
        Frame::RekeyRequired(RekeyNotice {
            reason: reason.to_owned(),
            deadline: deadline.map(|d| d.as_millis()),
        })
        .to_bytes()
    }

    /// Seals `body` under the current key with the next outbound seq.
    ///
    /// # Errors
    ///
    /// Fails only if no outbound sequence number could be allocated;
    /// a later sealing failure yields `Sealed { frame: None }`.
    async fn seal(
        &self,
        session_id: &SessionId,
        body: &InnerResponse,
        ack_id: Option<String>,
    ) -> Result<Outbound> {
        let plaintext = inner::encode(body)?;
        let (key, key_version, seq) = self
            .store
            .update(session_id, |s| Ok((s.auth_key.clone(), s.key_version, s.next_out_seq())))?;

        let header = EnvelopeHeader {
            seq,
            key_version,
            request_id: None,
            ack_id,
        };
        let sealed = self
            .executor
            .run(plaintext.len(), move || {
                Frame::Envelope(Envelope::seal(&key, header, &plaintext)?).to_bytes()
            })
            .await;

        match sealed {
            Ok(frame) => Ok(Outbound::Sealed {
                seq,
                frame: Some(frame),
            }),
            Err(e) => {
                tracing::error!(session_id = %session_id, seq, error = %e, "outbound seal failed");
                Ok(Outbound::Sealed { seq, frame: None })
            }
        }
    }

    fn reject(
        &self,
        session_id: &SessionId,
        err: TailProtoError,
        ack_id: Option<String>,
    ) -> Result<Processed> {
        tracing::debug!(session_id = %session_id, code = err.code(), error = %err, "frame rejected");
        let frame = Frame::Error(ErrorFrame::from_error(&err, ack_id)).to_bytes()?;
        Ok(Processed {
            replies: vec![Outbound::Plain(frame)],
            kind: InboundKind::Rejected(err),
        })
    }

    /// Cached reply for `key`. An unusable cache is a miss.
    fn cached_response(&self, key: &ResponseKey, now: &Timestamp) -> Option<Vec<u8>> {
        match self.lock_responses() {
            Ok(mut responses) => responses.get(key, now),
            Err(e) => {
                tracing::warn!(request_id = %key.1, error = %e, "response cache skipped");
                None
            }
        }
    }

    fn lock_responses(&self) -> Result<std::sync::MutexGuard<'_, ResponseCache>> {
        self.responses.lock().map_err(|_| TailProtoError::ProtocolError {
            reason: "response cache lock poisoned".into(),
        })
    }
}

// EnvelopeCodec does not implement Debug to prevent leakage.

/// Handshake-path failures other than storage are reported as
/// `HandshakeFailed`.
fn as_handshake_error(err: TailProtoError) -> TailProtoError {
    match err {
        TailProtoError::HandshakeFailed { .. }
        | TailProtoError::SessionNotReady { .. }
        | TailProtoError::StorageError { .. } => err,
        other => TailProtoError::HandshakeFailed {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientEvent, ClientSession};
    use crate::inner::InnerRequest;
    use tailproto_crypto::secrets::ServerSecrets;
    use tailproto_storage::kv::MemoryKvStore;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, _ctx: &HandlerContext, event: &AppEvent) -> Result<Vec<u8>> {
            Ok(event.body.clone())
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_millis(1_750_000_000_000 + secs * 1000)
    }

    fn codec() -> Result<EnvelopeCodec> {
        let config = ProtoConfig::default();
        let secrets = ServerSecrets::derive(&[0x5A; 32])?;
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryKvStore::new()),
            secrets.store_keys().clone(),
            &config,
        ));
        let tokens = TokenIssuer::new(secrets.token_keys().clone(), config.resume_token_ttl_secs);
        Ok(EnvelopeCodec::new(store, tokens, config))
    }

    fn reply_bytes(processed: &Processed) -> Result<Vec<u8>> {
        processed
            .replies
            .first()
            .and_then(Outbound::bytes)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TailProtoError::ProtocolError {
                reason: "no sealed reply".into(),
            })
    }

    #[tokio::test]
    async fn poisoned_response_cache_still_delivers_reply() -> Result<()> {
        let codec = codec()?;
        let sid = SessionId::new("conn-1");
        let mut client = ClientSession::new();

        let init = client.handshake_init()?;
        let accepted = codec.process(&sid, &init, &Echo, ts(0)).await?;
        client.receive(&reply_bytes(&accepted)?)?;

        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = codec.responses.lock();
                    panic!("poison the response cache");
                })
                .join();
        });
        assert!(codec.responses.is_poisoned());

        for (n, at) in [(1u64, 1), (2, 2)] {
            let frame = client.seal_request(&InnerRequest::Ping, Some(format!("req-{n}").as_str()))?;
            let processed = codec.process(&sid, &frame, &Echo, ts(at)).await?;
            match processed.replies.as_slice() {
                [Outbound::Sealed { seq, frame: Some(_) }] => assert_eq!(*seq, n),
                other => {
                    return Err(TailProtoError::ProtocolError {
                        reason: format!("unexpected replies {other:?}"),
                    })
                }
            }
            assert!(matches!(
                client.receive(&reply_bytes(&processed)?)?,
                ClientEvent::Response { .. }
            ));
        }
        Ok(())
    }
}
