//! Integration tests for the envelope codec.
//!
//! A real `ClientSession` talks to an `EnvelopeCodec` over raw frame
//! bytes. All time-dependent behaviour is driven by injected
//! timestamps; no test sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tailproto_crypto::secrets::ServerSecrets;
use tailproto_protocol::client::{ClientEvent, ClientSession};
use tailproto_protocol::codec::{EnvelopeCodec, InboundKind, Outbound, Processed};
use tailproto_protocol::executor::CryptoExecutor;
use tailproto_protocol::inner::{AppEvent, HandlerContext, InnerRequest, InnerResponse, RequestHandler};
use tailproto_protocol::resumption::TokenIssuer;
use tailproto_storage::kv::{KvStore, MemoryKvStore};
use tailproto_storage::store::SessionStore;
use tailproto_types::config::ProtoConfig;
use tailproto_types::{Result, SessionId, TailProtoError, Timestamp};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ts(secs: i64) -> Timestamp {
    Timestamp::from_millis(1_750_000_000_000 + secs * 1000)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn fail(reason: &str) -> TailProtoError {
    TailProtoError::ProtocolError {
        reason: reason.to_owned(),
    }
}

/// Counts invocations and echoes the body back with a prefix.
#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

impl RequestHandler for CountingHandler {
    fn handle(&self, _ctx: &HandlerContext, event: &AppEvent) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if event.event == "fail" {
            return Err(fail("handler refused"));
        }
        let mut out = b"echo:".to_vec();
        out.extend_from_slice(&event.body);
        Ok(out)
    }
}

struct Server {
    kv: Arc<MemoryKvStore>,
    store: Arc<SessionStore>,
    codec: EnvelopeCodec,
}

fn server_on(kv: Arc<MemoryKvStore>, config: ProtoConfig) -> Result<Server> {
    init_tracing();
    let secrets = ServerSecrets::derive(&[0x5A; 32])?;
    let shared: Arc<dyn KvStore> = kv.clone();
    let store = Arc::new(SessionStore::new(shared, secrets.store_keys().clone(), &config));
    let tokens = TokenIssuer::new(secrets.token_keys().clone(), config.resume_token_ttl_secs);
    let codec = EnvelopeCodec::new(store.clone(), tokens, config);
    Ok(Server { kv, store, codec })
}

fn server(config: ProtoConfig) -> Result<Server> {
    server_on(Arc::new(MemoryKvStore::new()), config)
}

fn only_reply(processed: &Processed) -> Result<Vec<u8>> {
    match processed.replies.as_slice() {
        [reply] => reply
            .bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| fail("reply failed to seal")),
        _ => Err(fail("expected exactly one reply")),
    }
}

async fn handshake(
    server: &Server,
    sid: &SessionId,
    client: &mut ClientSession,
    now: Timestamp,
) -> Result<u32> {
    let init = client.handshake_init()?;
    let processed = server
        .codec
        .process(sid, &init, &CountingHandler::default(), now)
        .await?;
    match client.receive(&only_reply(&processed)?)? {
        ClientEvent::HandshakeComplete { key_version } => Ok(key_version),
        other => Err(fail(&format!("unexpected {other:?}"))),
    }
}

fn rejection(processed: &Processed) -> Option<&TailProtoError> {
    match &processed.kind {
        InboundKind::Rejected(e) => Some(e),
        _ => None,
    }
}

fn ping() -> InnerRequest {
    InnerRequest::Ping
}

fn app(event: &str, body: &[u8]) -> InnerRequest {
    InnerRequest::App(AppEvent {
        event: event.into(),
        body: body.to_vec(),
    })
}

// ===========================================================================
// Ping / ack / rotation scenario
// ===========================================================================

#[tokio::test]
async fn ping_ack_then_rotation_grace_window() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();

    assert_eq!(handshake(&srv, &sid, &mut client, ts(0)).await?, 1);

    let frame = client.seal_request(&ping(), Some("req-1"))?;
    let processed = srv.codec.process(&sid, &frame, &handler, ts(1)).await?;
    match client.receive(&only_reply(&processed)?)? {
        ClientEvent::Response { ack_id, body, .. } => {
            assert_eq!(ack_id.as_deref(), Some("req-1"));
            assert_eq!(body, InnerResponse::Pong);
        }
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }

    // Rotation: frames already sealed under v1 are in flight.
    let init = client.handshake_init()?;
    let in_window = client.seal_request(&ping(), Some("req-2"))?;
    let late = client.seal_request(&ping(), Some("req-3"))?;

    let rotated = srv.codec.process(&sid, &init, &handler, ts(10)).await?;
    assert!(matches!(
        rotated.kind,
        InboundKind::Handshake { key_version: 2, rotated: true }
    ));
    client.receive(&only_reply(&rotated)?)?;
    assert_eq!(client.key_version(), Some(2));

    let ok = srv.codec.process(&sid, &in_window, &handler, ts(20)).await?;
    assert!(rejection(&ok).is_none());
    match client.receive(&only_reply(&ok)?)? {
        ClientEvent::Response { ack_id, .. } => assert_eq!(ack_id.as_deref(), Some("req-2")),
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }

    let rejected = srv.codec.process(&sid, &late, &handler, ts(71)).await?;
    assert!(matches!(
        rejection(&rejected),
        Some(TailProtoError::InvalidKeyVersion { .. })
    ));
    match client.receive(&only_reply(&rejected)?)? {
        ClientEvent::Error(err) => {
            assert_eq!(err.code, "invalid_key_version");
            assert_eq!(err.ack_id.as_deref(), Some("req-3"));
        }
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }
    Ok(())
}

// ===========================================================================
// Old-key budget and retirement
// ===========================================================================

#[tokio::test]
async fn old_key_hit_budget_exhausts() -> Result<()> {
    let config = ProtoConfig {
        max_old_key_hits: 2,
        ..ProtoConfig::default()
    };
    let srv = server(config)?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let init = client.handshake_init()?;
    let frames = [
        client.seal_request(&ping(), None)?,
        client.seal_request(&ping(), None)?,
        client.seal_request(&ping(), None)?,
    ];
    srv.codec.process(&sid, &init, &handler, ts(1)).await?;

    for frame in &frames[..2] {
        let p = srv.codec.process(&sid, frame, &handler, ts(2)).await?;
        assert!(rejection(&p).is_none());
    }
    let p = srv.codec.process(&sid, &frames[2], &handler, ts(2)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::KeyReuseExceeded { .. })));
    assert_eq!(srv.store.require(&sid)?.old_key_hit_count, 2);
    Ok(())
}

#[tokio::test]
async fn old_key_duration_budget_exhausts() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let init = client.handshake_init()?;
    let first = client.seal_request(&ping(), None)?;
    let second = client.seal_request(&ping(), None)?;
    srv.codec.process(&sid, &init, &handler, ts(100)).await?;

    let p = srv.codec.process(&sid, &first, &handler, ts(101)).await?;
    assert!(rejection(&p).is_none());

    // Still inside the 60s grace window, but 31s after the first hit.
    let p = srv.codec.process(&sid, &second, &handler, ts(132)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::KeyReuseExceeded { .. })));
    Ok(())
}

#[tokio::test]
async fn current_key_frame_retires_old_key() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let init = client.handshake_init()?;
    let stale = client.seal_request(&ping(), None)?;
    let rotated = srv.codec.process(&sid, &init, &handler, ts(1)).await?;
    client.receive(&only_reply(&rotated)?)?;
    assert!(srv.store.require(&sid)?.old_key.is_some());

    let fresh = client.seal_request(&ping(), None)?;
    srv.codec.process(&sid, &fresh, &handler, ts(2)).await?;
    assert!(srv.store.require(&sid)?.old_key.is_none());

    let p = srv.codec.process(&sid, &stale, &handler, ts(3)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::InvalidKeyVersion { .. })));
    Ok(())
}

// ===========================================================================
// Idempotent retry
// ===========================================================================

#[tokio::test]
async fn retried_request_returns_identical_bytes() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let frame = client.seal_request(&app("send", b"hello"), Some("req-42"))?;
    let first = srv.codec.process(&sid, &frame, &handler, ts(1)).await?;
    let second = srv.codec.process(&sid, &frame, &handler, ts(2)).await?;

    assert_eq!(only_reply(&first)?, only_reply(&second)?);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        second.kind,
        InboundKind::Request { replayed: true, .. }
    ));
    assert!(matches!(second.replies[0], Outbound::Plain(_)));

    match client.receive(&only_reply(&second)?)? {
        ClientEvent::Response { body, .. } => match body {
            InnerResponse::Result(item) => {
                assert!(item.ok);
                assert_eq!(item.data.as_deref(), Some(&b"echo:hello"[..]));
            }
            other => return Err(fail(&format!("unexpected {other:?}"))),
        },
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }
    Ok(())
}

// ===========================================================================
// Replay window
// ===========================================================================

async fn session_at_seq_100(config: ProtoConfig) -> Result<(Server, SessionId, ClientSession)> {
    let srv = server(config)?;
    let sid = SessionId::new("conn-1");
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;
    srv.store.update(&sid, |s| {
        s.last_seq = 100;
        Ok(())
    })?;
    Ok((srv, sid, client))
}

#[tokio::test]
async fn replay_window_accepts_without_advancing() -> Result<()> {
    let config = ProtoConfig {
        replay_window: 10,
        ..ProtoConfig::default()
    };
    let (srv, sid, client) = session_at_seq_100(config).await?;
    let handler = CountingHandler::default();

    let p = srv.codec.process(&sid, &client.seal_at(95, &ping(), None)?, &handler, ts(1)).await?;
    assert!(rejection(&p).is_none());
    assert_eq!(srv.store.require(&sid)?.last_seq, 100);

    // Beyond the window: soft-accepted, still not advancing.
    let p = srv.codec.process(&sid, &client.seal_at(89, &ping(), None)?, &handler, ts(2)).await?;
    assert!(rejection(&p).is_none());
    assert_eq!(srv.store.require(&sid)?.last_seq, 100);

    let p = srv.codec.process(&sid, &client.seal_at(101, &ping(), None)?, &handler, ts(3)).await?;
    assert!(rejection(&p).is_none());
    assert_eq!(srv.store.require(&sid)?.last_seq, 101);
    Ok(())
}

#[tokio::test]
async fn strict_replay_window_rejects_stale_frames() -> Result<()> {
    let config = ProtoConfig {
        replay_window: 10,
        strict_replay_window: true,
        ..ProtoConfig::default()
    };
    let (srv, sid, client) = session_at_seq_100(config).await?;
    let handler = CountingHandler::default();

    let p = srv.codec.process(&sid, &client.seal_at(95, &ping(), None)?, &handler, ts(1)).await?;
    assert!(rejection(&p).is_none());

    let p = srv.codec.process(&sid, &client.seal_at(89, &ping(), None)?, &handler, ts(2)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::InvalidSequence { .. })));
    Ok(())
}

#[tokio::test]
async fn sequence_zero_rejected() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let p = srv
        .codec
        .process(&sid, &client.seal_at(0, &ping(), None)?, &CountingHandler::default(), ts(1))
        .await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::InvalidSequence { .. })));
    Ok(())
}

// ===========================================================================
// Deadline, protocol-required, decrypt failure
// ===========================================================================

#[tokio::test]
async fn rekey_deadline_blocks_until_handshake() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;
    srv.store.set_rekey_deadline(&sid, Some(ts(100)))?;

    let p = srv.codec.process(&sid, &client.seal_request(&ping(), None)?, &handler, ts(100)).await?;
    assert!(rejection(&p).is_none());

    let p = srv.codec.process(&sid, &client.seal_request(&ping(), None)?, &handler, ts(101)).await?;
    assert!(matches!(
        rejection(&p),
        Some(TailProtoError::RekeyDeadlineExceeded { .. })
    ));

    assert_eq!(handshake(&srv, &sid, &mut client, ts(102)).await?, 2);
    assert!(srv.store.require(&sid)?.rekey_deadline.is_none());
    let p = srv.codec.process(&sid, &client.seal_request(&ping(), None)?, &handler, ts(103)).await?;
    assert!(rejection(&p).is_none());
    Ok(())
}

#[tokio::test]
async fn unencrypted_application_frame_is_protocol_required() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let p = srv
        .codec
        .process(&sid, br#"{"type":"send_message","text":"hi"}"#, &CountingHandler::default(), ts(0))
        .await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::ProtocolRequired { .. })));
    Ok(())
}

#[tokio::test]
async fn envelope_without_session() -> Result<()> {
    let origin = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let mut client = ClientSession::new();
    handshake(&origin, &sid, &mut client, ts(0)).await?;
    let frame = client.seal_request(&ping(), None)?;

    let stranger = server(ProtoConfig::default())?;
    let p = stranger.codec.process(&sid, &frame, &CountingHandler::default(), ts(1)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::ProtocolRequired { .. })));

    // With the store down, the missing session is reported as not ready.
    stranger.kv.set_available(false);
    let p = stranger.codec.process(&sid, &frame, &CountingHandler::default(), ts(2)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::SessionNotReady { .. })));
    Ok(())
}

#[tokio::test]
async fn foreign_key_is_decrypt_failure() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid_a = SessionId::new("conn-a");
    let sid_b = SessionId::new("conn-b");
    let mut client_a = ClientSession::new();
    let mut client_b = ClientSession::new();
    handshake(&srv, &sid_a, &mut client_a, ts(0)).await?;
    handshake(&srv, &sid_b, &mut client_b, ts(0)).await?;

    let frame = client_b.seal_request(&ping(), Some("x"))?;
    let p = srv.codec.process(&sid_a, &frame, &CountingHandler::default(), ts(1)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::DecryptFailed { .. })));
    assert_eq!(srv.store.require(&sid_a)?.last_seq, 0);
    Ok(())
}

// ===========================================================================
// Batching
// ===========================================================================

#[tokio::test]
async fn batch_results_match_items() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let batch = InnerRequest::Batch {
        items: vec![
            AppEvent { event: "a".into(), body: b"1".to_vec() },
            AppEvent { event: "fail".into(), body: Vec::new() },
            AppEvent { event: "c".into(), body: b"3".to_vec() },
        ],
    };
    let p = srv.codec.process(&sid, &client.seal_request(&batch, Some("b-1"))?, &handler, ts(1)).await?;
    match client.receive(&only_reply(&p)?)? {
        ClientEvent::Response {
            body: InnerResponse::Batch { results },
            ..
        } => {
            assert_eq!(results.len(), 3);
            assert!(results[0].ok);
            assert!(!results[1].ok);
            assert_eq!(results[2].data.as_deref(), Some(&b"echo:3"[..]));
        }
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }
    // One outer envelope, one sequence number.
    assert_eq!(srv.store.require(&sid)?.last_seq, 1);
    Ok(())
}

#[tokio::test]
async fn oversized_batch_is_rejected() -> Result<()> {
    let config = ProtoConfig {
        max_batch_items: 2,
        ..ProtoConfig::default()
    };
    let srv = server(config)?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let batch = InnerRequest::Batch {
        items: vec![AppEvent { event: "a".into(), body: Vec::new() }; 3],
    };
    let p = srv.codec.process(&sid, &client.seal_request(&batch, Some("b-2"))?, &handler, ts(1)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::ProtocolError { .. })));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

// ===========================================================================
// Resume, push, pooled crypto
// ===========================================================================

#[tokio::test]
async fn resume_on_sibling_node() -> Result<()> {
    let kv = Arc::new(MemoryKvStore::new());
    let node_a = server_on(kv.clone(), ProtoConfig::default())?;
    let node_b = server_on(kv, ProtoConfig::default())?;
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&node_a, &SessionId::new("conn-a"), &mut client, ts(0)).await?;

    let sid_b = SessionId::new("conn-b");
    let p = node_b.codec.process(&sid_b, &client.resume_request()?, &handler, ts(30)).await?;
    assert!(matches!(p.kind, InboundKind::Resumed { key_version: 1 }));
    assert!(matches!(client.receive(&only_reply(&p)?)?, ClientEvent::Resumed { key_version: 1 }));

    let p = node_b.codec.process(&sid_b, &client.seal_request(&ping(), Some("r"))?, &handler, ts(31)).await?;
    assert!(matches!(
        client.receive(&only_reply(&p)?)?,
        ClientEvent::Response { body: InnerResponse::Pong, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn expired_resume_token_rejected() -> Result<()> {
    let config = ProtoConfig {
        resume_token_ttl_secs: 60,
        ..ProtoConfig::default()
    };
    let srv = server(config)?;
    let mut client = ClientSession::new();
    handshake(&srv, &SessionId::new("conn-a"), &mut client, ts(0)).await?;

    let p = srv
        .codec
        .process(&SessionId::new("conn-b"), &client.resume_request()?, &CountingHandler::default(), ts(61))
        .await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::ResumeTokenInvalid { .. })));
    Ok(())
}

#[tokio::test]
async fn stale_token_cannot_roll_back_live_session() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;
    let stale_resume = client.resume_request()?;

    assert_eq!(handshake(&srv, &sid, &mut client, ts(10)).await?, 2);
    srv.store.set_rekey_deadline(&sid, Some(ts(100)))?;

    let p = srv.codec.process(&sid, &stale_resume, &handler, ts(200)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::ResumeTokenInvalid { .. })));

    let session = srv.store.require(&sid)?;
    assert_eq!(session.key_version, 2);
    assert_eq!(session.rekey_deadline, Some(ts(100)));

    let p = srv.codec.process(&sid, &client.seal_request(&ping(), None)?, &handler, ts(201)).await?;
    assert!(matches!(
        rejection(&p),
        Some(TailProtoError::RekeyDeadlineExceeded { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn resume_on_live_session_keeps_pending_deadline() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let handler = CountingHandler::default();
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;
    srv.store.set_rekey_deadline(&sid, Some(ts(100)))?;

    let p = srv.codec.process(&sid, &client.resume_request()?, &handler, ts(50)).await?;
    assert!(matches!(p.kind, InboundKind::Resumed { key_version: 1 }));
    assert!(matches!(client.receive(&only_reply(&p)?)?, ClientEvent::Resumed { key_version: 1 }));
    assert_eq!(srv.store.require(&sid)?.rekey_deadline, Some(ts(100)));

    // Past the deadline only a fresh handshake helps.
    let p = srv.codec.process(&sid, &client.resume_request()?, &handler, ts(101)).await?;
    assert!(matches!(rejection(&p), Some(TailProtoError::ResumeTokenInvalid { .. })));
    assert_eq!(handshake(&srv, &sid, &mut client, ts(102)).await?, 2);
    assert!(srv.store.require(&sid)?.rekey_deadline.is_none());
    Ok(())
}

#[tokio::test]
async fn server_push_is_sealed_in_order() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let sid = SessionId::new("conn-1");
    let mut client = ClientSession::new();
    handshake(&srv, &sid, &mut client, ts(0)).await?;

    let event = AppEvent {
        event: "notify".into(),
        body: b"you have mail".to_vec(),
    };
    let first = srv.codec.push(&sid, event.clone()).await?;
    let second = srv.codec.push(&sid, event.clone()).await?;
    assert!(matches!(first, Outbound::Sealed { seq: 1, .. }));
    assert!(matches!(second, Outbound::Sealed { seq: 2, .. }));

    let bytes = first.bytes().ok_or_else(|| fail("push not sealed"))?;
    match client.receive(bytes)? {
        ClientEvent::Response { body, ack_id, .. } => {
            assert_eq!(body, InnerResponse::Push(event));
            assert!(ack_id.is_none());
        }
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }
    Ok(())
}

#[tokio::test]
async fn pooled_crypto_handles_large_payloads() -> Result<()> {
    let srv = server(ProtoConfig::default())?;
    let codec = {
        let secrets = ServerSecrets::derive(&[0x5A; 32])?;
        let tokens = TokenIssuer::new(secrets.token_keys().clone(), 3600);
        EnvelopeCodec::new(srv.store.clone(), tokens, ProtoConfig::default())
            .with_executor(CryptoExecutor::Pool { threshold: 1024 })
    };
    let sid = SessionId::new("conn-1");
    let mut client = ClientSession::new();
    let init = client.handshake_init()?;
    let p = codec.process(&sid, &init, &CountingHandler::default(), ts(0)).await?;
    client.receive(&only_reply(&p)?)?;

    let body = vec![0x41u8; 200_000];
    let frame = client.seal_request(&app("upload", &body), None)?;
    let p = codec.process(&sid, &frame, &CountingHandler::default(), ts(1)).await?;
    match client.receive(&only_reply(&p)?)? {
        ClientEvent::Response {
            body: InnerResponse::Result(item),
            ..
        } => assert_eq!(item.data.map(|d| d.len()), Some(body.len() + 5)),
        other => return Err(fail(&format!("unexpected {other:?}"))),
    }
    Ok(())
}
