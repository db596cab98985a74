//! Server side of the key exchange.
//!
//! A handshake on a connection that already has a session is a
//! rotation: the derived key becomes current, the previous key enters
//! its grace window, and any pending rekey deadline is cleared.

use tailproto_crypto::ecdh::{EcdhPublicKey, EphemeralKeypair};
use tailproto_crypto::hkdf::derive_auth_key;
use tailproto_storage::session::Session;
use tailproto_storage::store::SessionStore;
use tailproto_types::{Result, SessionId, TailProtoError, Timestamp};

use crate::frame::{HandshakeInit, HandshakeResponse};
use crate::resumption::TokenIssuer;

/// Result of a completed server handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub response: HandshakeResponse,
    pub session: Session,
    /// `true` if an existing session was rotated rather than created.
    pub rotated: bool,
}

/// Runs the server half of the handshake for `session_id`.
///
/// # Errors
///
/// [`TailProtoError::HandshakeFailed`] if the client key is invalid or
/// derivation fails; storage errors propagate.
pub fn accept_handshake(
    store: &SessionStore,
    tokens: &TokenIssuer,
    session_id: &SessionId,
    init: &HandshakeInit,
    now: Timestamp,
) -> Result<HandshakeOutcome> {
    let client_public = EcdhPublicKey::from_sec1_bytes(&init.client_public_key)?;

    let keypair = EphemeralKeypair::generate();
    let server_public_key = keypair.public_key().to_sec1_bytes();
    let shared = keypair.agree(&client_public);
    let auth_key = derive_auth_key(&shared).map_err(|e| TailProtoError::HandshakeFailed {
        reason: format!("key derivation failed: {e}"),
    })?;

    let (session, rotated) = match store.get(session_id)? {
        Some(_) => {
            let session = store.update(session_id, |s| {
                s.rotate(auth_key, now)?;
                s.rekey_deadline = None;
                Ok(s.clone())
            })?;
            (session, true)
        }
        None => (store.create(session_id.clone(), None, auth_key, 1, now)?, false),
    };

    let resume_token = tokens.create_token(&session, now)?;
    tracing::info!(
        session_id = %session_id,
        key_version = session.key_version,
        rotated,
        "handshake completed"
    );

    Ok(HandshakeOutcome {
        response: HandshakeResponse {
            server_public_key,
            auth_key_id: session.auth_key_id.to_string(),
            key_version: session.key_version,
            server_time: now.as_millis(),
            resume_token,
        },
        session,
        rotated,
    })
}
