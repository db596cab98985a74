//! Opaque resume tokens.
//!
//! A token lets a client reconnect, on this node or any sibling
//! sharing the cluster secret, without a fresh ECDH exchange. Layout
//! before base64:
//!
//! ```text
//! [expiry_millis i64 BE 8B] [iv 12B] [ciphertext || tag] [hmac 32B]
//! ```
//!
//! Verification order: HMAC, then expiry, then decryption. The payload
//! is opaque to clients.

use serde::{Deserialize, Serialize};
use tailproto_crypto::key::AuthKey;
use tailproto_crypto::sealed;
use tailproto_crypto::secrets::SealingKeys;
use tailproto_storage::session::Session;
use tailproto_types::{Result, SessionId, TailProtoError, Timestamp, UserId};

/// Length of the cleartext expiry header.
const EXPIRY_HEADER_LEN: usize = 8;

/// Session state carried inside a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumePayload {
    pub auth_key: AuthKey,
    pub key_version: u32,
    pub key_version_timestamp: Timestamp,
    pub user_id: Option<UserId>,
    pub issued_at: Timestamp,
    pub expiry: Timestamp,
}

impl ResumePayload {
    /// Rebuilds a session with the token's key material and version.
    ///
    /// Sequence counters start fresh: the resumed connection is a new
    /// transport stream.
    pub fn into_session(self, session_id: SessionId, now: Timestamp) -> Session {
        let mut session = Session::new(
            session_id,
            self.user_id.clone(),
            self.auth_key.clone(),
            self.key_version,
            now,
        );
        session.key_version_timestamp = self.key_version_timestamp;
        session
    }
}

/// Issues and verifies resume tokens under the server token keys.
pub struct TokenIssuer {
    keys: SealingKeys,
    ttl_secs: u64,
}

// TokenIssuer does not implement Debug to prevent leakage.

impl TokenIssuer {
    pub fn new(keys: SealingKeys, ttl_secs: u64) -> Self {
        Self { keys, ttl_secs }
    }

    /// Seals the session's key state into an opaque token.
    pub fn create_token(&self, session: &Session, now: Timestamp) -> Result<String> {
        let payload = ResumePayload {
            auth_key: session.auth_key.clone(),
            key_version: session.key_version,
            key_version_timestamp: session.key_version_timestamp,
            user_id: session.user_id.clone(),
            issued_at: now,
            expiry: now.plus_secs(self.ttl_secs),
        };
        let plain = serde_json::to_vec(&payload).map_err(|e| TailProtoError::CryptoError {
            reason: format!("resume payload encode failed: {e}"),
        })?;
        let header = payload.expiry.as_millis().to_be_bytes();
        let blob = sealed::seal_with_header(&self.keys, &header, &plain)?;
        Ok(crate::b64::encode(&blob))
    }

    /// Authenticates, checks expiry, and decrypts a token.
    ///
    /// # Errors
    ///
    /// [`TailProtoError::ResumeTokenInvalid`] for any failure; the
    /// client must fall back to a full handshake.
    pub fn verify_and_extract(&self, token: &str, now: &Timestamp) -> Result<ResumePayload> {
        let raw = crate::b64::decode(token).map_err(|_| invalid("token is not base64"))?;
        let verified = sealed::verify(&self.keys, &raw, EXPIRY_HEADER_LEN)
            .map_err(|_| invalid("token signature does not verify"))?;

        let mut expiry = [0u8; EXPIRY_HEADER_LEN];
        expiry.copy_from_slice(verified.header());
        let expiry = Timestamp::from_millis(i64::from_be_bytes(expiry));
        if *now > expiry {
            return Err(invalid(&format!("token expired at {expiry}")));
        }

        let plain = verified
            .decrypt()
            .map_err(|_| invalid("token payload does not decrypt"))?;
        let payload: ResumePayload =
            serde_json::from_slice(&plain).map_err(|_| invalid("token payload is malformed"))?;
        if payload.expiry != expiry {
            return Err(invalid("token expiry header mismatch"));
        }
        Ok(payload)
    }
}

fn invalid(reason: &str) -> TailProtoError {
    TailProtoError::ResumeTokenInvalid {
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_millis(1_700_000_000_000 + secs * 1000)
    }

    fn issuer(seed: u8) -> TokenIssuer {
        TokenIssuer::new(SealingKeys::new([seed; 32], [seed ^ 0xFF; 32]), 600)
    }

    fn session() -> Session {
        let mut s = Session::new(
            SessionId::new("s1"),
            Some(UserId::new("alice")),
            AuthKey::from_bytes([9; 32]),
            3,
            ts(0),
        );
        s.key_version_timestamp = ts(-50);
        s
    }

    #[test]
    fn token_restores_key_state() -> std::result::Result<(), TailProtoError> {
        let tokens = issuer(1);
        let token = tokens.create_token(&session(), ts(10))?;
        let payload = tokens.verify_and_extract(&token, &ts(20))?;
        assert_eq!(payload.key_version, 3);
        assert_eq!(payload.expiry, ts(610));

        let resumed = payload.into_session(SessionId::new("s2"), ts(20));
        assert_eq!(resumed.auth_key, AuthKey::from_bytes([9; 32]));
        assert_eq!(resumed.key_version, 3);
        assert_eq!(resumed.key_version_timestamp, ts(-50));
        assert_eq!(resumed.user_id, Some(UserId::new("alice")));
        Ok(())
    }

    #[test]
    fn expired_token_rejected() -> std::result::Result<(), TailProtoError> {
        let tokens = issuer(1);
        let token = tokens.create_token(&session(), ts(0))?;
        assert!(tokens.verify_and_extract(&token, &ts(600)).is_ok());
        assert!(matches!(
            tokens.verify_and_extract(&token, &ts(601)),
            Err(TailProtoError::ResumeTokenInvalid { .. })
        ));
        Ok(())
    }

    #[test]
    fn forged_or_foreign_token_rejected() -> std::result::Result<(), TailProtoError> {
        let token = issuer(1).create_token(&session(), ts(0))?;
        assert!(issuer(2).verify_and_extract(&token, &ts(1)).is_err());
        assert!(issuer(1).verify_and_extract("not a token", &ts(1)).is_err());

        let mut raw = crate::b64::decode(&token)?;
        raw[0] ^= 0x01; // push the expiry
        let forged = crate::b64::encode(&raw);
        assert!(issuer(1).verify_and_extract(&forged, &ts(1)).is_err());
        Ok(())
    }
}
