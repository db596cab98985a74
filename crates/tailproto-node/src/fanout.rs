//! Local delivery of "rekey required" notices.
//!
//! Both the scheduler (for rotations it issues) and cluster sync (for
//! rotations issued anywhere in the cluster) end here: every session of
//! the user that is connected to *this* node gets its deadline set and
//! a plaintext `rekey_required` frame.

use std::sync::Arc;

use tailproto_protocol::frame::{Frame, RekeyNotice};
use tailproto_storage::store::SessionStore;
use tailproto_types::{Result, SessionId, Timestamp, UserId};

use crate::connections::ConnectionRegistry;

pub struct RekeyFanout {
    store: Arc<SessionStore>,
    connections: Arc<ConnectionRegistry>,
}

impl RekeyFanout {
    pub fn new(store: Arc<SessionStore>, connections: Arc<ConnectionRegistry>) -> Self {
        Self { store, connections }
    }

    /// Sets `deadline` on each locally connected session of `user_id`
    /// and pushes the notice. An earlier pending deadline is kept.
    ///
    /// Returns the sessions notified.
    pub fn notify_user(
        &self,
        user_id: &UserId,
        deadline: Timestamp,
        reason: &str,
    ) -> Result<Vec<SessionId>> {
        let mut notified = Vec::new();
        for session_id in self.store.sessions_for_user(user_id)? {
            if !self.connections.contains(&session_id) {
                continue;
            }
            let effective = self.store.update(&session_id, |s| {
                let effective = match s.rekey_deadline {
                    Some(existing) if existing < deadline => existing,
                    _ => deadline,
                };
                s.rekey_deadline = Some(effective);
                Ok(effective)
            })?;

            let notice = Frame::RekeyRequired(RekeyNotice {
                reason: reason.to_owned(),
                deadline: Some(effective.as_millis()),
            })
            .to_bytes()?;
            if self.connections.send(&session_id, notice)? {
                notified.push(session_id);
            }
        }

        if !notified.is_empty() {
            tracing::info!(
                user_id = %user_id,
                sessions = notified.len(),
                deadline = %deadline,
                reason,
                "rekey required notices sent"
            );
        }
        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailproto_crypto::key::AuthKey;
    use tailproto_crypto::secrets::SealingKeys;
    use tailproto_storage::kv::MemoryKvStore;
    use tailproto_types::config::ProtoConfig;
    use tailproto_types::TailProtoError;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_millis(1_700_000_000_000 + secs * 1000)
    }

    fn setup() -> (Arc<SessionStore>, Arc<ConnectionRegistry>, RekeyFanout) {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryKvStore::new()),
            SealingKeys::new([1u8; 32], [2u8; 32]),
            &ProtoConfig::default(),
        ));
        let connections = Arc::new(ConnectionRegistry::new());
        let fanout = RekeyFanout::new(store.clone(), connections.clone());
        (store, connections, fanout)
    }

    #[test]
    fn only_connected_sessions_are_notified() -> std::result::Result<(), TailProtoError> {
        let (store, connections, fanout) = setup();
        let alice = UserId::new("alice");
        let online = SessionId::new("online");
        let offline = SessionId::new("offline");
        store.create(online.clone(), Some(alice.clone()), AuthKey::from_bytes([3; 32]), 1, ts(0))?;
        store.create(offline.clone(), Some(alice.clone()), AuthKey::from_bytes([4; 32]), 1, ts(0))?;
        let mut rx = connections.register(online.clone())?;

        let notified = fanout.notify_user(&alice, ts(120), "key_expired")?;
        assert_eq!(notified, vec![online.clone()]);
        assert_eq!(store.require(&online)?.rekey_deadline, Some(ts(120)));
        assert_eq!(store.require(&offline)?.rekey_deadline, None);

        let raw = rx.try_recv().map_err(|e| TailProtoError::ProtocolError {
            reason: e.to_string(),
        })?;
        match Frame::from_bytes(&raw)? {
            Frame::RekeyRequired(notice) => {
                assert_eq!(notice.reason, "key_expired");
                assert_eq!(notice.deadline, Some(ts(120).as_millis()));
            }
            other => panic!("unexpected frame {}", other.type_tag()),
        }
        Ok(())
    }

    #[test]
    fn earlier_deadline_is_kept() -> std::result::Result<(), TailProtoError> {
        let (store, connections, fanout) = setup();
        let alice = UserId::new("alice");
        let sid = SessionId::new("s");
        store.create(sid.clone(), Some(alice.clone()), AuthKey::from_bytes([3; 32]), 1, ts(0))?;
        let _rx = connections.register(sid.clone())?;

        fanout.notify_user(&alice, ts(100), "key_expired")?;
        fanout.notify_user(&alice, ts(200), "key_expired")?;
        assert_eq!(store.require(&sid)?.rekey_deadline, Some(ts(100)));
        Ok(())
    }
}
