//! Session persistence.
//!
//! The session store holds the durable [`CallSession`] records and the
//! append-only signaling audit log, partitioned by session id. Only the
//! call manager writes session status.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::CallError;
use crate::relay::SignalingMessage;
use crate::types::{CallSession, EndReason, SessionId};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session record. Fails with [`CallError::SessionCreate`]
    /// when the backend write fails.
    async fn create_session(&self, session: CallSession) -> Result<(), CallError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<CallSession>, CallError>;

    /// Transition the session to active. Rejected once the session has
    /// ended (terminal invariant).
    async fn mark_active(&self, id: &SessionId) -> Result<CallSession, CallError>;

    /// Transition the session to ended. Idempotent: marking an already
    /// ended session returns it unchanged.
    async fn mark_ended(&self, id: &SessionId, reason: EndReason) -> Result<CallSession, CallError>;

    /// Append a signaling message to the session's audit log.
    async fn append_signal(&self, message: &SignalingMessage) -> Result<(), CallError>;

    /// The audit log for a session, in append order.
    async fn signal_log(&self, id: &SessionId) -> Result<Vec<SignalingMessage>, CallError>;
}

/// In-memory store backing the in-process relay and the tests.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, CallSession>>,
    signals: RwLock<HashMap<String, Vec<SignalingMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of every stored session, in no particular order.
    pub async fn sessions(&self) -> Vec<CallSession> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: CallSession) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.session_id.as_str()) {
            return Err(CallError::SessionCreate(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        sessions.insert(session.session_id.to_string(), session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<CallSession>, CallError> {
        Ok(self.sessions.read().await.get(id.as_str()).cloned())
    }

    async fn mark_active(&self, id: &SessionId) -> Result<CallSession, CallError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id.as_str())
            .ok_or_else(|| CallError::NotFound(id.to_string()))?;
        session.set_active()?;
        Ok(session.clone())
    }

    async fn mark_ended(&self, id: &SessionId, reason: EndReason) -> Result<CallSession, CallError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id.as_str())
            .ok_or_else(|| CallError::NotFound(id.to_string()))?;
        session.set_ended(reason);
        Ok(session.clone())
    }

    async fn append_signal(&self, message: &SignalingMessage) -> Result<(), CallError> {
        self.signals
            .write()
            .await
            .entry(message.session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn signal_log(&self, id: &SessionId) -> Result<Vec<SignalingMessage>, CallError> {
        Ok(self
            .signals
            .read()
            .await
            .get(id.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallStatus;

    async fn seeded_store() -> (Arc<MemoryStore>, SessionId) {
        let store = MemoryStore::new();
        let session = CallSession::new("u1".into(), "u2".into()).unwrap();
        let id = session.session_id.clone();
        store.create_session(session).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let (store, id) = seeded_store().await;
        let mut dup = CallSession::new("u1".into(), "u2".into()).unwrap();
        dup.session_id = id;
        assert!(matches!(
            store.create_session(dup).await,
            Err(CallError::SessionCreate(_))
        ));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (store, id) = seeded_store().await;

        let session = store.mark_active(&id).await.unwrap();
        assert_eq!(session.status, CallStatus::Active);

        let session = store.mark_ended(&id, EndReason::Hangup).await.unwrap();
        assert_eq!(session.status, CallStatus::Ended);
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_ended_session_is_terminal() {
        let (store, id) = seeded_store().await;
        store.mark_ended(&id, EndReason::Declined).await.unwrap();

        // Active write after end is rejected
        assert!(matches!(
            store.mark_active(&id).await,
            Err(CallError::SessionEnded(_))
        ));

        // Second end is a no-op, original reason kept
        let session = store.mark_ended(&id, EndReason::Hangup).await.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::Declined));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = MemoryStore::new();
        let id = SessionId::new("MISSING");
        assert!(store.get_session(&id).await.unwrap().is_none());
        assert!(matches!(
            store.mark_active(&id).await,
            Err(CallError::NotFound(_))
        ));
    }
}
