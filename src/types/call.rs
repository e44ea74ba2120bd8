//! Core call session types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Opaque identifier of a marketplace user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random session id (32 uppercase hex chars).
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        let mut id = String::with_capacity(32);
        for b in bytes {
            id.push_str(&format!("{:02X}", b));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

/// Why a call session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Either party hung up.
    Hangup,
    /// Callee declined before answering.
    Declined,
    /// Ring timeout elapsed without an answer.
    NoAnswer,
    /// The peer connection failed or disconnected.
    NegotiationFailed,
    /// Local device permission was refused.
    MediaDenied,
}

/// Persisted record of one call attempt between two users.
///
/// Mutated only through [`CallSession::set_active`] and
/// [`CallSession::set_ended`]; `Ended` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    /// Create a new ringing session. Fails if caller and callee are the
    /// same user.
    pub fn new(caller_id: UserId, callee_id: UserId) -> Result<Self, CallError> {
        if caller_id == callee_id {
            return Err(CallError::InvalidPeer(format!(
                "caller and callee are the same user: {}",
                caller_id
            )));
        }
        Ok(Self {
            session_id: SessionId::generate(),
            caller_id,
            callee_id,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        })
    }

    pub fn is_ended(&self) -> bool {
        self.status == CallStatus::Ended
    }

    /// The remote party from `local`'s point of view.
    pub fn remote_of(&self, local: &UserId) -> &UserId {
        if &self.caller_id == local {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }

    /// Mark the session active. Rejected once the session has ended.
    pub fn set_active(&mut self) -> Result<(), CallError> {
        if self.is_ended() {
            return Err(CallError::SessionEnded(self.session_id.to_string()));
        }
        self.status = CallStatus::Active;
        Ok(())
    }

    /// Mark the session ended. A second call is a no-op and keeps the
    /// original reason and timestamp.
    pub fn set_ended(&mut self, reason: EndReason) {
        if self.is_ended() {
            return;
        }
        self.status = CallStatus::Ended;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
    }
}

/// Display data for the incoming-call UI, resolved from the marketplace
/// profile layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayProfile {
    pub name: String,
    pub avatar_url: Option<String>,
}
