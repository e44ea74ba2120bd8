//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access denied")]
    MediaAccessDenied,

    #[error("failed to persist call session: {0}")]
    SessionCreate(String),

    #[error("signal send failed: {0}")]
    SignalSend(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("call not answered")]
    NoAnswer,

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::negotiation::InvalidTransition),

    #[error("session already ended: {0}")]
    SessionEnded(String),

    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("parse error: {0}")]
    Parse(String),
}
