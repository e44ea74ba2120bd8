//! Peer connection abstraction.
//!
//! The negotiation driver owns one [`PeerConnection`] per call and drives
//! it through the offer/answer/candidate exchange. The trait seam keeps
//! the driver testable: tests plug in a scripted connection and feed it
//! synthetic [`PeerEvent`]s instead of a real transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::media::{LocalMediaStream, TrackKind};

/// Which half of a description exchange a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description produced or consumed by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Encode for an opaque signaling payload.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, CallError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| CallError::Parse(format!("bad session description: {e}")))
    }
}

/// A connectivity option proposed by one side (RFC 5245).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    /// SDP media stream identification (e.g., "0" for audio)
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_m_line_index: Option<u16>,
    /// Username fragment for ICE
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, CallError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| CallError::Parse(format!("bad ice candidate: {e}")))
    }
}

/// Connectivity state reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media track received from the remote peer.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Events emitted by a peer connection, consumed by the negotiation
/// driver as a single ordered stream.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

/// One peer connection, exclusively owned by a single call's driver and
/// never reused across calls.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    async fn attach_local_stream(&self, stream: Arc<LocalMediaStream>) -> Result<(), CallError>;

    /// Take the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Close the connection, releasing transport resources. Idempotent.
    async fn close(&self);
}

/// Constructs a fresh [`PeerConnection`] per call.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn PeerConnection>, CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_payload_roundtrip() {
        let desc = SessionDescription::offer("v=0 test-sdp");
        let payload = desc.to_payload();
        assert_eq!(payload["type"], "offer");
        let back = SessionDescription::from_payload(&payload).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_candidate_payload_roundtrip() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment("abc123");
        let back = IceCandidate::from_payload(&candidate.to_payload()).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_bad_payload_is_parse_error() {
        let payload = serde_json::json!({"nonsense": true});
        assert!(matches!(
            SessionDescription::from_payload(&payload),
            Err(CallError::Parse(_))
        ));
    }
}
