//! Peer-to-peer call signaling and session lifecycle.
//!
//! This crate is the real-time calling core of the marketplace app: two
//! users establish a direct audio/video stream by exchanging offer,
//! answer and candidate messages through a signaling relay, while the
//! call session record tracks ring → active → ended.
//!
//! # Architecture
//!
//! - [`store::SessionStore`]: persisted [`types::CallSession`] records
//!   and the signaling audit log
//! - [`relay::SignalRelay`]: best-effort message bus keyed by session,
//!   addressed to a specific recipient
//! - [`negotiation::NegotiationDriver`]: per-call state machine owning
//!   the peer connection and the early-candidate buffer
//! - [`manager::CallManager`]: start/accept/decline/end orchestration,
//!   ring timeout, observable call state
//! - [`media`]: local camera/microphone acquisition and track toggling

pub mod error;
pub mod manager;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod relay;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::CallError;
pub use manager::{
    CallManager, CallManagerConfig, ConnectionPhase, NotificationHook, ProfileProvider,
};
pub use media::{LocalMediaStream, MediaConstraints, MediaDevices, MediaTrack, TrackKind};
pub use negotiation::{DriverEvent, InvalidTransition, NegotiationDriver, NegotiationState, Role};
pub use peer::{
    ConnectionState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrack,
    SdpType, SessionDescription,
};
pub use relay::{InProcessRelay, SignalKind, SignalRelay, SignalSubscription, SignalingMessage};
pub use store::{MemoryStore, SessionStore};
pub use types::{
    CallSession, CallStatus, DisplayProfile, EndReason, Event, EventBus, EventHandler,
    IncomingCall, SessionId, UserId,
};
