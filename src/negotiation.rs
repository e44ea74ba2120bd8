//! Peer negotiation state machine.
//!
//! One [`NegotiationDriver`] exists per call, per side. It owns the peer
//! connection and the local media stream, translates local events into
//! outbound signaling messages, and applies inbound messages to the peer
//! connection in a valid order. The relay guarantees no ordering across
//! message kinds, so candidates arriving before the remote description
//! are buffered here and drained once it is set.
//!
//! Glare is avoided by construction: the offer role belongs exclusively
//! to whichever side created the session record. The callee never offers.

use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::media::{LocalMediaStream, MediaConstraints, MediaDevices};
use crate::peer::{ConnectionState, IceCandidate, PeerConnection, PeerEvent, RemoteTrack,
    SdpType, SessionDescription};
use crate::relay::{SignalKind, SignalRelay, SignalingMessage};
use crate::types::{EndReason, SessionId, UserId};

/// Which side of the negotiation this driver plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Driver state. `Failed` is terminal and reachable from any non-closed
/// state; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    MediaReady,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
    Failed(EndReason),
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Attempted operation did not fit the driver's current state.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Events the driver reports up to the lifecycle manager.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// The peer link is up; the session should become active.
    Connected,
    /// The peer closed the link.
    Closed,
    /// Negotiation failed; the session should end with this reason.
    Failed(EndReason),
    /// A remote media track arrived.
    RemoteTrack(RemoteTrack),
}

struct DriverInner {
    state: NegotiationState,
    remote_described: bool,
    /// Candidates received before the remote description existed.
    /// Applying a candidate without a remote description is invalid, so
    /// they wait here and drain in arrival order.
    pending_candidates: VecDeque<IceCandidate>,
    /// Candidates already applied; duplicate delivery is a no-op. Keyed
    /// on the whole candidate: the same candidate string may legitimately
    /// appear once per media line.
    applied_candidates: HashSet<IceCandidate>,
    local_stream: Option<Arc<LocalMediaStream>>,
}

/// Drives one call's offer/answer/candidate exchange.
pub struct NegotiationDriver {
    session_id: SessionId,
    local_user: UserId,
    remote_user: UserId,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    relay: Arc<dyn SignalRelay>,
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    events: mpsc::UnboundedSender<DriverEvent>,
    // Single lock serializes every operation and inbound event, so the
    // correctness hazards are reduced to message ordering, which the
    // buffer handles.
    inner: Mutex<DriverInner>,
}

impl NegotiationDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        local_user: UserId,
        remote_user: UserId,
        role: Role,
        peer: Arc<dyn PeerConnection>,
        relay: Arc<dyn SignalRelay>,
        devices: Arc<dyn MediaDevices>,
        constraints: MediaConstraints,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            local_user,
            remote_user,
            role,
            peer,
            relay,
            devices,
            constraints,
            events,
            inner: Mutex::new(DriverInner {
                state: NegotiationState::Idle,
                remote_described: false,
                pending_candidates: VecDeque::new(),
                applied_candidates: HashSet::new(),
                local_stream: None,
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    pub async fn local_stream(&self) -> Option<Arc<LocalMediaStream>> {
        self.inner.lock().await.local_stream.clone()
    }

    /// Consume the peer connection's event stream on a background task.
    pub fn spawn_peer_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut events = self.peer.take_events()?;
        let driver = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::IceCandidate(candidate) => {
                        driver.send_local_candidate(candidate).await;
                    }
                    PeerEvent::ConnectionState(state) => {
                        driver.handle_connection_state(state).await;
                    }
                    PeerEvent::RemoteTrack(track) => {
                        let _ = driver.events.send(DriverEvent::RemoteTrack(track));
                    }
                }
            }
        }))
    }

    /// Request camera + microphone. Idempotent: repeated calls return the
    /// existing stream. Denial fails the negotiation.
    pub async fn acquire_local_media(&self) -> Result<Arc<LocalMediaStream>, CallError> {
        {
            let inner = self.inner.lock().await;
            if let Some(stream) = &inner.local_stream {
                return Ok(stream.clone());
            }
            if inner.state.is_terminal() {
                return Err(CallError::SessionEnded(self.session_id.to_string()));
            }
        }

        // The lock is not held across the device request; an inbound
        // event or a close may land while it is pending.
        let acquired = self.devices.acquire(self.constraints).await;

        let mut inner = self.inner.lock().await;
        match acquired {
            Err(e) => {
                warn!(
                    "Media acquisition failed for call {}: {}",
                    self.session_id, e
                );
                self.fail(&mut inner, EndReason::MediaDenied).await;
                Err(CallError::MediaAccessDenied)
            }
            Ok(stream) => {
                if inner.state.is_terminal() {
                    // The call ended while the request was pending.
                    stream.release();
                    return Err(CallError::SessionEnded(self.session_id.to_string()));
                }
                self.peer
                    .attach_local_stream(stream.clone())
                    .await
                    .map_err(|e| CallError::Negotiation(e.to_string()))?;
                inner.local_stream = Some(stream.clone());
                if inner.state == NegotiationState::Idle {
                    inner.state = NegotiationState::MediaReady;
                }
                debug!("Local media ready for call {}", self.session_id);
                Ok(stream)
            }
        }
    }

    /// Generate and send the offer. Caller role only.
    pub async fn create_offer(&self) -> Result<(), CallError> {
        if self.role != Role::Caller {
            return Err(CallError::Negotiation(
                "only the session creator may send an offer".into(),
            ));
        }

        let mut inner = self.inner.lock().await;
        if inner.state != NegotiationState::MediaReady {
            return Err(self.invalid(&inner, "CreateOffer"));
        }

        let offer = match self.describe_local(SdpType::Offer).await {
            Ok(desc) => desc,
            Err(e) => {
                self.fail(&mut inner, EndReason::NegotiationFailed).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .send_signal(SignalKind::Offer, offer.to_payload())
            .await
        {
            // A failed offer is fatal to this negotiation attempt.
            self.fail(&mut inner, EndReason::NegotiationFailed).await;
            return Err(e);
        }

        inner.state = NegotiationState::OfferSent;
        info!(
            "Sent offer for call {} to {}",
            self.session_id, self.remote_user
        );
        Ok(())
    }

    /// Route one inbound signaling message. Messages that do not fit the
    /// local role are logged and dropped rather than treated as fatal.
    pub async fn handle_signal(&self, message: SignalingMessage) -> Result<(), CallError> {
        match message.kind {
            SignalKind::Offer => {
                if self.role == Role::Caller {
                    warn!(
                        "Ignoring offer from {} for call {}: this side is the caller",
                        message.from, self.session_id
                    );
                    return Ok(());
                }
                self.handle_inbound_offer(&message.payload).await
            }
            SignalKind::Answer => {
                if self.role == Role::Callee {
                    warn!(
                        "Ignoring answer from {} for call {}: this side is the callee",
                        message.from, self.session_id
                    );
                    return Ok(());
                }
                self.handle_inbound_answer(&message.payload).await
            }
            SignalKind::IceCandidate => self.handle_inbound_candidate(&message.payload).await,
        }
    }

    /// Apply an inbound offer, send the answer, then drain any buffered
    /// candidates. Callee role only; requires local media.
    pub async fn handle_inbound_offer(
        &self,
        payload: &serde_json::Value,
    ) -> Result<(), CallError> {
        let offer = SessionDescription::from_payload(payload)?;

        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            debug!("Dropping offer for closed call {}", self.session_id);
            return Ok(());
        }
        if inner.state != NegotiationState::MediaReady {
            return Err(self.invalid(&inner, "HandleOffer"));
        }

        if let Err(e) = self.peer.set_remote_description(offer).await {
            self.fail(&mut inner, EndReason::NegotiationFailed).await;
            return Err(CallError::Negotiation(e.to_string()));
        }
        inner.remote_described = true;
        inner.state = NegotiationState::OfferReceived;

        let answer = match self.describe_local(SdpType::Answer).await {
            Ok(desc) => desc,
            Err(e) => {
                self.fail(&mut inner, EndReason::NegotiationFailed).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .send_signal(SignalKind::Answer, answer.to_payload())
            .await
        {
            // A failed answer is fatal, like a failed offer.
            self.fail(&mut inner, EndReason::NegotiationFailed).await;
            return Err(e);
        }

        inner.state = NegotiationState::AnswerExchanged;
        info!(
            "Answered offer for call {} from {}",
            self.session_id, self.remote_user
        );

        self.drain_candidates(&mut inner).await;
        Ok(())
    }

    /// Apply an inbound answer, then drain buffered candidates. Caller
    /// role only.
    pub async fn handle_inbound_answer(
        &self,
        payload: &serde_json::Value,
    ) -> Result<(), CallError> {
        let answer = SessionDescription::from_payload(payload)?;

        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            debug!("Dropping answer for closed call {}", self.session_id);
            return Ok(());
        }
        if inner.state != NegotiationState::OfferSent {
            return Err(self.invalid(&inner, "HandleAnswer"));
        }

        if let Err(e) = self.peer.set_remote_description(answer).await {
            self.fail(&mut inner, EndReason::NegotiationFailed).await;
            return Err(CallError::Negotiation(e.to_string()));
        }
        inner.remote_described = true;
        inner.state = NegotiationState::AnswerExchanged;
        debug!("Answer applied for call {}", self.session_id);

        self.drain_candidates(&mut inner).await;
        Ok(())
    }

    /// Apply a candidate immediately when the remote description exists,
    /// otherwise buffer it. Duplicates are no-ops, never errors.
    pub async fn handle_inbound_candidate(
        &self,
        payload: &serde_json::Value,
    ) -> Result<(), CallError> {
        let candidate = IceCandidate::from_payload(payload)?;

        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            debug!("Dropping candidate for closed call {}", self.session_id);
            return Ok(());
        }

        if inner.remote_described {
            self.apply_candidate(&mut inner, candidate).await;
        } else {
            debug!(
                "Buffering early candidate for call {} ({} pending)",
                self.session_id,
                inner.pending_candidates.len() + 1
            );
            inner.pending_candidates.push_back(candidate);
        }
        Ok(())
    }

    /// Map a transport connectivity change onto the driver state and
    /// report it up.
    pub async fn handle_connection_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return;
        }
        match state {
            ConnectionState::New | ConnectionState::Connecting => {
                debug!("Call {} transport {:?}", self.session_id, state);
            }
            ConnectionState::Connected => {
                inner.state = NegotiationState::Connected;
                info!("Call {} peer link connected", self.session_id);
                let _ = self.events.send(DriverEvent::Connected);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                warn!("Call {} transport {:?}", self.session_id, state);
                self.fail(&mut inner, EndReason::NegotiationFailed).await;
            }
            ConnectionState::Closed => {
                inner.state = NegotiationState::Closed;
                self.release(&mut inner).await;
                let _ = self.events.send(DriverEvent::Closed);
            }
        }
    }

    /// Tear down: release media tracks, close the peer connection, clear
    /// the buffer. Safe to call any number of times.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_terminal() {
            inner.state = NegotiationState::Closed;
        }
        self.release(&mut inner).await;
        debug!("Negotiation driver closed for call {}", self.session_id);
    }

    // -- internals ----------------------------------------------------

    /// Generate a local description, store it on the peer connection.
    async fn describe_local(&self, kind: SdpType) -> Result<SessionDescription, CallError> {
        let desc = match kind {
            SdpType::Offer => self.peer.create_offer().await,
            SdpType::Answer => self.peer.create_answer().await,
        }
        .map_err(|e| CallError::Negotiation(e.to_string()))?;

        self.peer
            .set_local_description(desc.clone())
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        Ok(desc)
    }

    async fn send_signal(
        &self,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), CallError> {
        let message = SignalingMessage::new(
            self.session_id.clone(),
            self.local_user.clone(),
            self.remote_user.clone(),
            kind,
            payload,
        );
        self.relay
            .send(message)
            .await
            .map_err(|e| CallError::SignalSend(e.to_string()))
    }

    /// Publish a locally gathered candidate. Candidate send failures are
    /// transient and never abort the negotiation.
    async fn send_local_candidate(&self, candidate: IceCandidate) {
        if self.inner.lock().await.state.is_terminal() {
            return;
        }
        if let Err(e) = self
            .send_signal(SignalKind::IceCandidate, candidate.to_payload())
            .await
        {
            warn!(
                "Failed to send candidate for call {}: {}",
                self.session_id, e
            );
        }
    }

    async fn apply_candidate(&self, inner: &mut DriverInner, candidate: IceCandidate) {
        if inner.applied_candidates.contains(&candidate) {
            debug!(
                "Duplicate candidate for call {}, already applied",
                self.session_id
            );
            return;
        }
        match self.peer.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {
                inner.applied_candidates.insert(candidate);
            }
            Err(e) => {
                // A single bad candidate is not fatal; others may connect.
                warn!(
                    "Failed to apply candidate for call {}: {}",
                    self.session_id, e
                );
            }
        }
    }

    /// Apply everything buffered before the remote description existed,
    /// in arrival order.
    async fn drain_candidates(&self, inner: &mut DriverInner) {
        let count = inner.pending_candidates.len();
        if count > 0 {
            debug!(
                "Draining {} buffered candidate(s) for call {}",
                count, self.session_id
            );
        }
        while let Some(candidate) = inner.pending_candidates.pop_front() {
            self.apply_candidate(inner, candidate).await;
        }
    }

    async fn fail(&self, inner: &mut DriverInner, reason: EndReason) {
        if inner.state.is_terminal() {
            return;
        }
        inner.state = NegotiationState::Failed(reason);
        self.release(inner).await;
        let _ = self.events.send(DriverEvent::Failed(reason));
    }

    async fn release(&self, inner: &mut DriverInner) {
        if let Some(stream) = &inner.local_stream {
            stream.release();
        }
        inner.pending_candidates.clear();
        self.peer.close().await;
    }

    fn invalid(&self, inner: &DriverInner, attempted: &str) -> CallError {
        CallError::InvalidTransition(InvalidTransition {
            current_state: format!("{:?}", inner.state),
            attempted: attempted.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::InProcessRelay;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeDevices, FakePeer};

    struct Fixture {
        driver: Arc<NegotiationDriver>,
        peer: Arc<FakePeer>,
        events: mpsc::UnboundedReceiver<DriverEvent>,
    }

    fn make_driver(role: Role, devices: Arc<FakeDevices>) -> Fixture {
        let store = MemoryStore::new();
        let relay = InProcessRelay::new(store);
        let peer = FakePeer::new("local");
        let (tx, events) = mpsc::unbounded_channel();
        let driver = NegotiationDriver::new(
            SessionId::new("NEGOTIATION1"),
            "u1".into(),
            "u2".into(),
            role,
            peer.clone(),
            relay,
            devices,
            MediaConstraints::default(),
            tx,
        );
        Fixture {
            driver,
            peer,
            events,
        }
    }

    fn candidate(n: u32) -> serde_json::Value {
        IceCandidate::new(format!(
            "candidate:{n} 1 UDP 2130706431 192.168.1.{n} 8888 typ host"
        ))
        .to_payload()
    }

    #[tokio::test]
    async fn test_acquire_media_is_idempotent() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        let first = fx.driver.acquire_local_media().await.unwrap();
        let second = fx.driver.acquire_local_media().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.driver.state().await, NegotiationState::MediaReady);
    }

    #[tokio::test]
    async fn test_media_denied_fails_negotiation() {
        let mut fx = make_driver(Role::Caller, FakeDevices::denying());
        let err = fx.driver.acquire_local_media().await.unwrap_err();
        assert!(matches!(err, CallError::MediaAccessDenied));
        assert_eq!(
            fx.driver.state().await,
            NegotiationState::Failed(EndReason::MediaDenied)
        );
        assert!(matches!(
            fx.events.recv().await,
            Some(DriverEvent::Failed(EndReason::MediaDenied))
        ));
    }

    #[tokio::test]
    async fn test_only_caller_may_offer() {
        let fx = make_driver(Role::Callee, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();
        assert!(matches!(
            fx.driver.create_offer().await,
            Err(CallError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_requires_media() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        assert!(matches!(
            fx.driver.create_offer().await,
            Err(CallError::InvalidTransition(_))
        ));
    }

    /// Candidates arriving before the answer are buffered, then applied
    /// in arrival order once the remote description is set.
    #[tokio::test]
    async fn test_early_candidates_are_buffered_then_drained() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();
        fx.driver.create_offer().await.unwrap();

        for n in 1..=3 {
            fx.driver.handle_inbound_candidate(&candidate(n)).await.unwrap();
        }
        assert!(fx.peer.applied_candidates.lock().unwrap().is_empty());

        let answer = SessionDescription::answer("sdp-answer-remote").to_payload();
        fx.driver.handle_inbound_answer(&answer).await.unwrap();

        let applied = fx.peer.applied_candidates.lock().unwrap().clone();
        assert_eq!(applied.len(), 3);
        for (i, c) in applied.iter().enumerate() {
            assert!(c.candidate.starts_with(&format!("candidate:{}", i + 1)));
        }
        assert_eq!(fx.driver.state().await, NegotiationState::AnswerExchanged);
    }

    /// A duplicate candidate is applied exactly once and is not an error.
    #[tokio::test]
    async fn test_duplicate_candidate_is_idempotent() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();
        fx.driver.create_offer().await.unwrap();
        fx.driver
            .handle_inbound_answer(&SessionDescription::answer("sdp").to_payload())
            .await
            .unwrap();

        fx.driver.handle_inbound_candidate(&candidate(1)).await.unwrap();
        fx.driver.handle_inbound_candidate(&candidate(1)).await.unwrap();

        assert_eq!(fx.peer.applied_candidates.lock().unwrap().len(), 1);
    }

    /// The same candidate string on different media lines names distinct
    /// candidates; both must be applied.
    #[tokio::test]
    async fn test_same_string_on_different_media_lines_both_apply() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();
        fx.driver.create_offer().await.unwrap();
        fx.driver
            .handle_inbound_answer(&SessionDescription::answer("sdp").to_payload())
            .await
            .unwrap();

        let base = "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host";
        let audio = IceCandidate::new(base).with_sdp_mid("0").to_payload();
        let video = IceCandidate::new(base).with_sdp_mid("1").to_payload();
        fx.driver.handle_inbound_candidate(&audio).await.unwrap();
        fx.driver.handle_inbound_candidate(&video).await.unwrap();

        assert_eq!(fx.peer.applied_candidates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_callee_answers_inbound_offer() {
        let fx = make_driver(Role::Callee, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();

        // Candidate arrives before the offer: buffered
        fx.driver.handle_inbound_candidate(&candidate(7)).await.unwrap();

        let offer = SessionDescription::offer("sdp-offer-remote").to_payload();
        fx.driver.handle_inbound_offer(&offer).await.unwrap();

        assert_eq!(fx.driver.state().await, NegotiationState::AnswerExchanged);
        assert_eq!(
            fx.peer.remote_desc.lock().unwrap().as_ref().unwrap().kind,
            SdpType::Offer
        );
        assert_eq!(
            fx.peer.local_desc.lock().unwrap().as_ref().unwrap().kind,
            SdpType::Answer
        );
        // Buffered candidate drained after the answer
        assert_eq!(fx.peer.applied_candidates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_state_mapping() {
        let mut fx = make_driver(Role::Caller, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();
        fx.driver.create_offer().await.unwrap();
        fx.driver
            .handle_inbound_answer(&SessionDescription::answer("sdp").to_payload())
            .await
            .unwrap();

        fx.driver
            .handle_connection_state(ConnectionState::Connecting)
            .await;
        assert_eq!(fx.driver.state().await, NegotiationState::AnswerExchanged);

        fx.driver
            .handle_connection_state(ConnectionState::Connected)
            .await;
        assert_eq!(fx.driver.state().await, NegotiationState::Connected);
        assert!(matches!(fx.events.recv().await, Some(DriverEvent::Connected)));

        fx.driver
            .handle_connection_state(ConnectionState::Failed)
            .await;
        assert_eq!(
            fx.driver.state().await,
            NegotiationState::Failed(EndReason::NegotiationFailed)
        );
        assert!(matches!(
            fx.events.recv().await,
            Some(DriverEvent::Failed(EndReason::NegotiationFailed))
        ));
    }

    /// close() releases media and the peer connection, any number of
    /// times, without further side effects.
    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        let stream = fx.driver.acquire_local_media().await.unwrap();
        assert!(stream.is_live());

        fx.driver.close().await;
        assert_eq!(fx.driver.state().await, NegotiationState::Closed);
        assert!(!stream.is_live());
        assert!(fx.peer.closed.load(std::sync::atomic::Ordering::SeqCst));

        fx.driver.close().await;
        fx.driver.close().await;
        assert_eq!(fx.driver.state().await, NegotiationState::Closed);
    }

    /// Inbound messages after teardown are dropped, not applied.
    #[tokio::test]
    async fn test_stale_messages_after_close_are_dropped() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        fx.driver.acquire_local_media().await.unwrap();
        fx.driver.close().await;

        fx.driver
            .handle_inbound_answer(&SessionDescription::answer("sdp").to_payload())
            .await
            .unwrap();
        fx.driver.handle_inbound_candidate(&candidate(1)).await.unwrap();
        fx.driver
            .handle_connection_state(ConnectionState::Connected)
            .await;

        assert_eq!(fx.driver.state().await, NegotiationState::Closed);
        assert!(fx.peer.applied_candidates.lock().unwrap().is_empty());
        assert!(fx.peer.remote_desc.lock().unwrap().is_none());
    }

    /// Acquisition attempts after teardown are rejected.
    #[tokio::test]
    async fn test_media_after_close_is_rejected() {
        let fx = make_driver(Role::Caller, FakeDevices::new());
        fx.driver.close().await;

        let err = fx.driver.acquire_local_media().await.unwrap_err();
        assert!(matches!(err, CallError::SessionEnded(_)));
        assert!(fx.driver.local_stream().await.is_none());
    }
}
