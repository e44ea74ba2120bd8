//! Shared fakes for driving the call stack with synthetic events.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::media::{LocalMediaStream, MediaConstraints, MediaDevices};
use crate::peer::{
    ConnectionState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent,
    SessionDescription,
};

/// Device layer that either hands out a fresh stream or denies access.
pub struct FakeDevices {
    pub deny: AtomicBool,
    pub acquired: Mutex<Vec<Arc<LocalMediaStream>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: AtomicBool::new(false),
            acquired: Mutex::new(Vec::new()),
        })
    }

    pub fn denying() -> Arc<Self> {
        let devices = Self::new();
        devices.deny.store(true, Ordering::SeqCst);
        devices
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<LocalMediaStream>, CallError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccessDenied);
        }
        let stream = Arc::new(LocalMediaStream::new(constraints));
        self.acquired.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// Scripted peer connection. Tests inspect what the driver did to it and
/// push [`PeerEvent`]s through [`FakePeer::emit`] to simulate transport
/// activity.
pub struct FakePeer {
    label: String,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    pub local_desc: Mutex<Option<SessionDescription>>,
    pub remote_desc: Mutex<Option<SessionDescription>>,
    pub applied_candidates: Mutex<Vec<IceCandidate>>,
    pub attached_stream: Mutex<Option<Arc<LocalMediaStream>>>,
    pub closed: AtomicBool,
    pub fail_offer: AtomicBool,
    pub fail_answer: AtomicBool,
}

impl FakePeer {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            local_desc: Mutex::new(None),
            remote_desc: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            attached_stream: Mutex::new(None),
            closed: AtomicBool::new(false),
            fail_offer: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
        })
    }

    /// Push a synthetic transport event into the driver's pump.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn emit_connected(&self) {
        self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("scripted offer failure".into()));
        }
        Ok(SessionDescription::offer(format!("sdp-offer-{}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("scripted answer failure".into()));
        }
        Ok(SessionDescription::answer(format!(
            "sdp-answer-{}",
            self.label
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        *self.local_desc.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        *self.remote_desc.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.applied_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn attach_local_stream(&self, stream: Arc<LocalMediaStream>) -> Result<(), CallError> {
        *self.attached_stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory keeping handles to every connection it created, so tests can
/// script either side of a call.
#[derive(Default)]
pub struct FakePeerFactory {
    pub label: String,
    pub created: Mutex<Vec<Arc<FakePeer>>>,
    pub fail_offer: AtomicBool,
    pub fail_create: AtomicBool,
}

impl FakePeerFactory {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            ..Default::default()
        })
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created
            .lock()
            .unwrap()
            .last()
            .expect("no peer connection created yet")
            .clone()
    }
}

impl PeerConnectionFactory for FakePeerFactory {
    fn create(&self) -> Result<Arc<dyn PeerConnection>, CallError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("scripted create failure".into()));
        }
        let peer = FakePeer::new(self.label.clone());
        peer.fail_offer
            .store(self.fail_offer.load(Ordering::SeqCst), Ordering::SeqCst);
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}
