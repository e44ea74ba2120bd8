//! Call manager for orchestrating call lifecycle.
//!
//! The manager is the only component that writes `CallSession.status`.
//! The UI layer triggers [`CallManager::start_call`] / `accept_call` /
//! `decline_call` / `end_call` and observes the session through the
//! store, the event bus and the per-call watch channels; it never polls
//! the negotiation driver.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::media::{LocalMediaStream, MediaConstraints, MediaDevices};
use crate::negotiation::{DriverEvent, NegotiationDriver, NegotiationState, Role};
use crate::peer::{PeerConnectionFactory, RemoteTrack};
use crate::relay::{SignalKind, SignalRelay, SignalSubscription};
use crate::store::SessionStore;
use crate::types::{
    CallSession, CallStatus, DisplayProfile, EndReason, Event, EventBus, IncomingCall, SessionId,
    UserId,
};

/// A lost signal subscription is re-established this many times before
/// the pump gives up (best-effort, like the relay itself).
const RESUBSCRIBE_ATTEMPTS: u32 = 3;
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(250);

/// Marketplace profile lookup, consumed for the incoming-call UI.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn display_profile(&self, user: &UserId) -> Option<DisplayProfile>;
}

/// Out-of-band alerting hook, invoked when a session is created so a
/// callee without a live subscription can still be paged. Delivery is
/// entirely the notification subsystem's concern.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn call_created(&self, session: &CallSession);
}

/// Connection phase the UI renders for the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Ended,
    Failed,
}

/// Configuration for the call manager.
#[derive(Clone)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls allowed.
    pub max_concurrent_calls: usize,
    /// Upper bound on the ringing state before an un-answered call
    /// auto-ends with `NoAnswer`. Policy parameter, not a protocol
    /// constant.
    pub ring_timeout: Duration,
    /// Device constraints used when acquiring local media.
    pub media: MediaConstraints,
    /// Optional profile lookup for incoming-call events.
    pub profiles: Option<Arc<dyn ProfileProvider>>,
    /// Optional out-of-band notification hook.
    pub notifications: Option<Arc<dyn NotificationHook>>,
}

impl std::fmt::Debug for CallManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManagerConfig")
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("ring_timeout", &self.ring_timeout)
            .field("profiles", &self.profiles.is_some())
            .field("notifications", &self.notifications.is_some())
            .finish()
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            ring_timeout: Duration::from_secs(45),
            media: MediaConstraints::default(),
            profiles: None,
            notifications: None,
        }
    }
}

struct ActiveCall {
    session: CallSession,
    driver: Arc<NegotiationDriver>,
    phase_tx: watch::Sender<ConnectionPhase>,
    remote_tracks_tx: watch::Sender<Vec<RemoteTrack>>,
    ended: AtomicBool,
    /// Subscription buffered between `register_incoming_call` and
    /// `accept_call`; the inbound offer waits in here.
    pending_subscription: Mutex<Option<SignalSubscription>>,
    ring_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    pumps: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Orchestrates the end-to-end call flow: ring, offer/answer exchange
/// (delegated to the negotiation driver), connected, ended.
pub struct CallManager {
    local_user: UserId,
    config: CallManagerConfig,
    store: Arc<dyn SessionStore>,
    relay: Arc<dyn SignalRelay>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    event_bus: EventBus,
    calls: RwLock<HashMap<String, Arc<ActiveCall>>>,
}

impl CallManager {
    pub fn new(
        local_user: UserId,
        store: Arc<dyn SessionStore>,
        relay: Arc<dyn SignalRelay>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            config,
            store,
            relay,
            devices,
            peers,
            event_bus: EventBus::new(),
            calls: RwLock::new(HashMap::new()),
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Start an outgoing call. The session record is persisted and the
    /// subscription established before any signaling message is sent;
    /// device denial or a failed session write abort before the offer.
    pub async fn start_call(self: &Arc<Self>, callee: UserId) -> Result<SessionId, CallError> {
        if callee == self.local_user {
            return Err(CallError::InvalidPeer("cannot call yourself".into()));
        }

        self.cleanup_ended_calls().await;
        {
            let calls = self.calls.read().await;
            let live = calls
                .values()
                .filter(|c| !c.ended.load(Ordering::SeqCst))
                .count();
            if live >= self.config.max_concurrent_calls {
                return Err(CallError::AlreadyExists(
                    "max concurrent calls reached".into(),
                ));
            }
        }

        let session = CallSession::new(self.local_user.clone(), callee.clone())?;
        let session_id = session.session_id.clone();
        self.store.create_session(session.clone()).await?;

        // Subscribe before announcing intent to call, so the answer and
        // early candidates cannot be missed. From here on the persisted
        // record must never be left ringing on a failure path.
        let subscription = match self.relay.subscribe(&session_id, &self.local_user).await {
            Ok(sub) => sub,
            Err(e) => {
                self.abandon_session(&session_id).await;
                return Err(e);
            }
        };

        let call = match self
            .install_call(session.clone(), Role::Caller, ConnectionPhase::Connecting)
            .await
        {
            Ok(call) => call,
            Err(e) => {
                self.abandon_session(&session_id).await;
                return Err(e);
            }
        };
        self.spawn_signal_pump(&call, subscription);

        if let Err(e) = call.driver.acquire_local_media().await {
            self.finish(&session_id, EndReason::MediaDenied, Some(e.to_string()))
                .await;
            return Err(e);
        }
        if let Err(e) = call.driver.create_offer().await {
            self.finish(
                &session_id,
                EndReason::NegotiationFailed,
                Some(e.to_string()),
            )
            .await;
            return Err(e);
        }

        self.spawn_ring_timer(&call);

        if let Some(hook) = &self.config.notifications {
            hook.call_created(&session).await;
        }

        info!("Started call {} to {}", session_id, callee);
        Ok(session_id)
    }

    /// Register an incoming call observed through the session store (or
    /// the notification layer). Subscribes immediately so the offer and
    /// early candidates buffer until the user accepts or declines.
    pub async fn register_incoming_call(
        self: &Arc<Self>,
        session: CallSession,
    ) -> Result<(), CallError> {
        if session.callee_id != self.local_user {
            return Err(CallError::InvalidPeer(format!(
                "session {} is not addressed to {}",
                session.session_id, self.local_user
            )));
        }
        if session.is_ended() {
            return Err(CallError::SessionEnded(session.session_id.to_string()));
        }

        let session_id = session.session_id.clone();
        if self.store.get_session(&session_id).await?.is_none() {
            self.store.create_session(session.clone()).await?;
        }

        let subscription = self.relay.subscribe(&session_id, &self.local_user).await?;

        let call = self
            .install_call(session.clone(), Role::Callee, ConnectionPhase::Idle)
            .await?;
        *call.pending_subscription.lock().await = Some(subscription);

        self.spawn_ring_timer(&call);

        let caller_profile = match &self.config.profiles {
            Some(provider) => provider.display_profile(&session.caller_id).await,
            None => None,
        };
        self.event_bus.dispatch(&Event::IncomingCall(IncomingCall {
            session,
            caller_profile,
        }));

        info!("Registered incoming call {}", session_id);
        Ok(())
    }

    /// Accept a registered incoming call: acquire media, replay the
    /// signals already persisted for this session (the offer is usually
    /// published before the callee subscribes), then pump live messages.
    pub async fn accept_call(self: &Arc<Self>, session_id: &SessionId) -> Result<(), CallError> {
        let call = self
            .active_call(session_id)
            .await
            .ok_or_else(|| CallError::NotFound(session_id.to_string()))?;
        if call.ended.load(Ordering::SeqCst) {
            return Err(CallError::SessionEnded(session_id.to_string()));
        }

        let subscription = call
            .pending_subscription
            .lock()
            .await
            .take()
            .ok_or_else(|| CallError::Negotiation("call already accepted".into()))?;

        if let Err(e) = call.driver.acquire_local_media().await {
            self.finish(session_id, EndReason::MediaDenied, Some(e.to_string()))
                .await;
            return Err(e);
        }

        // An accepted call is answered; the no-answer timer no longer
        // applies, however long the transport takes to connect.
        if let Some(task) = call.ring_task.lock().expect("lock poisoned").take() {
            task.abort();
        }

        call.phase_tx.send_replace(ConnectionPhase::Connecting);

        // Signals published before the subscription existed are only in
        // the audit log. Feed those through first; anything delivered
        // twice is dropped or applied idempotently by the driver.
        let replay = self.store.signal_log(session_id).await?;
        for message in replay {
            if message.to != self.local_user {
                continue;
            }
            let kind = message.kind;
            if let Err(e) = call.driver.handle_signal(message).await {
                warn!(
                    "Error replaying {} signal for call {}: {}",
                    kind, session_id, e
                );
                if let crate::negotiation::NegotiationState::Failed(reason) =
                    call.driver.state().await
                {
                    self.finish(session_id, reason, Some(e.to_string())).await;
                    return Err(e);
                }
            }
        }

        self.spawn_signal_pump(&call, subscription);

        info!("Accepted call {}", session_id);
        Ok(())
    }

    /// Decline a ringing incoming call.
    pub async fn decline_call(self: &Arc<Self>, session_id: &SessionId) -> Result<(), CallError> {
        self.end_with(session_id, EndReason::Declined).await
    }

    /// End a call. Idempotent: ending an already ended call is a no-op.
    pub async fn end_call(self: &Arc<Self>, session_id: &SessionId) -> Result<(), CallError> {
        self.end_with(session_id, EndReason::Hangup).await
    }

    /// Flip local audio. Returns `true` when audio is now muted. A call
    /// without a local stream yet is left unchanged.
    pub async fn toggle_mute(&self, session_id: &SessionId) -> bool {
        match self.call_stream(session_id).await {
            Some(stream) => stream.toggle_mute(),
            None => false,
        }
    }

    /// Flip local video. Returns `true` when video is now off. A call
    /// without a local stream yet is left unchanged.
    pub async fn toggle_video(&self, session_id: &SessionId) -> bool {
        match self.call_stream(session_id).await {
            Some(stream) => stream.toggle_video(),
            None => false,
        }
    }

    /// Observe the connection phase for a call.
    pub async fn observe_phase(
        &self,
        session_id: &SessionId,
    ) -> Option<watch::Receiver<ConnectionPhase>> {
        Some(self.active_call(session_id).await?.phase_tx.subscribe())
    }

    /// Observe remote media tracks as they arrive.
    pub async fn observe_remote_tracks(
        &self,
        session_id: &SessionId,
    ) -> Option<watch::Receiver<Vec<RemoteTrack>>> {
        Some(
            self.active_call(session_id)
                .await?
                .remote_tracks_tx
                .subscribe(),
        )
    }

    /// The local media stream for a call, once acquired.
    pub async fn local_stream(&self, session_id: &SessionId) -> Option<Arc<LocalMediaStream>> {
        self.call_stream(session_id).await
    }

    /// Current session snapshot from the store.
    pub async fn session(&self, session_id: &SessionId) -> Result<Option<CallSession>, CallError> {
        self.store.get_session(session_id).await
    }

    /// Drop ended calls and their background tasks from memory.
    pub async fn cleanup_ended_calls(&self) {
        let mut calls = self.calls.write().await;
        calls.retain(|_, call| {
            let ended = call.ended.load(Ordering::SeqCst);
            if ended {
                if let Some(task) = call.ring_task.lock().expect("lock poisoned").take() {
                    task.abort();
                }
                for task in call.pumps.lock().expect("lock poisoned").drain(..) {
                    task.abort();
                }
            }
            !ended
        });
    }

    // -- internals ----------------------------------------------------

    async fn active_call(&self, session_id: &SessionId) -> Option<Arc<ActiveCall>> {
        self.calls.read().await.get(session_id.as_str()).cloned()
    }

    async fn call_stream(&self, session_id: &SessionId) -> Option<Arc<LocalMediaStream>> {
        self.active_call(session_id).await?.driver.local_stream().await
    }

    /// Build the driver and call bookkeeping for one session and spawn
    /// the driver-event pump.
    async fn install_call(
        self: &Arc<Self>,
        session: CallSession,
        role: Role,
        phase: ConnectionPhase,
    ) -> Result<Arc<ActiveCall>, CallError> {
        let peer = self.peers.create()?;
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();
        let remote = session.remote_of(&self.local_user).clone();

        let driver = NegotiationDriver::new(
            session.session_id.clone(),
            self.local_user.clone(),
            remote,
            role,
            peer,
            self.relay.clone(),
            self.devices.clone(),
            self.config.media,
            driver_tx,
        );

        let (phase_tx, _) = watch::channel(phase);
        let (remote_tracks_tx, _) = watch::channel(Vec::new());

        let call = Arc::new(ActiveCall {
            session: session.clone(),
            driver: driver.clone(),
            phase_tx,
            remote_tracks_tx,
            ended: AtomicBool::new(false),
            pending_subscription: Mutex::new(None),
            ring_task: std::sync::Mutex::new(None),
            pumps: std::sync::Mutex::new(Vec::new()),
        });

        let mut pumps = Vec::new();
        if let Some(pump) = driver.spawn_peer_pump() {
            pumps.push(pump);
        }
        pumps.push(self.spawn_driver_event_pump(&call, driver_rx));
        *call.pumps.lock().expect("lock poisoned") = pumps;

        self.calls
            .write()
            .await
            .insert(session.session_id.to_string(), call.clone());
        Ok(call)
    }

    /// Feed inbound signaling messages to the driver. Out-of-order
    /// messages the driver rejects are logged and dropped; a driver that
    /// has failed ends the session. A lost subscription is re-established
    /// with a bounded number of attempts while the call is live.
    fn spawn_signal_pump(self: &Arc<Self>, call: &Arc<ActiveCall>, sub: SignalSubscription) {
        let manager = Arc::clone(self);
        let call = Arc::clone(call);
        let session_id = call.session.session_id.clone();

        let task_call = Arc::clone(&call);
        let pump = tokio::spawn(async move {
            let call = task_call;
            let mut sub = sub;
            'pump: loop {
                while let Some(message) = sub.recv().await {
                    let kind = message.kind;
                    match call.driver.handle_signal(message).await {
                        Ok(()) => {
                            // The answer arrived: this call is no longer
                            // un-answered, however long connecting takes.
                            if kind == SignalKind::Answer {
                                if let Some(task) =
                                    call.ring_task.lock().expect("lock poisoned").take()
                                {
                                    task.abort();
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                "Error handling {} signal for call {}: {}",
                                kind, session_id, e
                            );
                            if let NegotiationState::Failed(reason) = call.driver.state().await {
                                manager
                                    .finish(&session_id, reason, Some(e.to_string()))
                                    .await;
                                break 'pump;
                            }
                        }
                    }
                }

                // Subscription lost. Re-establish it while the call lives.
                if call.ended.load(Ordering::SeqCst) {
                    break;
                }
                let mut attempts = 0u32;
                loop {
                    attempts += 1;
                    match manager
                        .relay
                        .subscribe(&session_id, &manager.local_user)
                        .await
                    {
                        Ok(next) => {
                            debug!(
                                "Resubscribed to call {} after {} attempt(s)",
                                session_id, attempts
                            );
                            sub = next;
                            continue 'pump;
                        }
                        Err(e) => {
                            warn!(
                                "Resubscribe to call {} failed (attempt {}): {}",
                                session_id, attempts, e
                            );
                            if attempts >= RESUBSCRIBE_ATTEMPTS {
                                break 'pump;
                            }
                            tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                        }
                    }
                }
            }
        });
        call.pumps.lock().expect("lock poisoned").push(pump);
    }

    /// Consume driver reports: connectivity transitions and remote
    /// tracks.
    fn spawn_driver_event_pump(
        self: &Arc<Self>,
        call: &Arc<ActiveCall>,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let call = Arc::clone(call);
        let session_id = call.session.session_id.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DriverEvent::Connected => {
                        match manager.store.mark_active(&session_id).await {
                            Ok(_) => {
                                call.phase_tx.send_replace(ConnectionPhase::Connected);
                                manager.event_bus.dispatch(&Event::CallStateChanged {
                                    session_id: session_id.clone(),
                                    status: CallStatus::Active,
                                });
                                if let Some(task) =
                                    call.ring_task.lock().expect("lock poisoned").take()
                                {
                                    task.abort();
                                }
                            }
                            Err(e) => {
                                // The session ended while connecting.
                                warn!(
                                    "Cannot activate session {}: {}",
                                    session_id, e
                                );
                            }
                        }
                    }
                    DriverEvent::RemoteTrack(track) => {
                        call.remote_tracks_tx.send_modify(|tracks| tracks.push(track));
                    }
                    DriverEvent::Failed(reason) => {
                        manager.finish(&session_id, reason, None).await;
                        break;
                    }
                    DriverEvent::Closed => {
                        manager.finish(&session_id, EndReason::Hangup, None).await;
                        break;
                    }
                }
            }
        })
    }

    /// Bound the ringing state. The timer is aborted on accept and on
    /// answer receipt; as a guard against racing the abort, expiry also
    /// re-checks that the negotiation never progressed past the offer.
    fn spawn_ring_timer(self: &Arc<Self>, call: &Arc<ActiveCall>) {
        let manager = Arc::clone(self);
        let driver = call.driver.clone();
        let session_id = call.session.session_id.clone();
        let timeout = self.config.ring_timeout;

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_ringing = matches!(
                manager.store.get_session(&session_id).await,
                Ok(Some(s)) if s.status == CallStatus::Ringing
            );
            let answered = matches!(
                driver.state().await,
                NegotiationState::OfferReceived
                    | NegotiationState::AnswerExchanged
                    | NegotiationState::Connected
            );
            if still_ringing && !answered {
                info!("Ring timeout for call {}, ending with NoAnswer", session_id);
                manager.finish(&session_id, EndReason::NoAnswer, None).await;
            }
        });
        *call.ring_task.lock().expect("lock poisoned") = Some(task);
    }

    /// End the persisted record of a call whose setup failed before any
    /// bookkeeping (and thus any ring timer) existed.
    async fn abandon_session(&self, session_id: &SessionId) {
        if let Err(e) = self
            .store
            .mark_ended(session_id, EndReason::NegotiationFailed)
            .await
        {
            warn!("Failed to end abandoned session {}: {}", session_id, e);
        }
    }

    async fn end_with(
        self: &Arc<Self>,
        session_id: &SessionId,
        reason: EndReason,
    ) -> Result<(), CallError> {
        if self.active_call(session_id).await.is_none() {
            // Not active locally: still honor idempotent end on the record.
            return match self.store.get_session(session_id).await? {
                Some(session) if session.is_ended() => Ok(()),
                Some(_) => {
                    self.store.mark_ended(session_id, reason).await?;
                    Ok(())
                }
                None => Err(CallError::NotFound(session_id.to_string())),
            };
        }
        self.finish(session_id, reason, None).await;
        Ok(())
    }

    /// Single teardown path for every way a call ends: explicit hangup,
    /// decline, negotiation failure, ring timeout. Idempotent.
    async fn finish(&self, session_id: &SessionId, reason: EndReason, error: Option<String>) {
        let Some(call) = self.active_call(session_id).await else {
            return;
        };
        if call.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = call.ring_task.lock().expect("lock poisoned").take() {
            task.abort();
        }

        if let Err(e) = self.store.mark_ended(session_id, reason).await {
            warn!("Failed to persist end of session {}: {}", session_id, e);
        }

        // Cleanup runs on every path; device handles are never leaked.
        call.driver.close().await;
        // Dropping the pending subscription unsubscribes a never-accepted
        // callee.
        call.pending_subscription.lock().await.take();
        // Release the relay's per-session channel.
        self.relay.remove_session(session_id).await;

        let failed = matches!(
            reason,
            EndReason::NegotiationFailed | EndReason::MediaDenied
        );
        call.phase_tx.send_replace(if failed {
            ConnectionPhase::Failed
        } else {
            ConnectionPhase::Ended
        });

        if failed {
            self.event_bus.dispatch(&Event::CallFailed {
                session_id: session_id.clone(),
                error: error.unwrap_or_else(|| format!("{:?}", reason)),
            });
        }
        self.event_bus.dispatch(&Event::CallEnded {
            session_id: session_id.clone(),
            reason,
        });

        debug!("Call {} finished ({:?})", session_id, reason);
    }
}
