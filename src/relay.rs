//! Signal relay client.
//!
//! The relay is the out-of-band channel two peers use to exchange
//! offer/answer/candidate messages before a direct path exists. Delivery
//! is best-effort and live-only: messages published while the recipient
//! has no subscription are lost (the ring timeout covers the missed-offer
//! case), and no ordering is guaranteed across message kinds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::store::SessionStore;
use crate::types::{SessionId, UserId};

/// Kind of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }

    /// Offer and answer are fatal to the negotiation when they fail to
    /// send; candidate sends are retried by ICE itself and only logged.
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// One unit of negotiation exchange, addressed to a specific recipient
/// within a call session. Append-only; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub session_id: SessionId,
    pub from: UserId,
    pub to: UserId,
    pub kind: SignalKind,
    /// Opaque negotiation data: a session description for offer/answer,
    /// a candidate descriptor for ice-candidate.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn new(
        session_id: SessionId,
        from: UserId,
        to: UserId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            from,
            to,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// A live subscription to one session's inbound messages. Messages are
/// buffered in the subscription until consumed; dropping it unsubscribes.
pub struct SignalSubscription {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    task: JoinHandle<()>,
}

impl SignalSubscription {
    /// Receive the next inbound message. `None` when the relay side of
    /// the channel has gone away.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    /// Non-blocking variant used when draining already-buffered messages.
    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Transport seam for publishing and receiving signaling messages.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Publish a message to its recipient. Also appends the message to
    /// the session's audit log, independent of delivery success.
    async fn send(&self, message: SignalingMessage) -> Result<(), CallError>;

    /// Subscribe to inbound messages for a session addressed to
    /// `local_user`. Only messages sent after this call are delivered.
    async fn subscribe(
        &self,
        session_id: &SessionId,
        local_user: &UserId,
    ) -> Result<SignalSubscription, CallError>;

    /// Release transport resources held for a session and close its live
    /// subscriptions. Called once the session has ended.
    async fn remove_session(&self, _session_id: &SessionId) {}
}

/// Relay over an in-process broadcast channel per session, layered on the
/// shared store's audit log. Both peers of a call (and the tests) attach
/// to the same relay instance.
pub struct InProcessRelay {
    store: Arc<dyn SessionStore>,
    channels: Mutex<HashMap<String, broadcast::Sender<SignalingMessage>>>,
}

impl InProcessRelay {
    pub fn new(store: Arc<dyn SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            channels: Mutex::new(HashMap::new()),
        })
    }

    async fn channel(&self, session_id: &SessionId) -> broadcast::Sender<SignalingMessage> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl SignalRelay for InProcessRelay {
    async fn send(&self, message: SignalingMessage) -> Result<(), CallError> {
        // Audit log first; its failure never blocks delivery.
        if let Err(e) = self.store.append_signal(&message).await {
            warn!(
                "Failed to append {} signal for session {} to audit log: {}",
                message.kind, message.session_id, e
            );
        }

        let tx = self.channel(&message.session_id).await;
        match tx.send(message) {
            Ok(receivers) => {
                debug!("Delivered signal to {} subscriber(s)", receivers);
                Ok(())
            }
            Err(broadcast::error::SendError(lost)) => {
                // No live subscriber: best-effort channel, message is lost.
                debug!(
                    "No subscriber for {} signal in session {}, message dropped",
                    lost.kind, lost.session_id
                );
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        local_user: &UserId,
    ) -> Result<SignalSubscription, CallError> {
        let mut source = self.channel(session_id).await.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let local = local_user.clone();
        let session = session_id.clone();

        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if message.to != local {
                            continue;
                        }
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Best-effort: keep the subscription alive.
                        warn!(
                            "Signal subscription for session {} lagged, {} message(s) lost",
                            session, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!("Subscribed {} to session {}", local_user, session_id);
        Ok(SignalSubscription { rx, task })
    }

    /// Dropping the channel closes every live subscription for the
    /// session; their forwarding tasks end on the closed broadcast.
    async fn remove_session(&self, session_id: &SessionId) {
        self.channels.lock().await.remove(session_id.as_str());
    }
}
