//! UI-observable call events and the event bus they are dispatched on.
//!
//! The UI layer registers an [`EventHandler`] and reacts to incoming
//! calls and state changes; it never polls the negotiation driver.

use serde::Serialize;
use std::sync::{Arc, RwLock};

use super::call::{CallSession, CallStatus, DisplayProfile, EndReason, SessionId};

/// An incoming call the local user can accept or decline.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub session: CallSession,
    /// Caller display data, when the profile layer could resolve it.
    pub caller_profile: Option<DisplayProfile>,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    IncomingCall(IncomingCall),
    CallStateChanged {
        session_id: SessionId,
        status: CallStatus,
    },
    CallEnded {
        session_id: SessionId,
        reason: EndReason,
    },
    CallFailed {
        session_id: SessionId,
        error: String,
    },
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

/// Synchronous fan-out bus for call events.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}
