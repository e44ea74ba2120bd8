pub mod call;
pub mod events;

pub use call::{CallSession, CallStatus, DisplayProfile, EndReason, SessionId, UserId};
pub use events::{Event, EventBus, EventHandler, IncomingCall};
