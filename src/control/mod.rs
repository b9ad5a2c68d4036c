//! Control channel to the external speech service

mod client;
mod message;
mod router;

pub use client::{ControlChannel, ControlConfig, ControlHandle};
pub use message::{ARTIFACT_EXTENSIONS, ControlMessage, SPEECH_END, SPEECH_START};
pub use router::{ControlRouter, Route, RouteId};

/// Outbound side of the control channel as seen by a session
///
/// Sends never block and never fail: when the link is down the message is
/// dropped.
pub trait ControlSink: Send + Sync {
    /// Send a message to the peer
    fn send(&self, message: ControlMessage);
}
