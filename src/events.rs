//! Inbound event model
//!
//! Every stimulus that can move the session machine — user intent, relay
//! envelopes, transport callbacks — is expressed as one [`CallEvent`] and
//! dispatched through a single handler, so transitions are deterministic and
//! testable without real backends.

use crate::signaling::SignalingEvent;
use crate::transport::TransportEvent;

/// User intent
#[derive(Debug, Clone)]
pub enum CallCommand {
    /// Acquire local media (camera/microphone)
    StartMedia,
    /// Place a call to the named peer
    PlaceCall { target: String },
    /// Hang up the current call
    HangUp,
    /// Send a chat message over the ordered channel
    SendChat { text: String },
    /// Change the chosen display name
    SetName { name: String },
    /// Stop the client
    Shutdown,
}

/// A single inbound event for the session machine
#[derive(Debug)]
pub enum CallEvent {
    /// User intent
    Command(CallCommand),
    /// Signaling channel activity
    Signal(SignalingEvent),
    /// Transport callback, stamped with the generation of the session that
    /// produced it; stale generations are dropped
    Transport { generation: u64, event: TransportEvent },
}
