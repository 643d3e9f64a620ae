//! Transport session seam
//!
//! The peer-to-peer media/data connection is an external collaborator; the
//! session state machine drives it through these traits. The production
//! implementation in [`webrtc`](self::webrtc) wraps a WebRTC peer
//! connection; tests substitute deterministic fakes so every transition is
//! observable without a network or media backend.

pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::LocalMedia;
use crate::signaling::envelope::{CandidateInit, SessionDescription};
use crate::Result;

/// Peer connection lifecycle state as observed by the session machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Transient loss; the transport may recover on its own
    Disconnected,
    /// Terminal failure; the session must be torn down
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Kind of a remote media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Events surfaced by a transport session or its ordered channel
#[derive(Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and should be trickled to the peer
    Candidate(CandidateInit),
    /// Peer connection state changed
    ConnectionState(ConnectionState),
    /// A remote media track arrived
    RemoteTrack(TrackKind),
    /// The peer opened the ordered channel towards us (callee side)
    ChannelReceived(Arc<dyn OrderedChannel>),
    /// The ordered channel reported open
    ChannelOpen,
    /// The ordered channel closed
    ChannelClosed,
    /// A payload arrived on the ordered channel
    ChannelMessage(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candidate(c) => f.debug_tuple("Candidate").field(&c.candidate).finish(),
            Self::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            Self::RemoteTrack(k) => f.debug_tuple("RemoteTrack").field(k).finish(),
            Self::ChannelReceived(ch) => {
                f.debug_tuple("ChannelReceived").field(&ch.label()).finish()
            }
            Self::ChannelOpen => write!(f, "ChannelOpen"),
            Self::ChannelClosed => write!(f, "ChannelClosed"),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
        }
    }
}

/// Generation-stamped sink for transport events.
///
/// Every session gets a fresh generation; the machine drops events whose
/// generation no longer matches, so callbacks from a torn-down transport can
/// never mutate a newer session.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    generation: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<(u64, TransportEvent)>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Emit an event; silently ignored once the receiving loop is gone
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.generation, event));
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Reliable, order-preserving message channel multiplexed over the transport
#[async_trait]
pub trait OrderedChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Whether the channel currently reports open
    fn is_open(&self) -> bool;

    /// Send a text payload; fails when the channel is not open
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;

    /// Attach event handlers delivering open/close/message into the sink.
    ///
    /// Called as soon as the channel handle exists, on either side.
    fn bind_events(&self, sink: EventSink);
}

/// The peer-to-peer session object (ICE + media + ordered channel)
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Attach local media tracks before negotiating
    async fn attach_media(&self, media: &LocalMedia) -> Result<()>;

    /// Create the ordered chat channel (caller side, before the offer)
    async fn create_ordered_channel(&self, label: &str) -> Result<Arc<dyn OrderedChannel>>;

    /// Produce an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Produce an SDP answer (requires a remote offer to be set)
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Commit a description as the local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply the peer's description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a trickled remote ICE candidate
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()>;

    /// Unregister all event handlers, preventing late callbacks
    fn detach_events(&self);

    /// Stop every locally-sent media track on this session's senders
    async fn stop_senders(&self);

    /// Close the underlying connection
    async fn close(&self) -> Result<()>;
}

/// Creates transport sessions wired to an event sink
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn SessionTransport>>;
}
