//! Relay envelope types
//!
//! One JSON envelope per relay message, discriminated by a `type` tag.
//! Outbound envelopes carry `target`; the relay annotates routed envelopes
//! with `sender` before delivery, so both fields are optional on the wire.

use serde::{Deserialize, Serialize};

/// Signaling envelope exchanged with the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Announce or re-announce our signaling id
    Identify { id: String },
    /// Relay's acknowledgment; may differ from the requested id
    Identified { id: String },
    /// SDP offer routed to `target`, annotated with `sender` on delivery
    Offer {
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        offer: SessionDescription,
    },
    /// SDP answer routed to `target`
    Answer {
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        answer: SessionDescription,
    },
    /// Trickled ICE candidate routed to `target`
    Candidate {
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        candidate: CandidateInit,
    },
    /// Call teardown notification routed to `target`
    Hangup {
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    /// Relay-detected failure (e.g., unknown target)
    Error { message: String },
}

impl Envelope {
    /// The envelope kind as it appears in the wire tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::Identified { .. } => "identified",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Hangup { .. } => "hangup",
            Self::Error { .. } => "error",
        }
    }
}

/// SDP kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP description blob, shaped like the browser's RTCSessionDescription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate payload, shaped like the browser's RTCIceCandidateInit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateInit {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}
