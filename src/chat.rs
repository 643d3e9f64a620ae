//! Chat sub-protocol carried over the session's ordered channel
//!
//! Messages are JSON `{senderName, text}` envelopes. A malformed payload is
//! surfaced as a raw entry rather than dropped, so the user always sees that
//! the peer sent something.

use serde::{Deserialize, Serialize};

/// Wire format for a chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender's display name
    #[serde(rename = "senderName")]
    pub sender_name: String,
    /// Message body
    pub text: String,
}

impl ChatMessage {
    pub fn new(sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            text: text.into(),
        }
    }

    /// Encode for transmission over the ordered channel
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A chat history entry as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEntry {
    /// A well-formed message, local or remote
    Message {
        sender: String,
        text: String,
        own: bool,
    },
    /// A payload that failed shape validation, kept raw
    Malformed { raw: String },
}

/// Decode an inbound chat payload, tagging malformed data instead of dropping it
pub fn decode_entry(raw: &str) -> ChatEntry {
    match serde_json::from_str::<ChatMessage>(raw) {
        Ok(message) => ChatEntry::Message {
            sender: message.sender_name,
            text: message.text,
            own: false,
        },
        Err(err) => {
            tracing::warn!(error = %err, "chat payload failed validation, rendering raw");
            ChatEntry::Malformed {
                raw: raw.to_string(),
            }
        }
    }
}
