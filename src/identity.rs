//! Signaling identity management
//!
//! The client signs on to the relay under an `active_id`: the user's chosen
//! name when one is set, otherwise a random id generated once at startup.
//! Whenever the active id changes while the channel is open, the owner must
//! re-announce it with an `identify` envelope; `set_name` reports whether
//! that is required.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Signaling identity: chosen name plus a process-lifetime fallback id.
///
/// Invariant: `active_id` is never empty once constructed.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    generated_id: String,
    active_id: String,
}

impl Identity {
    /// Create a new identity with a fresh generated id
    pub fn new() -> Self {
        let generated_id = generate_id();
        Self {
            name: String::new(),
            generated_id: generated_id.clone(),
            active_id: generated_id,
        }
    }

    /// Create an identity with an initial name (trimmed; empty keeps the generated id)
    pub fn with_name(name: &str) -> Self {
        let mut identity = Self::new();
        identity.set_name(name);
        identity
    }

    /// Set or clear the chosen name.
    ///
    /// Trims the input. Returns `true` when the active id changed, meaning
    /// the owner must re-identify with the relay if the channel is open.
    pub fn set_name(&mut self, raw: &str) -> bool {
        let trimmed = raw.trim();
        if trimmed == self.name {
            return false;
        }
        self.name = trimmed.to_string();
        let previous = std::mem::take(&mut self.active_id);
        self.active_id = if self.name.is_empty() {
            self.generated_id.clone()
        } else {
            self.name.clone()
        };
        previous != self.active_id
    }

    /// Adopt the id the relay confirmed for us.
    ///
    /// The relay may rewrite the requested id (e.g., on collision); the
    /// client must align with the relay's value or subsequent envelopes
    /// would be routed to a peer that does not exist.
    pub fn adopt(&mut self, id: &str) {
        if id.is_empty() || id == self.active_id {
            return;
        }
        if self.name.is_empty() && id.starts_with("user-") {
            self.generated_id = id.to_string();
        } else if !self.name.is_empty() {
            tracing::warn!(
                requested = %self.active_id,
                assigned = %id,
                "relay rewrote our chosen name during identification"
            );
        }
        self.active_id = id.to_string();
    }

    /// The id currently used for signaling; never empty
    pub fn current_id(&self) -> &str {
        &self.active_id
    }

    /// The user's chosen name, if any
    pub fn name(&self) -> Option<&str> {
        if self.name.is_empty() {
            None
        } else {
            Some(&self.name)
        }
    }

    /// Name shown on outgoing chat messages
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Guest"
        } else {
            &self.name
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("user-{}", suffix)
}
