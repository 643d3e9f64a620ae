//! Presentation adapter
//!
//! The UI is an external collaborator: it receives state-change
//! notifications and is never consulted for protocol decisions. The shipped
//! implementation logs through `tracing`; a real frontend implements
//! [`Presenter`] instead.

use crate::chat::ChatEntry;
use crate::session::Phase;

/// Severity of a transient status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Info,
    Success,
    Error,
}

/// State-change notifications pushed to the UI
pub trait Presenter: Send + Sync {
    /// The session moved to a new phase
    fn phase_changed(&self, phase: Phase);

    /// A transient status message
    fn status(&self, message: &str, kind: StatusKind);

    /// Clear any transient status text
    fn status_cleared(&self);

    /// The signaling identity changed
    fn identity_changed(&self, display_name: &str, signaling_id: &str);

    /// Local media was acquired or released; `has_video` is false after the
    /// audio-only fallback
    fn local_media_changed(&self, held: bool, has_video: bool);

    /// Remote media tracks changed
    fn remote_media_changed(&self, audio: bool, video: bool);

    /// Chat readiness changed; input must stay disabled until ready
    fn chat_ready(&self, ready: bool);

    /// A chat entry was appended to the history
    fn chat_entry(&self, entry: &ChatEntry);

    /// Chat history was cleared
    fn chat_cleared(&self);
}

/// Presenter that logs every notification
#[derive(Debug, Default)]
pub struct TracingPresenter;

impl Presenter for TracingPresenter {
    fn phase_changed(&self, phase: Phase) {
        tracing::info!(?phase, "session phase changed");
    }

    fn status(&self, message: &str, kind: StatusKind) {
        match kind {
            StatusKind::Error => tracing::error!("{}", message),
            StatusKind::Success | StatusKind::Info => tracing::info!("{}", message),
        }
    }

    fn status_cleared(&self) {
        tracing::debug!("status cleared");
    }

    fn identity_changed(&self, display_name: &str, signaling_id: &str) {
        tracing::info!(%display_name, %signaling_id, "identity changed");
    }

    fn local_media_changed(&self, held: bool, has_video: bool) {
        tracing::info!(held, has_video, "local media changed");
    }

    fn remote_media_changed(&self, audio: bool, video: bool) {
        tracing::info!(audio, video, "remote media changed");
    }

    fn chat_ready(&self, ready: bool) {
        tracing::info!(ready, "chat readiness changed");
    }

    fn chat_entry(&self, entry: &ChatEntry) {
        match entry {
            ChatEntry::Message { sender, text, own } => {
                let who = if *own { "Me" } else { sender.as_str() };
                tracing::info!("[chat] {}: {}", who, text);
            }
            ChatEntry::Malformed { raw } => {
                tracing::warn!("[chat] raw: {}", raw);
            }
        }
    }

    fn chat_cleared(&self) {
        tracing::debug!("chat history cleared");
    }
}
