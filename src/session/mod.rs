//! Call session state machine
//!
//! Tracks exactly one active or pending call at a time, drives the
//! offer/answer/candidate exchange over the signaling relay, and owns the
//! lifecycle of the transport session and its ordered chat channel. Every
//! stimulus arrives as a [`CallEvent`]; the machine is the single writer of
//! the session record.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::{self, ChatEntry, ChatMessage};
use crate::events::{CallCommand, CallEvent};
use crate::identity::Identity;
use crate::media::{self, LocalMedia, MediaSource};
use crate::presenter::{Presenter, StatusKind};
use crate::signaling::envelope::{CandidateInit, Envelope, SessionDescription};
use crate::signaling::{EnvelopeSink, SignalingEvent};
use crate::transport::{
    ConnectionState, EventSink, OrderedChannel, SessionTransport, TrackKind, TransportEvent,
    TransportFactory,
};
use crate::Result;

#[cfg(test)]
mod tests;

/// Label of the ordered chat channel
const CHAT_CHANNEL_LABEL: &str = "chat";

/// Session state-machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No local media, no call
    #[default]
    Idle,
    /// Local media acquisition in progress
    Acquiring,
    /// Local media held, no peer
    Ready,
    /// Caller, awaiting answer
    Offering,
    /// Callee, producing an answer
    Answering,
    /// Call established (optimistically after offer/answer exchange)
    Active,
    /// Teardown in progress
    Closing,
}

impl Phase {
    /// Whether a call is in flight (pending or established)
    pub fn in_call(self) -> bool {
        matches!(
            self,
            Phase::Offering | Phase::Answering | Phase::Active | Phase::Closing
        )
    }
}

/// Which side of the call we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Caller,
    Callee,
}

/// The single mutable call record
#[derive(Default)]
struct Session {
    phase: Phase,
    role: Role,
    peer_id: Option<String>,
    transport: Option<Arc<dyn SessionTransport>>,
    channel: Option<Arc<dyn OrderedChannel>>,
    remote_audio: bool,
    remote_video: bool,
    /// Generation of the transport event sink; stale events are dropped
    generation: u64,
}

/// The session state machine
pub struct CallMachine {
    identity: Identity,
    signaling: Arc<dyn EnvelopeSink>,
    media_source: Arc<dyn MediaSource>,
    factory: Arc<dyn TransportFactory>,
    presenter: Arc<dyn Presenter>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    session: Session,
    local_media: Option<LocalMedia>,
    chat_log: Vec<ChatEntry>,
    chat_open: bool,
    /// Who we were last talking to; retained across teardown for the UI only
    last_peer: Option<String>,
    next_generation: u64,
}

impl CallMachine {
    pub fn new(
        identity: Identity,
        signaling: Arc<dyn EnvelopeSink>,
        media_source: Arc<dyn MediaSource>,
        factory: Arc<dyn TransportFactory>,
        presenter: Arc<dyn Presenter>,
        transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    ) -> Self {
        Self {
            identity,
            signaling,
            media_source,
            factory,
            presenter,
            transport_tx,
            session: Session::default(),
            local_media: None,
            chat_log: Vec::new(),
            chat_open: false,
            last_peer: None,
            next_generation: 0,
        }
    }

    /// Current state-machine phase
    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    /// Current role within the call
    pub fn role(&self) -> Role {
        self.session.role
    }

    /// The tracked peer, if a call is in flight
    pub fn peer(&self) -> Option<&str> {
        self.session.peer_id.as_deref()
    }

    /// Who we were last talking to (survives teardown)
    pub fn last_peer(&self) -> Option<&str> {
        self.last_peer.as_deref()
    }

    /// Whether local media is currently held
    pub fn has_local_media(&self) -> bool {
        self.local_media.is_some()
    }

    /// Whether a locally held video track is active
    pub fn has_local_video(&self) -> bool {
        self.local_media.as_ref().map_or(false, |m| m.has_video)
    }

    /// Whether the chat channel reports open
    pub fn chat_open(&self) -> bool {
        self.chat_open
    }

    /// Chat history for the current call
    pub fn chat_log(&self) -> &[ChatEntry] {
        &self.chat_log
    }

    /// Generation of the current session's transport event sink
    pub fn generation(&self) -> u64 {
        self.session.generation
    }

    /// Our signaling identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Dispatch a single inbound event
    pub async fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Command(command) => match command {
                CallCommand::StartMedia => self.handle_start_media().await,
                CallCommand::PlaceCall { target } => self.handle_place_call(&target).await,
                CallCommand::HangUp => self.handle_user_hangup().await,
                CallCommand::SendChat { text } => self.handle_send_chat(&text).await,
                CallCommand::SetName { name } => self.handle_set_name(&name),
                CallCommand::Shutdown => self.handle_shutdown().await,
            },
            CallEvent::Signal(signal) => match signal {
                SignalingEvent::Open => self.handle_signaling_open(),
                SignalingEvent::Envelope(envelope) => self.handle_envelope(envelope).await,
                // Losing the wire is not, by itself, a hangup
                SignalingEvent::Closed => {
                    self.status("Disconnected from signaling relay.", StatusKind::Info);
                }
                SignalingEvent::Error(message) => {
                    self.status(
                        &format!("Signaling channel error: {}", message),
                        StatusKind::Error,
                    );
                }
            },
            CallEvent::Transport { generation, event } => {
                if generation != self.session.generation {
                    debug!(generation, current = self.session.generation, ?event,
                        "dropping transport event from stale session");
                    return;
                }
                self.handle_transport_event(event).await;
            }
        }
    }

    // --- User intent ---

    async fn handle_start_media(&mut self) {
        if self.session.phase != Phase::Idle {
            self.status("Media already started.", StatusKind::Info);
            return;
        }
        self.set_phase(Phase::Acquiring);
        match media::acquire_with_fallback(self.media_source.as_ref()).await {
            Ok(acquired) => {
                let has_video = acquired.has_video;
                self.local_media = Some(acquired);
                self.set_phase(Phase::Ready);
                self.presenter.local_media_changed(true, has_video);
                if !has_video {
                    self.status("Proceeding with audio only.", StatusKind::Info);
                }
            }
            Err(err) => {
                self.set_phase(Phase::Idle);
                self.presenter.local_media_changed(false, false);
                self.status(
                    &format!("Could not start camera/microphone: {}", err),
                    StatusKind::Error,
                );
            }
        }
    }

    async fn handle_place_call(&mut self, target: &str) {
        let target = target.trim();
        if target.is_empty() {
            self.status(
                "Please enter the name of the peer to call.",
                StatusKind::Error,
            );
            return;
        }
        if self.local_media.is_none() {
            self.status(
                "Please start your camera/microphone first.",
                StatusKind::Error,
            );
            return;
        }
        // A call already in flight is rejected locally, never forwarded
        if self.session.phase.in_call() {
            self.status("Call already active or attempting.", StatusKind::Info);
            return;
        }
        if !self.signaling.is_open() {
            self.status("Not connected to the signaling relay.", StatusKind::Error);
            return;
        }

        info!(%target, from = %self.identity.current_id(), "initiating call");
        self.status(&format!("Calling {}...", target), StatusKind::Info);
        self.session.role = Role::Caller;
        self.session.peer_id = Some(target.to_string());
        self.set_phase(Phase::Offering);

        if let Err(err) = self.start_outbound(target.to_string()).await {
            self.status(&format!("Error starting call: {}", err), StatusKind::Error);
            // Unwind partial resources; no leaked transport on offer failure
            self.teardown().await;
        }
    }

    async fn start_outbound(&mut self, target: String) -> Result<()> {
        let media = self.local_media()?;
        let transport = self.create_transport().await?;
        transport.attach_media(&media).await?;

        // The caller creates the ordered chat channel before the offer so it
        // rides along in the initial negotiation.
        let channel = transport.create_ordered_channel(CHAT_CHANNEL_LABEL).await?;
        channel.bind_events(self.current_sink());
        self.session.channel = Some(channel);

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.signaling.send(Envelope::Offer {
            target: Some(target),
            sender: None,
            offer,
        });
        Ok(())
    }

    async fn handle_user_hangup(&mut self) {
        if !self.session.phase.in_call() {
            self.status("No call to hang up.", StatusKind::Info);
            return;
        }
        // Exactly one hangup envelope, only on the user-initiated path
        if self.session.transport.is_some() {
            if let Some(peer) = self.session.peer_id.clone() {
                info!(%peer, "sending hangup");
                self.signaling.send(Envelope::Hangup {
                    target: Some(peer),
                    sender: None,
                });
            }
        }
        self.teardown().await;
    }

    /// Shutdown behaves like a user hangup when a call is in flight and is
    /// otherwise silent.
    async fn handle_shutdown(&mut self) {
        if self.session.phase.in_call() {
            self.handle_user_hangup().await;
        }
    }

    async fn handle_send_chat(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some(channel) = self.session.channel.clone() else {
            self.status("Chat channel not open.", StatusKind::Error);
            return;
        };
        if !self.chat_open || !channel.is_open() {
            self.status("Chat channel not open.", StatusKind::Error);
            return;
        }
        let message = ChatMessage::new(self.identity.display_name(), text);
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                self.status(
                    &format!("Error encoding chat message: {}", err),
                    StatusKind::Error,
                );
                return;
            }
        };
        match channel.send_text(&payload).await {
            Ok(()) => {
                let entry = ChatEntry::Message {
                    sender: self.identity.display_name().to_string(),
                    text: text.to_string(),
                    own: true,
                };
                self.chat_log.push(entry.clone());
                self.presenter.chat_entry(&entry);
            }
            Err(err) => {
                self.status(
                    &format!("Error sending chat message: {}", err),
                    StatusKind::Error,
                );
            }
        }
    }

    fn handle_set_name(&mut self, name: &str) {
        let changed = self.identity.set_name(name);
        self.presenter
            .identity_changed(self.identity.display_name(), self.identity.current_id());
        if changed && self.signaling.is_open() {
            let id = self.identity.current_id().to_string();
            info!(%id, "re-identifying with relay");
            self.signaling.send(Envelope::Identify { id });
        }
    }

    // --- Signaling ---

    fn handle_signaling_open(&mut self) {
        let id = self.identity.current_id().to_string();
        info!(%id, "signaling channel open, identifying");
        self.signaling.send(Envelope::Identify { id });
        self.presenter
            .identity_changed(self.identity.display_name(), self.identity.current_id());
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Identified { id } => self.handle_identified(&id),
            Envelope::Offer { sender, offer, .. } => {
                let Some(sender) = sender else {
                    warn!("offer without sender annotation dropped");
                    return;
                };
                self.handle_offer(sender, offer).await;
            }
            Envelope::Answer { answer, .. } => self.handle_answer(answer).await,
            Envelope::Candidate {
                sender, candidate, ..
            } => self.handle_remote_candidate(sender, candidate).await,
            Envelope::Hangup { sender, .. } => self.handle_remote_hangup(sender).await,
            Envelope::Error { message } => {
                self.status(&message, StatusKind::Error);
                // Only force teardown when a call was in flight
                if self.session.phase.in_call() {
                    self.teardown().await;
                }
            }
            Envelope::Identify { .. } => {
                debug!("unexpected identify envelope from relay, ignored");
            }
        }
    }

    fn handle_identified(&mut self, id: &str) {
        if id == self.identity.current_id() {
            return;
        }
        warn!(
            assigned = %id,
            requested = %self.identity.current_id(),
            "relay assigned a different id, adopting"
        );
        self.identity.adopt(id);
        self.presenter
            .identity_changed(self.identity.display_name(), self.identity.current_id());
    }

    async fn handle_offer(&mut self, sender: String, offer: SessionDescription) {
        info!(%sender, "inbound offer");
        if self.local_media.is_none() {
            // No transport session is created for a rejected offer
            self.status(
                &format!(
                    "Incoming call from {} ignored: start your camera/microphone first.",
                    sender
                ),
                StatusKind::Error,
            );
            return;
        }
        if self.session.transport.is_some() || self.session.phase.in_call() {
            // Last offer wins: the existing session goes down first
            warn!("tearing down existing session before handling new offer");
            self.teardown().await;
        }

        self.session.role = Role::Callee;
        self.session.peer_id = Some(sender.clone());
        self.set_phase(Phase::Answering);

        if let Err(err) = self.answer_inbound(sender.clone(), offer).await {
            self.status(&format!("Error answering call: {}", err), StatusKind::Error);
            self.teardown().await;
            return;
        }

        // Optimistically active, symmetric to the caller path; real
        // connectivity is signaled by the transport layer.
        self.set_phase(Phase::Active);
        self.status(
            &format!("Call connected with {}", sender),
            StatusKind::Success,
        );
    }

    async fn answer_inbound(&mut self, sender: String, offer: SessionDescription) -> Result<()> {
        let media = self.local_media()?;
        let transport = self.create_transport().await?;
        transport.attach_media(&media).await?;
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.signaling.send(Envelope::Answer {
            target: Some(sender),
            sender: None,
            answer,
        });
        Ok(())
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        let Some(transport) = self.session.transport.clone() else {
            warn!("answer received with no pending transport session, dropped");
            return;
        };
        if self.session.phase != Phase::Offering {
            warn!(phase = ?self.session.phase, "answer received outside Offering");
        }
        match transport.set_remote_description(answer).await {
            Ok(()) => {
                let peer = self.peer_display();
                self.set_phase(Phase::Active);
                self.status(
                    &format!("Call connected with {}.", peer),
                    StatusKind::Success,
                );
            }
            Err(err) => {
                self.status(
                    &format!("Error processing answer: {}", err),
                    StatusKind::Error,
                );
                self.teardown().await;
            }
        }
    }

    async fn handle_remote_candidate(&mut self, sender: Option<String>, candidate: CandidateInit) {
        let Some(sender) = sender else {
            warn!("candidate without sender annotation dropped");
            return;
        };
        let Some(transport) = self.session.transport.clone() else {
            // Accepted ordering limitation: candidates racing ahead of the
            // offer/answer exchange are dropped, not buffered.
            debug!(%sender, "candidate dropped: no transport session yet");
            return;
        };
        if self.session.peer_id.as_deref() != Some(sender.as_str()) {
            warn!(%sender, "candidate from unexpected sender dropped");
            return;
        }
        // Candidate-apply failures are logged; they do not end the call
        if let Err(err) = transport.add_remote_candidate(candidate).await {
            warn!("failed to apply remote candidate: {}", err);
        }
    }

    async fn handle_remote_hangup(&mut self, sender: Option<String>) {
        let Some(sender) = sender else {
            warn!("hangup without sender annotation dropped");
            return;
        };
        if self.session.peer_id.as_deref() != Some(sender.as_str()) {
            debug!(%sender, "hangup from non-tracked sender ignored");
            return;
        }
        info!(%sender, "remote hangup");
        self.status(&format!("{} disconnected.", sender), StatusKind::Info);
        // Never echo a hangup back
        self.teardown().await;
    }

    // --- Transport callbacks ---

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Candidate(candidate) => {
                if let Some(peer) = self.session.peer_id.clone() {
                    self.signaling.send(Envelope::Candidate {
                        target: Some(peer),
                        sender: None,
                        candidate,
                    });
                } else {
                    debug!("local candidate gathered with no tracked peer, dropped");
                }
            }
            TransportEvent::ConnectionState(state) => self.handle_connection_state(state).await,
            TransportEvent::RemoteTrack(kind) => {
                match kind {
                    TrackKind::Audio => self.session.remote_audio = true,
                    TrackKind::Video => self.session.remote_video = true,
                }
                self.presenter
                    .remote_media_changed(self.session.remote_audio, self.session.remote_video);
            }
            TransportEvent::ChannelReceived(channel) => {
                // Callee side: handlers were already bound when the channel
                // arrived, possibly after Active was reached.
                info!(label = %channel.label(), "chat channel received from peer");
                self.session.channel = Some(channel);
            }
            TransportEvent::ChannelOpen => {
                self.chat_open = true;
                self.presenter.chat_ready(true);
                self.status("Chat connected!", StatusKind::Success);
            }
            TransportEvent::ChannelClosed => {
                if self.chat_open {
                    self.chat_open = false;
                    self.presenter.chat_ready(false);
                }
            }
            TransportEvent::ChannelMessage(raw) => {
                let entry = chat::decode_entry(&raw);
                self.chat_log.push(entry.clone());
                self.presenter.chat_entry(&entry);
            }
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let peer = self.peer_display();
                self.status(&format!("Connected with {}.", peer), StatusKind::Success);
            }
            // Transient loss: the transport may recover on its own
            ConnectionState::Disconnected => {
                self.status(
                    "Peer connection interrupted, waiting for recovery.",
                    StatusKind::Info,
                );
            }
            // The only state considered unrecoverable without user action
            ConnectionState::Failed => {
                self.status("Connection failed.", StatusKind::Error);
                self.teardown().await;
            }
            ConnectionState::Closed => {
                debug!("transport reported closed");
            }
            ConnectionState::New | ConnectionState::Connecting => {
                debug!(%state, "transport connecting");
            }
        }
    }

    // --- Teardown ---

    /// Idempotent full teardown: releases the transport session and ordered
    /// channel, clears chat history, and settles the phase according to
    /// whether local media is still held. Safe to invoke from any state.
    pub async fn teardown(&mut self) {
        self.close_session().await;
        self.reset_call_state();
    }

    async fn close_session(&mut self) {
        let nothing_held = self.session.transport.is_none() && self.session.channel.is_none();
        if nothing_held && !self.session.phase.in_call() {
            self.settle_phase();
            return;
        }
        self.set_phase(Phase::Closing);

        // Invalidate any callback still in flight from this session
        self.next_generation += 1;
        self.session.generation = self.next_generation;

        if let Some(channel) = self.session.channel.take() {
            if let Err(err) = channel.close().await {
                warn!("error closing chat channel: {}", err);
            }
        }
        if self.chat_open {
            self.chat_open = false;
            self.presenter.chat_ready(false);
        }

        if let Some(transport) = self.session.transport.take() {
            transport.detach_events();
            transport.stop_senders().await;
            if let Err(err) = transport.close().await {
                warn!("error closing transport session: {}", err);
            }
        }

        if self.session.remote_audio || self.session.remote_video {
            self.session.remote_audio = false;
            self.session.remote_video = false;
            self.presenter.remote_media_changed(false, false);
        }

        // Keep a hint of who we were talking to, for the UI only
        if let Some(peer) = self.session.peer_id.take() {
            self.last_peer = Some(peer);
        }
        self.session.role = Role::None;
        self.settle_phase();
    }

    fn reset_call_state(&mut self) {
        self.chat_log.clear();
        self.presenter.chat_cleared();
        self.presenter.status_cleared();
        self.presenter
            .local_media_changed(self.local_media.is_some(), self.has_local_video());
    }

    // --- Internals ---

    fn settle_phase(&mut self) {
        let phase = if self.local_media.is_some() {
            Phase::Ready
        } else {
            Phase::Idle
        };
        self.set_phase(phase);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.session.phase != phase {
            debug!(from = ?self.session.phase, to = ?phase, "phase transition");
            self.session.phase = phase;
            self.presenter.phase_changed(phase);
        }
    }

    async fn create_transport(&mut self) -> Result<Arc<dyn SessionTransport>> {
        self.next_generation += 1;
        self.session.generation = self.next_generation;
        let sink = self.current_sink();
        let transport = self.factory.create(sink).await?;
        self.session.transport = Some(transport.clone());
        Ok(transport)
    }

    fn current_sink(&self) -> EventSink {
        EventSink::new(self.transport_tx.clone(), self.session.generation)
    }

    fn local_media(&self) -> Result<LocalMedia> {
        self.local_media
            .clone()
            .ok_or_else(|| crate::AppError::InvalidInput("local media not started".to_string()))
    }

    fn peer_display(&self) -> String {
        self.session
            .peer_id
            .clone()
            .unwrap_or_else(|| "peer".to_string())
    }

    fn status(&self, message: &str, kind: StatusKind) {
        self.presenter.status(message, kind);
    }
}
