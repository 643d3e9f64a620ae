use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::*;
use crate::chat::ChatEntry;
use crate::events::{CallCommand, CallEvent};
use crate::media::{MediaConstraints, MediaError};
use crate::presenter::{Presenter, StatusKind};
use crate::signaling::envelope::{CandidateInit, Envelope, SessionDescription};
use crate::signaling::SignalingEvent;
use crate::transport::{EventSink, TransportEvent};
use crate::AppError;

// --- Fakes ---

struct FakeSink {
    sent: Mutex<Vec<Envelope>>,
    open: AtomicBool,
}

impl FakeSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(vec![]),
            open: AtomicBool::new(true),
        })
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EnvelopeSink for FakeSink {
    fn send(&self, envelope: Envelope) {
        if self.is_open() {
            self.sent.lock().push(envelope);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct FakeChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    sink: Mutex<Option<EventSink>>,
}

impl FakeChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
            sink: Mutex::new(None),
        })
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl OrderedChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> crate::Result<()> {
        if !self.is_open() {
            return Err(AppError::ChatError("channel not open".to_string()));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn bind_events(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }
}

#[derive(Default)]
struct FakeTransport {
    fail_offer: bool,
    fail_answer: bool,
    attached: AtomicBool,
    detached: AtomicBool,
    senders_stopped: AtomicBool,
    closed: AtomicBool,
    channel: Mutex<Option<Arc<FakeChannel>>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    remote_candidates: Mutex<Vec<CandidateInit>>,
}

impl FakeTransport {
    fn fully_released(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
            && self.senders_stopped.load(Ordering::SeqCst)
            && self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn attach_media(&self, _media: &LocalMedia) -> crate::Result<()> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_ordered_channel(
        &self,
        label: &str,
    ) -> crate::Result<Arc<dyn OrderedChannel>> {
        let channel = FakeChannel::new(label);
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> crate::Result<SessionDescription> {
        if self.fail_offer {
            return Err(AppError::NegotiationError("offer failed".to_string()));
        }
        Ok(SessionDescription::offer("sdp-offer"))
    }

    async fn create_answer(&self) -> crate::Result<SessionDescription> {
        if self.fail_answer {
            return Err(AppError::NegotiationError("answer failed".to_string()));
        }
        Ok(SessionDescription::answer("sdp-answer"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> crate::Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> crate::Result<()> {
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> crate::Result<()> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    fn detach_events(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    async fn stop_senders(&self) {
        self.senders_stopped.store(true, Ordering::SeqCst);
    }

    async fn close(&self) -> crate::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    fail_offer: AtomicBool,
    fail_answer: AtomicBool,
}

impl FakeFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(vec![]),
            fail_offer: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
        })
    }

    fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, _sink: EventSink) -> crate::Result<Arc<dyn SessionTransport>> {
        let transport = Arc::new(FakeTransport {
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
            fail_answer: self.fail_answer.load(Ordering::SeqCst),
            ..Default::default()
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Media source that always succeeds with the requested constraints
struct OkMedia;

#[async_trait]
impl MediaSource for OkMedia {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<LocalMedia, MediaError> {
        Ok(LocalMedia {
            tracks: vec![],
            has_video: constraints.video,
        })
    }
}

/// Media source whose camera is broken; audio-only still works
struct NoCameraMedia;

#[async_trait]
impl MediaSource for NoCameraMedia {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<LocalMedia, MediaError> {
        if constraints.video {
            return Err(MediaError::VideoUnavailable("no camera".to_string()));
        }
        Ok(LocalMedia {
            tracks: vec![],
            has_video: false,
        })
    }
}

/// Media source with no devices at all
struct NoDeviceMedia;

#[async_trait]
impl MediaSource for NoDeviceMedia {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> std::result::Result<LocalMedia, MediaError> {
        Err(MediaError::NoDevice("nothing attached".to_string()))
    }
}

#[derive(Default)]
struct RecordingPresenter {
    statuses: Mutex<Vec<(String, StatusKind)>>,
    phases: Mutex<Vec<Phase>>,
    chat_ready: Mutex<Vec<bool>>,
    chat_cleared: AtomicBool,
    local_media: Mutex<Vec<(bool, bool)>>,
}

impl RecordingPresenter {
    fn status_containing(&self, needle: &str) -> bool {
        self.statuses.lock().iter().any(|(m, _)| m.contains(needle))
    }
}

impl Presenter for RecordingPresenter {
    fn phase_changed(&self, phase: Phase) {
        self.phases.lock().push(phase);
    }
    fn status(&self, message: &str, kind: StatusKind) {
        self.statuses.lock().push((message.to_string(), kind));
    }
    fn status_cleared(&self) {}
    fn identity_changed(&self, _display_name: &str, _signaling_id: &str) {}
    fn local_media_changed(&self, held: bool, has_video: bool) {
        self.local_media.lock().push((held, has_video));
    }
    fn remote_media_changed(&self, _audio: bool, _video: bool) {}
    fn chat_ready(&self, ready: bool) {
        self.chat_ready.lock().push(ready);
    }
    fn chat_entry(&self, _entry: &ChatEntry) {}
    fn chat_cleared(&self) {
        self.chat_cleared.store(true, Ordering::SeqCst);
    }
}

// --- Harness ---

struct Harness {
    machine: CallMachine,
    sink: Arc<FakeSink>,
    factory: Arc<FakeFactory>,
    presenter: Arc<RecordingPresenter>,
}

impl Harness {
    fn new() -> Self {
        Self::with_media(Arc::new(OkMedia))
    }

    fn with_media(media: Arc<dyn MediaSource>) -> Self {
        let sink = FakeSink::new();
        let factory = FakeFactory::new();
        let presenter = Arc::new(RecordingPresenter::default());
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        let machine = CallMachine::new(
            Identity::with_name("me"),
            sink.clone(),
            media,
            factory.clone(),
            presenter.clone(),
            transport_tx,
        );
        Self {
            machine,
            sink,
            factory,
            presenter,
        }
    }

    async fn command(&mut self, command: CallCommand) {
        self.machine.handle(CallEvent::Command(command)).await;
    }

    async fn deliver(&mut self, envelope: Envelope) {
        self.machine
            .handle(CallEvent::Signal(SignalingEvent::Envelope(envelope)))
            .await;
    }

    async fn transport_event(&mut self, event: TransportEvent) {
        let generation = self.machine.generation();
        self.machine
            .handle(CallEvent::Transport { generation, event })
            .await;
    }

    async fn start_media(&mut self) {
        self.command(CallCommand::StartMedia).await;
        assert_eq!(self.machine.phase(), Phase::Ready);
    }

    async fn call(&mut self, target: &str) {
        self.command(CallCommand::PlaceCall {
            target: target.to_string(),
        })
        .await;
    }

    fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.factory.created()[index].clone()
    }
}

fn offer_from(sender: &str) -> Envelope {
    Envelope::Offer {
        target: Some("me".to_string()),
        sender: Some(sender.to_string()),
        offer: SessionDescription::offer("sdp-remote-offer"),
    }
}

fn answer_from(sender: &str) -> Envelope {
    Envelope::Answer {
        target: Some("me".to_string()),
        sender: Some(sender.to_string()),
        answer: SessionDescription::answer("sdp-remote-answer"),
    }
}

fn candidate_from(sender: &str) -> Envelope {
    Envelope::Candidate {
        target: Some("me".to_string()),
        sender: Some(sender.to_string()),
        candidate: CandidateInit::new(format!("candidate-from-{}", sender)),
    }
}

fn hangup_from(sender: &str) -> Envelope {
    Envelope::Hangup {
        target: Some("me".to_string()),
        sender: Some(sender.to_string()),
    }
}

// --- Identity / signaling ---

#[tokio::test]
async fn identifies_when_channel_opens() {
    let mut h = Harness::new();
    h.machine.handle(CallEvent::Signal(SignalingEvent::Open)).await;
    assert_eq!(h.sink.count("identify"), 1);
    match &h.sink.sent()[0] {
        Envelope::Identify { id } => assert_eq!(id, "me"),
        other => panic!("unexpected envelope: {:?}", other),
    }
}

#[tokio::test]
async fn reidentifies_only_when_id_changes_and_channel_open() {
    let mut h = Harness::new();
    h.command(CallCommand::SetName {
        name: "alice".to_string(),
    })
    .await;
    assert_eq!(h.sink.count("identify"), 1);

    // Same name again: no re-identify
    h.command(CallCommand::SetName {
        name: " alice ".to_string(),
    })
    .await;
    assert_eq!(h.sink.count("identify"), 1);

    // Channel closed: change recorded but not announced
    h.sink.set_open(false);
    h.command(CallCommand::SetName {
        name: "bob".to_string(),
    })
    .await;
    assert_eq!(h.sink.count("identify"), 1);
    assert_eq!(h.machine.identity().current_id(), "bob");
}

#[tokio::test]
async fn adopts_relay_assigned_id() {
    let mut h = Harness::new();
    h.deliver(Envelope::Identified {
        id: "me-2".to_string(),
    })
    .await;
    assert_eq!(h.machine.identity().current_id(), "me-2");
}

#[tokio::test]
async fn signaling_close_does_not_hang_up() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;
    assert_eq!(h.machine.phase(), Phase::Active);

    h.machine
        .handle(CallEvent::Signal(SignalingEvent::Closed))
        .await;
    assert_eq!(h.machine.phase(), Phase::Active);
    assert!(!h.transport(0).closed.load(Ordering::SeqCst));
}

// --- Media acquisition ---

#[tokio::test]
async fn camera_failure_falls_back_to_audio_only_and_call_proceeds() {
    let mut h = Harness::with_media(Arc::new(NoCameraMedia));
    h.command(CallCommand::StartMedia).await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert!(h.machine.has_local_media());
    assert!(!h.machine.has_local_video());
    assert!(h
        .presenter
        .local_media
        .lock()
        .contains(&(true, false)));

    h.call("bob").await;
    assert_eq!(h.machine.phase(), Phase::Offering);
    assert_eq!(h.sink.count("offer"), 1);
}

#[tokio::test]
async fn total_media_failure_stays_idle() {
    let mut h = Harness::with_media(Arc::new(NoDeviceMedia));
    h.command(CallCommand::StartMedia).await;
    assert_eq!(h.machine.phase(), Phase::Idle);
    assert!(!h.machine.has_local_media());
    assert!(h.presenter.status_containing("Could not start"));
}

// --- Placing calls ---

#[tokio::test]
async fn caller_creates_channel_before_offer_and_sends_offer() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;

    assert_eq!(h.machine.phase(), Phase::Offering);
    assert_eq!(h.machine.role(), Role::Caller);
    assert_eq!(h.machine.peer(), Some("bob"));

    let transport = h.transport(0);
    assert!(transport.attached.load(Ordering::SeqCst));
    let channel = transport
        .channel
        .lock()
        .clone()
        .expect("chat channel created on caller side");
    let bound_generation = channel.sink.lock().as_ref().map(EventSink::generation);
    assert_eq!(bound_generation, Some(h.machine.generation()));
    assert_eq!(h.sink.count("offer"), 1);
}

#[tokio::test]
async fn call_without_media_is_rejected_locally() {
    let mut h = Harness::new();
    h.call("bob").await;
    assert_eq!(h.machine.phase(), Phase::Idle);
    assert!(h.factory.created().is_empty());
    assert_eq!(h.sink.sent().len(), 0);
    assert!(h.presenter.status_containing("camera/microphone first"));
}

#[tokio::test]
async fn empty_target_is_rejected_locally() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("   ").await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert_eq!(h.sink.sent().len(), 0);
}

#[tokio::test]
async fn second_call_attempt_is_rejected_without_contacting_relay() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    let sent_before = h.sink.sent().len();

    h.call("carol").await;
    assert_eq!(h.sink.sent().len(), sent_before, "relay was contacted");
    assert_eq!(h.factory.created().len(), 1);
    assert_eq!(h.machine.peer(), Some("bob"));
    assert!(h.presenter.status_containing("already active"));
}

#[tokio::test]
async fn offer_failure_unwinds_without_leaking_transport() {
    let mut h = Harness::new();
    h.factory.fail_offer.store(true, Ordering::SeqCst);
    h.start_media().await;
    h.call("bob").await;

    assert_eq!(h.machine.phase(), Phase::Ready, "unwound to camera-ready");
    assert_eq!(h.sink.count("offer"), 0);
    assert!(h.transport(0).fully_released());
}

// --- Answer path ---

#[tokio::test]
async fn answer_moves_offering_to_active() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;

    assert_eq!(h.machine.phase(), Phase::Active);
    let applied = h.transport(0).remote_descriptions.lock().clone();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].sdp, "sdp-remote-answer");
}

#[tokio::test]
async fn answer_with_no_pending_transport_is_dropped() {
    let mut h = Harness::new();
    h.deliver(answer_from("bob")).await;
    assert_eq!(h.machine.phase(), Phase::Idle);
    assert!(h.factory.created().is_empty());
}

// --- Inbound offers ---

#[tokio::test]
async fn inbound_offer_produces_answer_and_goes_active() {
    let mut h = Harness::new();
    h.start_media().await;
    h.deliver(offer_from("alice")).await;

    assert_eq!(h.machine.phase(), Phase::Active);
    assert_eq!(h.machine.role(), Role::Callee);
    assert_eq!(h.machine.peer(), Some("alice"));
    assert_eq!(h.sink.count("answer"), 1);
    match h.sink.sent().last().unwrap() {
        Envelope::Answer { target, .. } => assert_eq!(target.as_deref(), Some("alice")),
        other => panic!("unexpected envelope: {:?}", other),
    }
}

#[tokio::test]
async fn inbound_offer_without_media_is_rejected_without_transport() {
    let mut h = Harness::new();
    h.deliver(offer_from("alice")).await;
    assert_eq!(h.machine.phase(), Phase::Idle);
    assert!(h.factory.created().is_empty());
    assert_eq!(h.sink.count("answer"), 0);
}

#[tokio::test]
async fn answer_failure_unwinds_without_leaking_transport() {
    let mut h = Harness::new();
    h.factory.fail_answer.store(true, Ordering::SeqCst);
    h.start_media().await;
    h.deliver(offer_from("alice")).await;

    assert_eq!(h.machine.phase(), Phase::Ready, "unwound to camera-ready");
    assert_eq!(h.machine.role(), Role::None);
    assert_eq!(h.sink.count("answer"), 0);
    assert!(h.transport(0).fully_released());
}

#[tokio::test]
async fn last_offer_wins_across_senders() {
    let mut h = Harness::new();
    h.start_media().await;
    h.deliver(offer_from("alice")).await;
    h.deliver(offer_from("bob")).await;

    assert_eq!(h.machine.peer(), Some("bob"));
    assert_eq!(h.machine.phase(), Phase::Active);
    assert_eq!(h.factory.created().len(), 2);
    assert!(
        h.transport(0).fully_released(),
        "first session must be fully closed: tracks stopped, handlers cleared"
    );
    assert!(!h.transport(1).closed.load(Ordering::SeqCst));
}

// --- Candidates ---

#[tokio::test]
async fn candidate_from_tracked_peer_is_applied() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(candidate_from("bob")).await;
    assert_eq!(h.transport(0).remote_candidates.lock().len(), 1);
}

#[tokio::test]
async fn candidate_from_unexpected_sender_is_dropped() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    let phase_before = h.machine.phase();

    h.deliver(candidate_from("mallory")).await;
    assert!(h.transport(0).remote_candidates.lock().is_empty());
    assert_eq!(h.machine.phase(), phase_before);
}

#[tokio::test]
async fn candidate_with_no_session_is_dropped_not_buffered() {
    let mut h = Harness::new();
    h.start_media().await;
    h.deliver(candidate_from("bob")).await;
    assert_eq!(h.machine.phase(), Phase::Ready);

    // A later call to the same peer does not replay the dropped candidate
    h.call("bob").await;
    assert!(h.transport(0).remote_candidates.lock().is_empty());
}

#[tokio::test]
async fn gathered_candidates_are_trickled_to_the_tracked_peer() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.transport_event(TransportEvent::Candidate(CandidateInit::new("candidate:1")))
        .await;

    assert_eq!(h.sink.count("candidate"), 1);
    match h.sink.sent().last().unwrap() {
        Envelope::Candidate { target, .. } => assert_eq!(target.as_deref(), Some("bob")),
        other => panic!("unexpected envelope: {:?}", other),
    }
}

// --- Hangups ---

#[tokio::test]
async fn hangup_from_non_tracked_sender_is_ignored() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;

    h.deliver(hangup_from("mallory")).await;
    assert_eq!(h.machine.phase(), Phase::Active);
}

#[tokio::test]
async fn hangup_from_tracked_peer_tears_down_without_echo() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;

    let channel = h.transport(0).channel.lock().clone().unwrap();
    h.deliver(hangup_from("bob")).await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert_eq!(h.sink.count("hangup"), 0, "received hangups are never echoed");
    assert!(h.transport(0).fully_released());
    assert!(channel.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn user_hangup_during_offering_fully_tears_down() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    assert_eq!(h.machine.phase(), Phase::Offering);

    h.command(CallCommand::HangUp).await;
    assert_eq!(h.machine.phase(), Phase::Ready, "back to camera-ready");
    assert_eq!(h.sink.count("hangup"), 1);
    assert!(h.transport(0).fully_released());
    assert_eq!(h.machine.last_peer(), Some("bob"));
    let phases = h.presenter.phases.lock().clone();
    assert!(phases.contains(&Phase::Closing), "teardown passed through Closing");
}

#[tokio::test]
async fn shutdown_notifies_peer_only_when_a_call_is_in_flight() {
    let mut h = Harness::new();
    h.start_media().await;

    // Nothing to hang up: no envelope, no nagging status
    h.command(CallCommand::Shutdown).await;
    assert!(h.sink.sent().is_empty());
    assert!(!h.presenter.status_containing("No call"));

    h.call("bob").await;
    h.deliver(answer_from("bob")).await;
    h.command(CallCommand::Shutdown).await;
    assert_eq!(h.sink.count("hangup"), 1);
    assert!(h.transport(0).fully_released());
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;

    h.command(CallCommand::HangUp).await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert_eq!(h.sink.count("hangup"), 1);

    h.command(CallCommand::HangUp).await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert_eq!(h.sink.count("hangup"), 1, "no second hangup envelope");
}

// --- Full scenario ---

#[tokio::test]
async fn call_answer_chat_hangup_scenario() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;
    assert_eq!(h.machine.phase(), Phase::Active);

    // Peer message arrives over the ordered channel
    h.transport_event(TransportEvent::ChannelOpen).await;
    assert_eq!(*h.presenter.chat_ready.lock(), vec![true]);
    h.transport_event(TransportEvent::ChannelMessage(
        r#"{"senderName":"bob","text":"hi"}"#.to_string(),
    ))
    .await;
    assert_eq!(h.machine.chat_log().len(), 1);

    h.deliver(hangup_from("bob")).await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert_eq!(h.presenter.chat_ready.lock().last(), Some(&false));
    assert!(h.machine.chat_log().is_empty(), "chat history cleared");
    assert!(h.presenter.chat_cleared.load(Ordering::SeqCst));
    assert_eq!(h.sink.count("hangup"), 0);
}

// --- Chat ---

#[tokio::test]
async fn chat_before_channel_open_is_not_transmitted() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    let channel = h.transport(0).channel.lock().clone().unwrap();

    h.command(CallCommand::SendChat {
        text: "hello".to_string(),
    })
    .await;
    assert!(channel.sent().is_empty());
    assert!(h.presenter.status_containing("not open"));

    // Channel reports open; the identical send now succeeds
    channel.set_open(true);
    h.transport_event(TransportEvent::ChannelOpen).await;
    h.command(CallCommand::SendChat {
        text: "hello".to_string(),
    })
    .await;

    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains(r#""text":"hello""#));
    assert_eq!(
        h.machine.chat_log().last().unwrap(),
        &ChatEntry::Message {
            sender: "me".to_string(),
            text: "hello".to_string(),
            own: true,
        }
    );
}

#[tokio::test]
async fn malformed_chat_payload_is_rendered_raw() {
    let mut h = Harness::new();
    h.start_media().await;
    h.deliver(offer_from("alice")).await;
    h.transport_event(TransportEvent::ChannelOpen).await;
    h.transport_event(TransportEvent::ChannelMessage("%%garbage%%".to_string()))
        .await;

    assert_eq!(
        h.machine.chat_log().last().unwrap(),
        &ChatEntry::Malformed {
            raw: "%%garbage%%".to_string()
        }
    );
}

// --- Transport state / stale events ---

#[tokio::test]
async fn terminal_failure_tears_down_but_transient_loss_does_not() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    h.deliver(answer_from("bob")).await;

    h.transport_event(TransportEvent::ConnectionState(
        ConnectionState::Disconnected,
    ))
    .await;
    assert_eq!(h.machine.phase(), Phase::Active, "transient loss is recoverable");

    h.transport_event(TransportEvent::ConnectionState(ConnectionState::Failed))
        .await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert!(h.transport(0).fully_released());
}

#[tokio::test]
async fn stale_generation_events_are_dropped() {
    let mut h = Harness::new();
    h.start_media().await;
    h.call("bob").await;
    let stale = h.machine.generation();

    // Supersede the session, then replay an event from the old one
    h.deliver(offer_from("carol")).await;
    assert_eq!(h.machine.peer(), Some("carol"));

    h.machine
        .handle(CallEvent::Transport {
            generation: stale,
            event: TransportEvent::ConnectionState(ConnectionState::Failed),
        })
        .await;
    assert_eq!(h.machine.phase(), Phase::Active, "stale failure ignored");
}

#[tokio::test]
async fn relay_error_tears_down_only_when_call_in_flight() {
    let mut h = Harness::new();
    h.start_media().await;

    // Informational when idle
    h.deliver(Envelope::Error {
        message: "Unknown target: nobody".to_string(),
    })
    .await;
    assert_eq!(h.machine.phase(), Phase::Ready);

    h.call("bob").await;
    h.deliver(Envelope::Error {
        message: "Unknown target: bob".to_string(),
    })
    .await;
    assert_eq!(h.machine.phase(), Phase::Ready);
    assert!(h.transport(0).fully_released());
}

#[tokio::test]
async fn callee_receives_channel_after_active() {
    let mut h = Harness::new();
    h.start_media().await;
    h.deliver(offer_from("alice")).await;
    assert_eq!(h.machine.phase(), Phase::Active);

    let channel = FakeChannel::new("chat");
    channel.set_open(true);
    h.transport_event(TransportEvent::ChannelReceived(channel.clone()))
        .await;
    h.transport_event(TransportEvent::ChannelOpen).await;

    h.command(CallCommand::SendChat {
        text: "late channel works".to_string(),
    })
    .await;
    assert_eq!(channel.sent().len(), 1);
}
