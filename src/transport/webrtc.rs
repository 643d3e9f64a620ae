//! WebRTC-backed transport session
//!
//! Wraps a peer connection from the `webrtc` crate behind the
//! [`SessionTransport`] seam: standard media engine and interceptors, ICE
//! servers from configuration, and event handlers that funnel candidate,
//! track, connection-state, and data-channel callbacks into the session
//! machine's event sink.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::{
    ConnectionState, EventSink, OrderedChannel, SessionTransport, TrackKind, TransportEvent,
    TransportFactory,
};
use crate::config::IceConfig;
use crate::media::LocalMedia;
use crate::signaling::envelope::{CandidateInit, SdpKind, SessionDescription};
use crate::{AppError, Result};

/// Builds WebRTC peer connections from ICE configuration
pub struct WebRtcFactory {
    ice: IceConfig,
}

impl WebRtcFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![];
        for stun_url in &self.ice.stun_servers {
            servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &self.ice.turn_servers {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn SessionTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::TransportError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::TransportError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::TransportError(format!("Failed to create peer connection: {}", e))
        })?;

        let transport = WebRtcTransport {
            pc: Arc::new(pc),
            generation: sink.generation(),
        };
        transport.register_handlers(sink);

        debug!(generation = transport.generation, "peer connection created");
        Ok(Arc::new(transport))
    }
}

/// Peer connection wrapper with event forwarding
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    generation: u64,
}

impl WebRtcTransport {
    fn register_handlers(&self, sink: EventSink) {
        // Connection state change handler
        let state_sink = sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return Box::pin(async {}),
                };
                info!("peer connection state: {}", new_state);
                state_sink.emit(TransportEvent::ConnectionState(new_state));
                Box::pin(async {})
            }));

        // ICE candidate handler: trickle every gathered candidate
        let candidate_sink = sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            debug!(candidate = %init.candidate, "gathered ICE candidate");
                            candidate_sink.emit(TransportEvent::Candidate(CandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("failed to serialize ICE candidate: {}", e),
                    }
                } else {
                    debug!("ICE candidate gathering complete");
                }
                Box::pin(async {})
            }));

        // Remote track handler
        let track_sink = sink.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return Box::pin(async {}),
            };
            info!(?kind, "remote track received");
            track_sink.emit(TransportEvent::RemoteTrack(kind));
            Box::pin(async {})
        }));

        // Inbound data channel handler (callee side). Handlers are bound
        // immediately: the channel may open before the machine stores it.
        let channel_sink = sink;
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!(label = %dc.label(), "data channel received from peer");
                let channel: Arc<dyn OrderedChannel> = Arc::new(WebRtcChannel::new(dc));
                channel.bind_events(channel_sink.clone());
                channel_sink.emit(TransportEvent::ChannelReceived(channel));
                Box::pin(async {})
            }));
    }
}

#[async_trait]
impl SessionTransport for WebRtcTransport {
    async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        for track in &media.tracks {
            self.pc
                .add_track(Arc::clone(track))
                .await
                .map_err(|e| AppError::TransportError(format!("Failed to add track: {}", e)))?;
        }
        debug!(tracks = media.tracks.len(), "local tracks attached");
        Ok(())
    }

    async fn create_ordered_channel(&self, label: &str) -> Result<Arc<dyn OrderedChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                AppError::TransportError(format!("Failed to create data channel: {}", e))
            })?;
        info!(%label, "ordered data channel created");
        Ok(Arc::new(WebRtcChannel::new(dc)))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::NegotiationError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::NegotiationError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let sdp = to_rtc_description(&description)?;
        self.pc.set_local_description(sdp).await.map_err(|e| {
            AppError::NegotiationError(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let sdp = to_rtc_description(&description)?;
        self.pc.set_remote_description(sdp).await.map_err(|e| {
            AppError::NegotiationError(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::TransportError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn detach_events(&self) {
        // Replace every handler with a no-op so a closing connection cannot
        // call back into a torn-down session.
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        debug!(generation = self.generation, "transport handlers detached");
    }

    async fn stop_senders(&self) {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                warn!("failed to stop sender: {}", e);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::TransportError(format!("Failed to close connection: {}", e)))
    }
}

/// Ordered channel over an RTCDataChannel
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        let label = dc.label().to_string();
        Self { dc, label }
    }
}

#[async_trait]
impl OrderedChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| AppError::ChatError(format!("Failed to send on data channel: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| AppError::TransportError(format!("Failed to close data channel: {}", e)))
    }

    fn bind_events(&self, sink: EventSink) {
        let open_sink = sink.clone();
        let label = self.label.clone();
        self.dc.on_open(Box::new(move || {
            info!(%label, "data channel open");
            open_sink.emit(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let close_sink = sink.clone();
        self.dc.on_close(Box::new(move || {
            close_sink.emit(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let error_sink = sink.clone();
        self.dc.on_error(Box::new(move |e| {
            warn!("data channel error: {}", e);
            error_sink.emit(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            sink.emit(TransportEvent::ChannelMessage(text));
            Box::pin(async {})
        }));
    }
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(|e| AppError::NegotiationError(format!("Invalid SDP: {}", e)))
}
