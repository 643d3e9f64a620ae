//! Local media acquisition
//!
//! Capture devices are an external collaborator, reached through the
//! [`MediaSource`] trait. The acquisition policy lives here: attempt
//! audio+video first, retry audio-only when the failure is classified as
//! video-specific, and fail outright when no media device is usable at all.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Requested capture capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        video: true,
        audio: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        video: false,
        audio: true,
    };
}

/// Classified acquisition failure
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// The camera (or video pipeline) is unavailable; audio may still work
    #[error("Video device unavailable: {0}")]
    VideoUnavailable(String),

    /// No usable media device at all; acquisition cannot proceed
    #[error("No media device: {0}")]
    NoDevice(String),

    /// Backend failure unrelated to device presence
    #[error("Media backend error: {0}")]
    Backend(String),
}

/// Handle to acquired local media
///
/// Owns the local tracks until the session (or the user) releases them.
#[derive(Clone)]
pub struct LocalMedia {
    /// Local tracks to attach to a transport session
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    /// Whether a video track is actually active (false after audio-only fallback)
    pub has_video: bool,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks.len())
            .field("has_video", &self.has_video)
            .finish()
    }
}

/// External capture interface
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local media for the given constraints
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Two-tier acquisition: audio+video, falling back to audio-only on
/// video-classified failures.
///
/// Only [`MediaError::VideoUnavailable`] triggers the fallback; a total
/// device failure propagates so the caller stays idle and surfaces the error.
pub async fn acquire_with_fallback(source: &dyn MediaSource) -> Result<LocalMedia, MediaError> {
    match source.acquire(MediaConstraints::AUDIO_VIDEO).await {
        Ok(media) => {
            info!(has_video = media.has_video, "acquired audio+video media");
            Ok(media)
        }
        Err(MediaError::VideoUnavailable(reason)) => {
            warn!(%reason, "video unavailable, retrying audio-only");
            let media = source.acquire(MediaConstraints::AUDIO_ONLY).await?;
            info!("acquired audio-only media");
            Ok(media)
        }
        Err(err) => Err(err),
    }
}

/// Codec capability for the audio track (Opus)
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Codec capability for the video track (VP8)
pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Media source that creates placeholder tracks without touching devices.
///
/// Real capture is out of scope for this crate; the synthetic source gives
/// the binary negotiable audio/video tracks so calls can be established and
/// exercised end to end.
#[derive(Debug, Default)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = vec![];

        if constraints.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                audio_codec_capability(),
                "audio0".to_string(),
                "parley-local".to_string(),
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                video_codec_capability(),
                "video0".to_string(),
                "parley-local".to_string(),
            )));
        }

        if tracks.is_empty() {
            return Err(MediaError::NoDevice("no capability requested".to_string()));
        }

        Ok(LocalMedia {
            tracks,
            has_video: constraints.video,
        })
    }
}
