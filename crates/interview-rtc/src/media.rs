//! Local media tracks and capture sources.
//!
//! Capture hardware lives behind the [`MediaSource`] trait so the peer
//! connection never talks to a device directly. A source hands out encoded
//! frames; the pump tasks in `peer` feed them into sample tracks. Muting
//! flips an enabled flag that gates the pump: the underlying track is reused,
//! never replaced, so its id is stable across toggles and no renegotiation
//! happens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReadyState {
    Live,
    Ended,
}

/// What a source captures, declared before any track is created.
#[derive(Debug, Clone)]
pub struct MediaDescriptor {
    pub label: String,
    pub video: bool,
    pub audio: bool,
}

/// One encoded media frame and how long it covers.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// A camera/microphone (or stand-in) that produces encoded frames.
///
/// `open` performs the actual device acquisition and is where permission and
/// device failures surface, classified into [`MediaError`] variants.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn descriptor(&self) -> MediaDescriptor;

    async fn open(&self) -> Result<(), MediaError>;

    /// Next frame for the given kind, or `None` when the source is exhausted.
    async fn next_frame(&self, kind: TrackKind) -> Option<MediaFrame>;
}

/// A local sample track plus the flags gating its pump.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

impl LocalTrack {
    pub(crate) fn new(kind: TrackKind, stream_label: &str) -> Self {
        let (mime_type, id) = match kind {
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_label.to_owned(),
        ));
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> String {
        self.track.id().to_string()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn ready_state(&self) -> TrackReadyState {
        if self.ended.load(Ordering::SeqCst) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

/// The set of local tracks attached to one peer connection.
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub(crate) video: Option<LocalTrack>,
    pub(crate) audio: Option<LocalTrack>,
}

impl LocalMedia {
    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    pub(crate) fn mark_all_ended(&self) {
        if let Some(track) = &self.video {
            track.mark_ended();
        }
        if let Some(track) = &self.audio {
            track.mark_ended();
        }
    }
}

/// Test-pattern source: random VP8-sized video frames at ~30fps and 20ms
/// Opus-sized audio frames. Used by the loopback self-test and the tests.
pub struct SyntheticSource {
    descriptor: MediaDescriptor,
}

impl SyntheticSource {
    pub fn new(video: bool, audio: bool) -> Self {
        Self {
            descriptor: MediaDescriptor {
                label: "synthetic".to_string(),
                video,
                audio,
            },
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    fn descriptor(&self) -> MediaDescriptor {
        self.descriptor.clone()
    }

    async fn open(&self) -> Result<(), MediaError> {
        Ok(())
    }

    async fn next_frame(&self, kind: TrackKind) -> Option<MediaFrame> {
        let (interval, size) = match kind {
            TrackKind::Video => (Duration::from_millis(33), 1200),
            TrackKind::Audio => (Duration::from_millis(20), 160),
        };
        tokio::time::sleep(interval).await;
        let mut data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut data);
        Some(MediaFrame {
            data: Bytes::from(data),
            duration: interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_does_not_replace_the_track() {
        let track = LocalTrack::new(TrackKind::Video, "stream-a");
        let original_id = track.id();

        track.set_enabled(false);
        assert!(!track.is_enabled());
        track.set_enabled(true);
        assert!(track.is_enabled());

        assert_eq!(track.id(), original_id);
        assert_eq!(track.ready_state(), TrackReadyState::Live);
    }

    #[test]
    fn marking_ended_is_sticky() {
        let track = LocalTrack::new(TrackKind::Audio, "stream-a");
        track.mark_ended();
        track.mark_ended();
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
    }

    #[tokio::test]
    async fn synthetic_source_produces_frames() {
        let source = SyntheticSource::default();
        let frame = source
            .next_frame(TrackKind::Audio)
            .await
            .expect("synthetic source is infinite");
        assert!(!frame.data.is_empty());
        assert_eq!(frame.duration, Duration::from_millis(20));
    }
}
