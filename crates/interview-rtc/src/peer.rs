//! The peer-connection manager.
//!
//! One [`PeerConnection`] owns one native connection for one participant in
//! one session. Construction is initialization: handlers for state
//! transitions, locally gathered ICE candidates, and remote track arrival
//! are registered before the value is handed to the caller, so there is no
//! separate init step to call twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use interview_proto::{ParticipantRole, SignalPayload};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::config::RtcConfig;
use crate::error::{MediaError, RtcError};
use crate::media::{LocalMedia, LocalTrack, MediaSource, TrackKind};

/// Observed lifecycle of the native connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionPhase {
    fn from_native(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(ConnectionPhase::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionPhase::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionPhase::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionPhase::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionPhase::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionPhase::Closed),
            RTCPeerConnectionState::Unspecified => None,
        }
    }
}

/// Notification that a remote media track started arriving.
#[derive(Debug, Clone)]
pub struct RemoteTrackInfo {
    pub kind: TrackKind,
    pub ssrc: u32,
}

pub struct PeerConnection {
    config: RtcConfig,
    pc: Arc<RTCPeerConnection>,
    phase_tx: Arc<watch::Sender<ConnectionPhase>>,
    phase_rx: watch::Receiver<ConnectionPhase>,
    local_candidates: Mutex<Option<mpsc::UnboundedReceiver<SignalPayload>>>,
    remote_tracks: Mutex<Option<mpsc::UnboundedReceiver<RemoteTrackInfo>>>,
    // Remote tracks of a kind nobody asked for yet, held for a later
    // await_remote of that kind.
    seen_remote: Mutex<Vec<RemoteTrackInfo>>,
    media: Mutex<Option<LocalMedia>>,
    // ICE candidates that arrived before the remote description; flushed once
    // a description is applied (trickling tolerates either ordering).
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    has_remote_description: AtomicBool,
    stop_pumps: Arc<Notify>,
    closed: AtomicBool,
}

impl PeerConnection {
    /// Build the native connection and register all callbacks.
    pub async fn new(config: RtcConfig) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| RtcError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::New);
        let phase_tx = Arc::new(phase_tx);

        let phase_for_state = phase_tx.clone();
        let session_for_state = config.session_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let phase_tx = phase_for_state.clone();
            let session_id = session_for_state.clone();
            Box::pin(async move {
                debug!(session = %session_id, ?state, "peer connection state changed");
                if let Some(phase) = ConnectionPhase::from_native(state) {
                    let _ = phase_tx.send(phase);
                }
            })
        }));

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(SignalPayload::IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                    Err(err) => warn!(%err, "failed to serialize local ice candidate"),
                }
            })
        }));

        let (track_tx, track_rx) = mpsc::unbounded_channel();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Unspecified => return,
                };
                let _ = track_tx.send(RemoteTrackInfo {
                    kind,
                    ssrc: track.ssrc(),
                });
            })
        }));

        Ok(Self {
            config,
            pc,
            phase_tx,
            phase_rx,
            local_candidates: Mutex::new(Some(candidate_rx)),
            remote_tracks: Mutex::new(Some(track_rx)),
            seen_remote: Mutex::new(Vec::new()),
            media: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            has_remote_description: AtomicBool::new(false),
            stop_pumps: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> ParticipantRole {
        self.config.role
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// Watch channel of observed connection phases.
    pub fn phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_rx.clone()
    }

    /// Locally gathered ICE candidates, as signaling payloads ready to relay.
    /// Single consumer: the first call takes the receiver.
    pub fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<SignalPayload>> {
        self.local_candidates.lock().take()
    }

    /// Remote track arrival notifications. Single consumer; exclusive with
    /// [`PeerConnection::await_remote`].
    pub fn take_remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<RemoteTrackInfo>> {
        self.remote_tracks.lock().take()
    }

    /// Wait until a remote track of `kind` starts arriving, bounded by
    /// `timeout`. Tracks of the other kind seen along the way are kept for a
    /// later call.
    pub async fn await_remote(
        &self,
        kind: TrackKind,
        timeout: Duration,
    ) -> Result<RemoteTrackInfo, RtcError> {
        {
            let mut seen = self.seen_remote.lock();
            if let Some(pos) = seen.iter().position(|t| t.kind == kind) {
                return Ok(seen.remove(pos));
            }
        }

        let mut rx = {
            let taken = self.remote_tracks.lock().take();
            match taken {
                Some(rx) => rx,
                None => return Err(RtcError::Setup("remote track stream already taken".into())),
            }
        };

        let wait = async {
            loop {
                match rx.recv().await {
                    Some(info) if info.kind == kind => return Ok(info),
                    Some(info) => self.seen_remote.lock().push(info),
                    None => return Err(RtcError::Closed),
                }
            }
        };
        let result = tokio::time::timeout(timeout, wait).await;
        *self.remote_tracks.lock() = Some(rx);
        result.map_err(|_| RtcError::HandshakeTimeout(timeout, "remote track"))?
    }

    /// Open the source and attach its tracks to the connection.
    ///
    /// Each attached track gets a pump task that feeds source frames into the
    /// sample track while the track is enabled. The pumps stop on `close()`.
    pub async fn attach_local_media(
        &self,
        source: Arc<dyn MediaSource>,
    ) -> Result<LocalMedia, MediaError> {
        source.open().await?;
        let descriptor = source.descriptor();
        if !descriptor.video && !descriptor.audio {
            return Err(MediaError::Other(format!(
                "source '{}' captures neither video nor audio",
                descriptor.label
            )));
        }

        let mut media = LocalMedia::default();
        if descriptor.video {
            media.video = Some(
                self.attach_track(TrackKind::Video, &descriptor.label, source.clone())
                    .await?,
            );
        }
        if descriptor.audio {
            media.audio = Some(
                self.attach_track(TrackKind::Audio, &descriptor.label, source.clone())
                    .await?,
            );
        }

        *self.media.lock() = Some(media.clone());
        Ok(media)
    }

    async fn attach_track(
        &self,
        kind: TrackKind,
        stream_label: &str,
        source: Arc<dyn MediaSource>,
    ) -> Result<LocalTrack, MediaError> {
        let local = LocalTrack::new(kind, stream_label);
        let sample_track = local.sample_track();
        self.pc
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| MediaError::Other(err.to_string()))?;

        let pump_track = local.clone();
        let stop = self.stop_pumps.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    frame = source.next_frame(kind) => {
                        let Some(frame) = frame else { break };
                        if pump_track.is_ended() {
                            break;
                        }
                        // Muted: drop the frame but keep consuming so the
                        // source's pacing is undisturbed.
                        if !pump_track.is_enabled() {
                            continue;
                        }
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        if let Err(err) = sample_track.write_sample(&sample).await {
                            debug!(%err, ?kind, "dropping sample");
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    /// Flip the enabled flag on the local video track. Returns false when no
    /// video track is attached. No renegotiation happens.
    pub fn toggle_video(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Video, enabled)
    }

    /// Flip the enabled flag on the local audio track.
    pub fn toggle_audio(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Audio, enabled)
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) -> bool {
        let media = self.media.lock();
        match media.as_ref().and_then(|m| m.track(kind)) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Attached local media, if any.
    pub fn local_media(&self) -> Option<LocalMedia> {
        self.media.lock().clone()
    }

    /// Create an SDP offer and set it as the local description.
    pub async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Apply a remote offer, then create an SDP answer and set it as the
    /// local description.
    pub async fn create_answer(&self, offer_sdp: &str) -> Result<String, RtcError> {
        self.set_remote_offer(offer_sdp).await?;
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(sdp)
    }

    pub async fn set_remote_offer(&self, sdp: &str) -> Result<(), RtcError> {
        let desc = RTCSessionDescription::offer(sdp.to_string())?;
        self.set_remote_description(desc).await
    }

    pub async fn set_remote_answer(&self, sdp: &str) -> Result<(), RtcError> {
        let desc = RTCSessionDescription::answer(sdp.to_string())?;
        self.set_remote_description(desc).await
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), RtcError> {
        self.pc.set_remote_description(desc).await?;
        self.has_remote_description.store(true, Ordering::SeqCst);
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock());
        for init in pending {
            if let Err(err) = self.pc.add_ice_candidate(init).await {
                warn!(%err, "failed to apply buffered ice candidate");
            }
        }
        Ok(())
    }

    /// Apply a remotely received ICE candidate. Candidates arriving before
    /// the remote description are buffered, not rejected.
    pub async fn add_ice_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        };
        if !self.has_remote_description.load(Ordering::SeqCst) {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Apply a remote signaling payload of any kind.
    pub async fn apply_remote(&self, signal: SignalPayload) -> Result<(), RtcError> {
        match signal {
            SignalPayload::Offer { sdp } => self.set_remote_offer(&sdp).await,
            SignalPayload::Answer { sdp } => self.set_remote_answer(&sdp).await,
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.add_ice_candidate(candidate, sdp_mid, sdp_mline_index)
                    .await
            }
        }
    }

    /// Wait until the connection reaches `Connected`, bounded by `timeout`.
    pub async fn wait_for_connected(&self, timeout: Duration) -> Result<(), RtcError> {
        let mut phases = self.phase_rx.clone();
        let wait = async {
            loop {
                let phase = *phases.borrow_and_update();
                match phase {
                    ConnectionPhase::Connected => return Ok(()),
                    ConnectionPhase::Failed => return Err(RtcError::ConnectionFailed),
                    ConnectionPhase::Closed => return Err(RtcError::Closed),
                    _ => {}
                }
                if phases.changed().await.is_err() {
                    return Err(RtcError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RtcError::HandshakeTimeout(timeout, "connected"))?
    }

    /// Tear the connection down. Idempotent; called on every teardown path.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_pumps.notify_waiters();
        if let Some(media) = self.media.lock().as_ref() {
            media.mark_all_ended();
        }
        if let Err(err) = self.pc.close().await {
            debug!(%err, "error closing peer connection");
        }
        let _ = self.phase_tx.send(ConnectionPhase::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SyntheticSource, TrackReadyState};
    use interview_proto::ParticipantRole;

    fn localhost_config() -> RtcConfig {
        RtcConfig::localhost(ParticipantRole::Recruiter, "sess-test")
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_tracks() {
        let pc = PeerConnection::new(localhost_config()).await.unwrap();
        let media = pc
            .attach_local_media(Arc::new(SyntheticSource::default()))
            .await
            .unwrap();

        pc.close().await;
        pc.close().await;

        assert!(pc.is_closed());
        assert_eq!(
            media.video().unwrap().ready_state(),
            TrackReadyState::Ended
        );
        assert_eq!(
            media.audio().unwrap().ready_state(),
            TrackReadyState::Ended
        );
    }

    #[tokio::test]
    async fn toggling_video_preserves_track_id() {
        let pc = PeerConnection::new(localhost_config()).await.unwrap();
        let media = pc
            .attach_local_media(Arc::new(SyntheticSource::default()))
            .await
            .unwrap();
        let before = media.video().unwrap().id();

        assert!(pc.toggle_video(false));
        assert!(!media.video().unwrap().is_enabled());
        assert!(pc.toggle_video(true));

        let after = pc.local_media().unwrap().video().unwrap().id();
        assert_eq!(before, after);
        pc.close().await;
    }

    #[tokio::test]
    async fn toggle_without_media_reports_absence() {
        let pc = PeerConnection::new(localhost_config()).await.unwrap();
        assert!(!pc.toggle_video(false));
        assert!(!pc.toggle_audio(false));
        pc.close().await;
    }

    #[tokio::test]
    async fn early_ice_candidates_are_buffered_not_rejected() {
        let pc = PeerConnection::new(localhost_config()).await.unwrap();
        // No remote description yet: this must not error.
        pc.add_ice_candidate(
            "candidate:0 1 UDP 2122252543 127.0.0.1 54321 typ host".into(),
            Some("0".into()),
            Some(0),
        )
        .await
        .unwrap();
        pc.close().await;
    }
}
