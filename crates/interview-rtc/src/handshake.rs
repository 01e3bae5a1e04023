//! Offer/answer sequencing over a signaling channel.
//!
//! These drive one side each of the handshake: the initiator offers, the
//! responder waits for the offer and answers, both trickle ICE as candidates
//! are gathered. The relay flows in the studio binary follow the same
//! sequence over the websocket; these run it over a
//! [`LocalSignalingChannel`] for tests and the loopback self-test.

use std::sync::Arc;
use std::time::Duration;

use interview_proto::{SignalKind, SignalPayload};
use tracing::{debug, warn};

use crate::channel::LocalSignalingChannel;
use crate::error::RtcError;
use crate::peer::PeerConnection;

/// Run the initiator side: offer, then apply the answer and remote ICE until
/// the connection is up or the timeout expires.
pub async fn run_initiator(
    pc: Arc<PeerConnection>,
    chan: LocalSignalingChannel,
    timeout: Duration,
) -> Result<(), RtcError> {
    spawn_candidate_pump(&pc, chan.clone());

    let offer = pc.create_offer().await?;
    chan.send(SignalPayload::Offer { sdp: offer })?;
    debug!(session = pc.session_id(), "offer sent");

    spawn_remote_apply(pc.clone(), chan);
    pc.wait_for_connected(timeout).await
}

/// Run the responder side: wait (bounded) for the offer, answer, then apply
/// remote ICE until connected.
pub async fn run_responder(
    pc: Arc<PeerConnection>,
    chan: LocalSignalingChannel,
    timeout: Duration,
) -> Result<(), RtcError> {
    spawn_candidate_pump(&pc, chan.clone());

    let offer_sdp = await_offer(&pc, &chan, timeout).await?;
    let answer = pc.create_answer(&offer_sdp).await?;
    chan.send(SignalPayload::Answer { sdp: answer })?;
    debug!(session = pc.session_id(), "answer sent");

    spawn_remote_apply(pc.clone(), chan);
    pc.wait_for_connected(timeout).await
}

/// Wait for the remote offer, applying any ICE candidates that arrive first.
async fn await_offer(
    pc: &PeerConnection,
    chan: &LocalSignalingChannel,
    timeout: Duration,
) -> Result<String, RtcError> {
    let wait = async {
        loop {
            match chan.recv().await {
                Some(SignalPayload::Offer { sdp }) => return Ok(sdp),
                Some(SignalPayload::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                }) => {
                    pc.add_ice_candidate(candidate, sdp_mid, sdp_mline_index)
                        .await?;
                }
                Some(other) => {
                    warn!(kind = %other.kind(), "ignoring unexpected signal while waiting for offer");
                }
                None => return Err(RtcError::SignalingClosed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| RtcError::HandshakeTimeout(timeout, "offer"))?
}

/// Forward locally gathered ICE candidates into the channel.
fn spawn_candidate_pump(pc: &PeerConnection, chan: LocalSignalingChannel) {
    let Some(mut candidates) = pc.take_local_candidates() else {
        warn!("local candidate stream already taken");
        return;
    };
    tokio::spawn(async move {
        while let Some(signal) = candidates.recv().await {
            if chan.send(signal).is_err() {
                break;
            }
        }
    });
}

/// Apply everything else the channel delivers (answer, trickled ICE).
fn spawn_remote_apply(pc: Arc<PeerConnection>, chan: LocalSignalingChannel) {
    tokio::spawn(async move {
        while let Some(signal) = chan.recv().await {
            if pc.is_closed() {
                break;
            }
            let kind = signal.kind();
            if let Err(err) = pc.apply_remote(signal).await {
                // Not fatal to the session: log and keep applying.
                warn!(%err, %kind, "failed to apply remote signal");
                if matches!(kind, SignalKind::Answer) {
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtcConfig;
    use crate::media::{SyntheticSource, TrackKind};
    use crate::peer::ConnectionPhase;
    use interview_proto::ParticipantRole;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

    async fn peer(role: ParticipantRole) -> Arc<PeerConnection> {
        let pc = PeerConnection::new(RtcConfig::localhost(role, "sess-handshake"))
            .await
            .expect("failed to build peer connection");
        pc.attach_local_media(Arc::new(SyntheticSource::default()))
            .await
            .expect("failed to attach synthetic media");
        Arc::new(pc)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn both_sides_reach_connected() {
        let initiator = peer(ParticipantRole::Recruiter).await;
        let responder = peer(ParticipantRole::Candidate).await;
        let (chan_a, chan_b) = LocalSignalingChannel::pair();

        let (a, b) = tokio::join!(
            run_initiator(initiator.clone(), chan_a, CONNECT_TIMEOUT),
            run_responder(responder.clone(), chan_b, CONNECT_TIMEOUT),
        );
        a.expect("initiator failed to connect");
        b.expect("responder failed to connect");

        // Symmetry: both phase watchers report Connected.
        assert_eq!(*initiator.phase().borrow(), ConnectionPhase::Connected);
        assert_eq!(*responder.phase().borrow(), ConnectionPhase::Connected);

        // And the responder's media actually reaches the initiator.
        let video = initiator
            .await_remote(TrackKind::Video, CONNECT_TIMEOUT)
            .await
            .expect("remote video track never arrived");
        assert_eq!(video.kind, TrackKind::Video);

        initiator.close().await;
        responder.close().await;
    }

    #[tokio::test]
    async fn responder_times_out_without_an_offer() {
        let responder = peer(ParticipantRole::Candidate).await;
        let (chan_a, _chan_b) = LocalSignalingChannel::pair();

        let err = run_responder(responder.clone(), chan_a, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::HandshakeTimeout(_, "offer")));
        responder.close().await;
    }
}
