//! The two call-site flows: the recruiter hosts, the candidate joins.
//!
//! Both flows run the same offer/answer sequence the in-process handshake
//! does, but over the relay websocket, and both sit under the reconnection
//! supervisor so a dropped call is retried with backoff instead of dying.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use interview_proto::{now_ms, ParticipantRole, ServerMessage, SignalPayload};
use interview_rtc::{
    handshake, ConnectionPhase, LocalSignalingChannel, MediaError, PeerConnection, RetryPolicy,
    RtcConfig, RtcError, Supervisor, SyntheticSource,
};

use crate::client::{RelayApi, SignalingClient};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const OFFER_WAIT: Duration = Duration::from_secs(60);

type ActiveCall = Arc<Mutex<Option<(SignalingClient, Arc<PeerConnection>)>>>;

/// Recruiter flow: create the session, send the invite, host the call.
pub async fn run_studio(
    relay_url: String,
    candidate_id: Option<String>,
    title: Option<String>,
    display_name: Option<String>,
) -> Result<()> {
    let api = RelayApi::new(&relay_url)?;
    let created = api
        .create_session(candidate_id.as_deref(), title.as_deref())
        .await
        .context("failed to create the interview session")?;

    println!("session created: {}", created.session_id);
    println!("send the candidate this invite:");
    println!("  token: {}", created.invite_token);
    println!("  url:   {}", created.invite_url);

    let active: ActiveCall = Arc::new(Mutex::new(None));
    spawn_interrupt_teardown(active.clone());

    let supervisor = Supervisor::new(RetryPolicy::default());
    let outcome = supervisor
        .run(|attempt| {
            let ws_url = created.recruiter_ws_url.clone();
            let session_id = created.session_id.clone();
            let display_name = display_name.clone();
            let active = active.clone();
            async move {
                if attempt > 1 {
                    info!(attempt, "reconnecting to the session");
                }
                recruiter_attempt(&ws_url, &session_id, display_name, &active).await
            }
        })
        .await;

    // Covers the give-up path; a clean close already emptied the slot.
    teardown_previous(&active).await;

    match outcome {
        Ok(()) => {
            println!("session ended");
            Ok(())
        }
        Err(RtcError::GaveUp { attempts }) => {
            bail!("gave up reconnecting after {attempts} attempts")
        }
        Err(err) => Err(err.into()),
    }
}

async fn recruiter_attempt(
    ws_url: &str,
    session_id: &str,
    display_name: Option<String>,
    active: &ActiveCall,
) -> Result<watch::Receiver<ConnectionPhase>, RtcError> {
    teardown_previous(active).await;

    let (client, mut incoming) = SignalingClient::connect(ws_url).await.map_err(setup)?;
    let joined = match client.join(&mut incoming, display_name).await {
        Ok(joined) => joined,
        Err(err) => {
            client.leave();
            return Err(setup(err));
        }
    };

    let pc = match PeerConnection::new(RtcConfig::new(ParticipantRole::Recruiter, session_id))
        .await
    {
        Ok(pc) => Arc::new(pc),
        Err(err) => {
            client.leave();
            return Err(err);
        }
    };

    if let Err(err) = recruiter_handshake(&pc, &client, joined.pending, incoming).await {
        client.leave();
        pc.close().await;
        return Err(err);
    }
    println!("connected");

    *active.lock().await = Some((client, pc.clone()));
    Ok(pc.phase())
}

async fn recruiter_handshake(
    pc: &Arc<PeerConnection>,
    client: &SignalingClient,
    pending: Vec<ServerMessage>,
    incoming: mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<(), RtcError> {
    attach_media(pc).await?;
    spawn_candidate_pump(pc, client, ParticipantRole::Candidate);

    let offer = pc.create_offer().await?;
    client
        .send_signal(
            ParticipantRole::Candidate,
            SignalPayload::Offer { sdp: offer },
        )
        .map_err(setup)?;
    println!("offer sent; waiting for the candidate to pick up");

    spawn_incoming_apply(pc.clone(), pending, incoming);
    pc.wait_for_connected(HANDSHAKE_TIMEOUT).await
}

/// Candidate flow: present the invite, answer the offer, join the call.
pub async fn run_join(
    relay_url: String,
    session_id: String,
    invite_token: String,
    display_name: Option<String>,
) -> Result<()> {
    // Fast local feedback before the authoritative server check.
    match invite_token::peek(&invite_token, now_ms()) {
        Ok(claims) if claims.session_id != session_id => {
            bail!(
                "this invite is for session {}, not {}",
                claims.session_id,
                session_id
            )
        }
        Ok(_) => {}
        Err(err) => bail!("this invite cannot be used: {err}"),
    }

    let api = RelayApi::new(&relay_url)?;
    let grant = api
        .join_session(&session_id, &invite_token)
        .await
        .context("the relay refused this invitation")?;
    println!("invite accepted for session {}", grant.session_id);

    let active: ActiveCall = Arc::new(Mutex::new(None));
    spawn_interrupt_teardown(active.clone());

    let supervisor = Supervisor::new(RetryPolicy::default());
    let outcome = supervisor
        .run(|attempt| {
            let ws_url = grant.ws_url.clone();
            let session_id = grant.session_id.clone();
            let display_name = display_name.clone();
            let active = active.clone();
            async move {
                if attempt > 1 {
                    info!(attempt, "reconnecting to the session");
                }
                candidate_attempt(&ws_url, &session_id, display_name, &active).await
            }
        })
        .await;

    teardown_previous(&active).await;

    match outcome {
        Ok(()) => {
            println!("session ended");
            Ok(())
        }
        Err(RtcError::GaveUp { attempts }) => {
            bail!("gave up reconnecting after {attempts} attempts")
        }
        Err(err) => Err(err.into()),
    }
}

async fn candidate_attempt(
    ws_url: &str,
    session_id: &str,
    display_name: Option<String>,
    active: &ActiveCall,
) -> Result<watch::Receiver<ConnectionPhase>, RtcError> {
    teardown_previous(active).await;

    let (client, mut incoming) = SignalingClient::connect(ws_url).await.map_err(setup)?;
    let joined = match client.join(&mut incoming, display_name).await {
        Ok(joined) => joined,
        Err(err) => {
            client.leave();
            return Err(setup(err));
        }
    };

    let pc = match PeerConnection::new(RtcConfig::new(ParticipantRole::Candidate, session_id))
        .await
    {
        Ok(pc) => Arc::new(pc),
        Err(err) => {
            client.leave();
            return Err(err);
        }
    };

    if let Err(err) = candidate_handshake(&pc, &client, joined.pending, incoming).await {
        client.leave();
        pc.close().await;
        return Err(err);
    }
    println!("connected");

    *active.lock().await = Some((client, pc.clone()));
    Ok(pc.phase())
}

async fn candidate_handshake(
    pc: &Arc<PeerConnection>,
    client: &SignalingClient,
    pending: Vec<ServerMessage>,
    mut incoming: mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<(), RtcError> {
    attach_media(pc).await?;
    spawn_candidate_pump(pc, client, ParticipantRole::Recruiter);

    let mut pending = VecDeque::from(pending);
    let offer_sdp = await_offer(pc, &mut pending, &mut incoming).await?;
    let answer = pc.create_answer(&offer_sdp).await?;
    client
        .send_signal(
            ParticipantRole::Recruiter,
            SignalPayload::Answer { sdp: answer },
        )
        .map_err(setup)?;
    println!("answer sent");

    spawn_incoming_apply(pc.clone(), Vec::from(pending), incoming);
    pc.wait_for_connected(HANDSHAKE_TIMEOUT).await
}

/// Tear down whatever the previous attempt left behind before dialing again.
/// The Leave and close free the relay's role slot and stop the old pumps; a
/// retry against an occupied slot would be refused.
async fn teardown_previous(active: &ActiveCall) {
    if let Some((client, pc)) = active.lock().await.take() {
        client.leave();
        pc.close().await;
    }
}

/// Self-test: both flows in one process over a local channel, no relay.
pub async fn run_loopback() -> Result<()> {
    let initiator = Arc::new(
        PeerConnection::new(RtcConfig::localhost(
            ParticipantRole::Recruiter,
            "loopback",
        ))
        .await?,
    );
    let responder = Arc::new(
        PeerConnection::new(RtcConfig::localhost(
            ParticipantRole::Candidate,
            "loopback",
        ))
        .await?,
    );
    attach_media(&initiator).await?;
    attach_media(&responder).await?;

    let (chan_a, chan_b) = LocalSignalingChannel::pair();
    let (a, b) = tokio::join!(
        handshake::run_initiator(initiator.clone(), chan_a, HANDSHAKE_TIMEOUT),
        handshake::run_responder(responder.clone(), chan_b, HANDSHAKE_TIMEOUT),
    );
    a?;
    b?;

    println!("loopback: both peers connected");
    initiator.close().await;
    responder.close().await;
    Ok(())
}

/// Wait (bounded) for the remote offer, starting with messages that arrived
/// before the join verdict and applying ICE that trickles in first.
async fn await_offer(
    pc: &PeerConnection,
    pending: &mut VecDeque<ServerMessage>,
    incoming: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<String, RtcError> {
    let wait = async {
        loop {
            let msg = match pending.pop_front() {
                Some(msg) => msg,
                None => match incoming.recv().await {
                    Some(msg) => msg,
                    None => return Err(RtcError::SignalingClosed),
                },
            };
            match msg {
                ServerMessage::Signal {
                    signal: SignalPayload::Offer { sdp },
                    ..
                } => return Ok(sdp),
                ServerMessage::Signal {
                    signal:
                        SignalPayload::IceCandidate {
                            candidate,
                            sdp_mid,
                            sdp_mline_index,
                        },
                    ..
                } => {
                    pc.add_ice_candidate(candidate, sdp_mid, sdp_mline_index)
                        .await?;
                }
                other => debug!(?other, "message while waiting for offer"),
            }
        }
    };
    tokio::time::timeout(OFFER_WAIT, wait)
        .await
        .map_err(|_| RtcError::HandshakeTimeout(OFFER_WAIT, "offer"))?
}

/// Forward locally gathered ICE candidates to the other role via the relay.
fn spawn_candidate_pump(pc: &PeerConnection, client: &SignalingClient, to: ParticipantRole) {
    let Some(mut candidates) = pc.take_local_candidates() else {
        warn!("local candidate stream already taken");
        return;
    };
    let client = client.clone();
    tokio::spawn(async move {
        while let Some(signal) = candidates.recv().await {
            if client.send_signal(to, signal).is_err() {
                break;
            }
        }
    });
}

/// Apply relayed signals to the connection; log presence changes. Messages
/// that arrived before the join verdict are replayed first, in order.
fn spawn_incoming_apply(
    pc: Arc<PeerConnection>,
    pending: Vec<ServerMessage>,
    mut incoming: mpsc::UnboundedReceiver<ServerMessage>,
) {
    tokio::spawn(async move {
        for msg in pending {
            apply_relay_message(&pc, msg).await;
        }
        while let Some(msg) = incoming.recv().await {
            if pc.is_closed() {
                break;
            }
            apply_relay_message(&pc, msg).await;
        }
    });
}

async fn apply_relay_message(pc: &PeerConnection, msg: ServerMessage) {
    match msg {
        ServerMessage::Signal { signal, .. } => {
            let kind = signal.kind();
            if let Err(err) = pc.apply_remote(signal).await {
                warn!(%err, %kind, "failed to apply remote signal");
            }
        }
        ServerMessage::PeerJoined { role, display_name } => {
            info!(%role, ?display_name, "peer joined");
        }
        ServerMessage::PeerLeft { role } => {
            info!(%role, "peer left");
        }
        ServerMessage::Error { message } => {
            warn!(%message, "relay reported an error");
        }
        ServerMessage::Pong => {}
        other => debug!(?other, "unexpected relay message"),
    }
}

async fn attach_media(pc: &PeerConnection) -> Result<(), RtcError> {
    // Capture devices plug in behind MediaSource; the synthetic source keeps
    // the flows runnable anywhere.
    match pc.attach_local_media(Arc::new(SyntheticSource::default())).await {
        Ok(_) => Ok(()),
        Err(err) => {
            eprintln!("{}", describe_media_error(&err));
            Err(err.into())
        }
    }
}

fn describe_media_error(err: &MediaError) -> String {
    match err {
        MediaError::DeviceNotFound(device) => {
            format!("no capture device found ({device}); plug one in and retry")
        }
        MediaError::PermissionDenied(device) => {
            format!("access to the capture device was denied ({device})")
        }
        MediaError::Unsupported(detail) => format!("capture is not supported here: {detail}"),
        MediaError::Other(detail) => format!("media setup failed: {detail}"),
    }
}

fn setup(err: anyhow::Error) -> RtcError {
    RtcError::Setup(err.to_string())
}

/// Ctrl-C tears the active call down cleanly; the supervisor then sees a
/// deliberate close and stops instead of retrying.
fn spawn_interrupt_teardown(active: ActiveCall) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            teardown_previous(&active).await;
            println!("hanging up");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use interview_proto::ClientMessage;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[tokio::test]
    async fn retrying_frees_the_previous_connection_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Stand-in relay: report whether the client announced Leave before
        // the socket went away.
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let WsMessage::Text(text) = frame {
                    if matches!(
                        serde_json::from_str::<ClientMessage>(text.as_str()),
                        Ok(ClientMessage::Leave)
                    ) {
                        return true;
                    }
                }
            }
            false
        });

        let (client, _incoming) = SignalingClient::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let pc = Arc::new(
            PeerConnection::new(RtcConfig::localhost(ParticipantRole::Recruiter, "sess-retry"))
                .await
                .unwrap(),
        );
        let active: ActiveCall = Arc::new(Mutex::new(Some((client, pc.clone()))));

        // What every new attempt does before dialing.
        teardown_previous(&active).await;

        assert!(pc.is_closed());
        assert!(active.lock().await.is_none());
        assert!(relay.await.unwrap(), "relay never saw the Leave");
    }
}
