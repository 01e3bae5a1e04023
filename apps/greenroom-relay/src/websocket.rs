use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use interview_proto::{
    ClientMessage, ParticipantRole, PeerSummary, ServerMessage, SignalEnvelope, SignalPayload,
};

use crate::handlers::SharedStorage;

/// Connection state for one live participant.
#[derive(Clone)]
struct PeerHandle {
    display_name: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    joined_at: i64,
}

/// In-memory view of who is connected where.
///
/// Delivery is scoped here: a message addressed to a role reaches that
/// role's channel in that session or nothing at all. A listener never sees
/// traffic for the other role or another session.
#[derive(Clone, Default)]
pub struct LiveSessions {
    sessions: Arc<DashMap<String, DashMap<ParticipantRole, PeerHandle>>>,
}

impl LiveSessions {
    /// Register a peer. At most one live connection per (session, role).
    fn try_add_peer(
        &self,
        session_id: &str,
        role: ParticipantRole,
        handle: PeerHandle,
    ) -> Result<(), RoleOccupied> {
        let peers = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(DashMap::new);
        let result = match peers.entry(role) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RoleOccupied),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        };
        result
    }

    fn remove_peer(&self, session_id: &str, role: ParticipantRole) {
        let mut remove_session = false;

        if let Some(peers) = self.sessions.get(session_id) {
            peers.remove(&role);
            // Avoid holding the guard when deciding to drop the session entry.
            remove_session = peers.is_empty();
        }

        if remove_session {
            self.sessions.remove(session_id);
        }
    }

    fn peer_summaries(&self, session_id: &str) -> Vec<PeerSummary> {
        self.sessions
            .get(session_id)
            .map(|peers| {
                peers
                    .iter()
                    .map(|entry| PeerSummary {
                        role: *entry.key(),
                        display_name: entry.display_name.clone(),
                        joined_at: entry.joined_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send to the addressed role's live connection. Returns false when that
    /// role is not connected (caller queues the message instead).
    fn deliver(&self, session_id: &str, to: ParticipantRole, message: ServerMessage) -> bool {
        let Some(peers) = self.sessions.get(session_id) else {
            return false;
        };
        let Some(peer) = peers.get(&to) else {
            return false;
        };
        peer.tx.send(message).is_ok()
    }

    fn heartbeat_of(&self, session_id: &str, role: ParticipantRole) -> Option<Arc<RwLock<Instant>>> {
        self.sessions
            .get(session_id)
            .and_then(|peers| peers.get(&role).map(|peer| peer.last_heartbeat.clone()))
    }

    fn all_peers(&self) -> Vec<(String, ParticipantRole, Arc<RwLock<Instant>>)> {
        let mut out = Vec::new();
        for session in self.sessions.iter() {
            for peer in session.value().iter() {
                out.push((
                    session.key().clone(),
                    *peer.key(),
                    peer.last_heartbeat.clone(),
                ));
            }
        }
        out
    }
}

struct RoleOccupied;

/// Global websocket signaling state.
#[derive(Clone)]
pub struct SignalingState {
    live: LiveSessions,
    storage: SharedStorage,
    heartbeat_timeout: Duration,
}

impl SignalingState {
    pub fn new(storage: SharedStorage, heartbeat_timeout: Duration) -> Self {
        let state = Self {
            live: LiveSessions::default(),
            storage,
            heartbeat_timeout,
        };

        let monitor = state.clone();
        tokio::spawn(async move {
            monitor.monitor_heartbeats().await;
        });

        state
    }

    /// Reap peers whose heartbeat went stale and tell the other side.
    async fn monitor_heartbeats(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;

            let mut stale = Vec::new();
            // Collect heartbeat locks first to avoid holding DashMap guards
            // across await.
            for (session_id, role, heartbeat) in self.live.all_peers() {
                let last = *heartbeat.read().await;
                if last.elapsed() > self.heartbeat_timeout {
                    stale.push((session_id, role));
                }
            }

            for (session_id, role) in stale {
                info!(session = %session_id, %role, "removing stale peer (heartbeat timeout)");
                self.live.remove_peer(&session_id, role);
                self.live
                    .deliver(&session_id, role.opposite(), ServerMessage::PeerLeft { role });
            }
        }
    }
}

/// WebSocket upgrade handler for `/ws/:session_id/:role`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path((session_id, role)): Path<(String, String)>,
    State(state): State<SignalingState>,
) -> Response {
    let role: ParticipantRole = match role.parse() {
        Ok(role) => role,
        Err(err) => {
            warn!(%err, "rejecting websocket with unknown role");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, role, state))
}

async fn handle_socket(
    socket: WebSocket,
    session_id: String,
    role: ParticipantRole,
    state: SignalingState,
) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Forward outbound messages from the channel to the socket.
    let forward_session = session_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(session = %forward_session, "sender task ended");
    });

    debug!(session = %session_id, %role, "websocket connected");

    let mut joined = false;
    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!(session = %session_id, %role, "websocket error: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    match handle_client_message(client_msg, &session_id, role, &state, &tx, &mut joined)
                        .await
                    {
                        Ok(LoopControl::Continue) => {}
                        Ok(LoopControl::Stop) => break,
                        Err(e) => {
                            error!(session = %session_id, %role, "error handling message: {}", e);
                            let _ = tx.send(ServerMessage::Error {
                                message: format!("failed to process message: {}", e),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(session = %session_id, %role, "malformed client message: {}", e);
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("invalid message format: {}", e),
                    });
                }
            },
            Message::Close(_) => {
                debug!(session = %session_id, %role, "received close frame");
                break;
            }
            // Ping/Pong/Binary frames are not part of the protocol.
            _ => {}
        }
    }

    if joined {
        state.live.remove_peer(&session_id, role);
        state
            .live
            .deliver(&session_id, role.opposite(), ServerMessage::PeerLeft { role });
    }

    debug!(session = %session_id, %role, "websocket disconnected");
}

enum LoopControl {
    Continue,
    Stop,
}

/// Admission decision for a websocket join, separate from transport and
/// storage. Recruiters are admitted on session existence alone; candidates
/// are additionally refused once their invite is revoked.
fn admission(
    session_found: bool,
    invite_revoked: bool,
    role: ParticipantRole,
) -> Result<(), &'static str> {
    if !session_found {
        return Err("unknown_session");
    }
    if role == ParticipantRole::Candidate && invite_revoked {
        return Err("invite_revoked");
    }
    Ok(())
}

async fn handle_client_message(
    message: ClientMessage,
    session_id: &str,
    role: ParticipantRole,
    state: &SignalingState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    joined: &mut bool,
) -> anyhow::Result<LoopControl> {
    match message {
        ClientMessage::Join { display_name } => {
            if *joined {
                tx.send(ServerMessage::Error {
                    message: "already joined".to_string(),
                })?;
                return Ok(LoopControl::Continue);
            }

            let session = state.storage.get_session(session_id).await?;
            let revoked = match (&session, role) {
                // The ws URL is derivable from the session id alone, so the
                // revocation set has to be enforced here too, not only at
                // the HTTP join step.
                (Some(info), ParticipantRole::Candidate) => {
                    state
                        .storage
                        .is_invite_revoked(session_id, &info.candidate_id)
                        .await?
                }
                _ => false,
            };
            if let Err(reason) = admission(session.is_some(), revoked, role) {
                tx.send(ServerMessage::JoinError {
                    reason: reason.to_string(),
                })?;
                return Ok(LoopControl::Stop);
            }

            let handle = PeerHandle {
                display_name: display_name.clone(),
                tx: tx.clone(),
                last_heartbeat: Arc::new(RwLock::new(Instant::now())),
                joined_at: interview_proto::now_ms(),
            };
            if state.live.try_add_peer(session_id, role, handle).is_err() {
                tx.send(ServerMessage::JoinError {
                    reason: "role_occupied".to_string(),
                })?;
                return Ok(LoopControl::Stop);
            }
            *joined = true;

            let _ = state.storage.update_session_ttl(session_id).await;

            let peers = state
                .live
                .peer_summaries(session_id)
                .into_iter()
                .filter(|p| p.role != role)
                .collect();
            tx.send(ServerMessage::JoinSuccess {
                session_id: session_id.to_string(),
                role,
                peers,
            })?;

            // Flush signals queued while this role was offline, in order.
            let backlog = state.storage.drain_inbox(session_id, role).await?;
            if !backlog.is_empty() {
                info!(
                    session = %session_id,
                    %role,
                    count = backlog.len(),
                    "flushing queued signals"
                );
            }
            for envelope in backlog {
                tx.send(ServerMessage::Signal {
                    from: envelope.from,
                    signal: envelope.signal,
                })?;
            }

            state.live.deliver(
                session_id,
                role.opposite(),
                ServerMessage::PeerJoined { role, display_name },
            );
        }

        ClientMessage::Signal { to, signal } => {
            if !*joined {
                tx.send(ServerMessage::Error {
                    message: "join before signaling".to_string(),
                })?;
                return Ok(LoopControl::Continue);
            }
            route_signal(state, session_id, role, to, signal, tx).await;
        }

        ClientMessage::Ping => {
            if let Some(heartbeat) = state.live.heartbeat_of(session_id, role) {
                *heartbeat.write().await = Instant::now();
            }
            let _ = state.storage.update_session_ttl(session_id).await;
            tx.send(ServerMessage::Pong)?;
        }

        ClientMessage::Leave => {
            debug!(session = %session_id, %role, "peer leaving");
            return Ok(LoopControl::Stop);
        }
    }

    Ok(LoopControl::Continue)
}

/// Deliver live when the addressed role is connected, queue otherwise. A
/// failed queue write is reported back to the sender rather than swallowed.
async fn route_signal(
    state: &SignalingState,
    session_id: &str,
    from: ParticipantRole,
    to: ParticipantRole,
    signal: SignalPayload,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    if to == from {
        let _ = tx.send(ServerMessage::Error {
            message: "cannot address a signal to your own role".to_string(),
        });
        return;
    }

    let delivered = state
        .live
        .deliver(session_id, to, ServerMessage::Signal { from, signal: signal.clone() });
    if delivered {
        return;
    }

    let envelope = SignalEnvelope::new(session_id, from, to, signal);
    if let Err(err) = state.storage.enqueue_signal(&envelope).await {
        error!(session = %session_id, %from, %err, "failed to queue signal");
        let _ = tx.send(ServerMessage::Error {
            message: "signal could not be stored for delivery".to_string(),
        });
    } else {
        debug!(session = %session_id, %from, %to, kind = %envelope.signal.kind(), "queued signal for offline role");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(tx: mpsc::UnboundedSender<ServerMessage>) -> PeerHandle {
        PeerHandle {
            display_name: None,
            tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            joined_at: interview_proto::now_ms(),
        }
    }

    fn offer() -> SignalPayload {
        SignalPayload::Offer { sdp: "v=0".into() }
    }

    #[tokio::test]
    async fn signals_addressed_to_recruiter_never_reach_the_candidate() {
        let live = LiveSessions::default();
        let (recruiter_tx, mut recruiter_rx) = mpsc::unbounded_channel();
        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();

        live.try_add_peer("sess-1", ParticipantRole::Recruiter, handle(recruiter_tx))
            .unwrap_or_else(|_| panic!("recruiter slot taken"));
        live.try_add_peer("sess-1", ParticipantRole::Candidate, handle(candidate_tx))
            .unwrap_or_else(|_| panic!("candidate slot taken"));

        let delivered = live.deliver(
            "sess-1",
            ParticipantRole::Recruiter,
            ServerMessage::Signal {
                from: ParticipantRole::Candidate,
                signal: offer(),
            },
        );
        assert!(delivered);

        assert!(matches!(
            recruiter_rx.try_recv(),
            Ok(ServerMessage::Signal { from: ParticipantRole::Candidate, .. })
        ));
        assert!(candidate_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_is_scoped_to_the_session() {
        let live = LiveSessions::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        live.try_add_peer("sess-a", ParticipantRole::Recruiter, handle(tx_a))
            .unwrap_or_else(|_| panic!("slot taken"));
        live.try_add_peer("sess-b", ParticipantRole::Recruiter, handle(tx_b))
            .unwrap_or_else(|_| panic!("slot taken"));

        let delivered = live.deliver(
            "sess-a",
            ParticipantRole::Recruiter,
            ServerMessage::Pong,
        );
        assert!(delivered);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_connection_for_an_occupied_role_is_rejected() {
        let live = LiveSessions::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        assert!(live
            .try_add_peer("sess-1", ParticipantRole::Candidate, handle(tx1))
            .is_ok());
        assert!(live
            .try_add_peer("sess-1", ParticipantRole::Candidate, handle(tx2))
            .is_err());
    }

    #[tokio::test]
    async fn delivering_to_an_absent_role_reports_not_delivered() {
        let live = LiveSessions::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        live.try_add_peer("sess-1", ParticipantRole::Recruiter, handle(tx))
            .unwrap_or_else(|_| panic!("slot taken"));

        assert!(!live.deliver("sess-1", ParticipantRole::Candidate, ServerMessage::Pong));
        assert!(!live.deliver("sess-2", ParticipantRole::Recruiter, ServerMessage::Pong));
    }

    #[test]
    fn revoked_candidate_is_refused_at_the_websocket_too() {
        assert_eq!(
            admission(true, true, ParticipantRole::Candidate),
            Err("invite_revoked")
        );
        // Revocation targets the candidate's invite, not the recruiter.
        assert_eq!(admission(true, true, ParticipantRole::Recruiter), Ok(()));
        assert_eq!(admission(true, false, ParticipantRole::Candidate), Ok(()));
        assert_eq!(
            admission(false, false, ParticipantRole::Candidate),
            Err("unknown_session")
        );
    }

    #[tokio::test]
    async fn removing_the_last_peer_drops_the_session_entry() {
        let live = LiveSessions::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        live.try_add_peer("sess-1", ParticipantRole::Recruiter, handle(tx))
            .unwrap_or_else(|_| panic!("slot taken"));

        live.remove_peer("sess-1", ParticipantRole::Recruiter);
        assert!(live.peer_summaries("sess-1").is_empty());

        // And the role can be reoccupied afterwards.
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(live
            .try_add_peer("sess-1", ParticipantRole::Recruiter, handle(tx2))
            .is_ok());
    }
}
