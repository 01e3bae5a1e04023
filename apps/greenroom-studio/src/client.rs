//! Relay clients: the websocket signaling connection and the HTTP session API.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use interview_proto::{ClientMessage, ParticipantRole, PeerSummary, ServerMessage, SignalPayload};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A live signaling connection to the relay.
///
/// Outgoing messages go through an mpsc channel feeding a writer task, so the
/// client handle is cheap to clone into pump tasks. Incoming messages arrive
/// on the receiver returned by [`SignalingClient::connect`].
#[derive(Clone)]
pub struct SignalingClient {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
}

/// Outcome of a successful join.
#[derive(Debug)]
pub struct Joined {
    pub peers: Vec<PeerSummary>,
    /// Messages that arrived before the verdict, in arrival order.
    pub pending: Vec<ServerMessage>,
}

impl SignalingClient {
    /// Connect and start the reader, writer, and heartbeat tasks.
    pub async fn connect(
        ws_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let (ws_stream, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, connect_async(ws_url))
                .await
                .map_err(|_| anyhow!("timed out connecting to {ws_url}"))?
                .with_context(|| format!("failed to connect to {ws_url}"))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(%err, "failed to serialize outgoing message");
                        continue;
                    }
                };
                if write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(%err, "undecodable frame from relay"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "signaling socket error");
                        break;
                    }
                }
            }
        });

        let ping_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if ping_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok((Self { out_tx }, in_rx))
    }

    /// Announce presence and wait for the relay's verdict. Returns the peers
    /// already present plus anything the relay delivered ahead of the
    /// verdict. Queued signals flushed by the relay after the verdict stay
    /// in the receiver for the flow to consume.
    pub async fn join(
        &self,
        incoming: &mut mpsc::UnboundedReceiver<ServerMessage>,
        display_name: Option<String>,
    ) -> Result<Joined> {
        self.send(ClientMessage::Join { display_name })?;

        let mut pending = Vec::new();
        let peers = tokio::time::timeout(CONNECT_TIMEOUT, async {
            while let Some(msg) = incoming.recv().await {
                match msg {
                    ServerMessage::JoinSuccess { peers, .. } => return Ok(peers),
                    ServerMessage::JoinError { reason } => {
                        bail!("relay refused join: {reason}")
                    }
                    // The relay registers a peer before answering, so a live
                    // peer can deliver signals into this window. Keep them
                    // for the caller to replay.
                    other => pending.push(other),
                }
            }
            bail!("signaling connection closed before join verdict")
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for join verdict"))??;

        Ok(Joined { peers, pending })
    }

    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.out_tx
            .send(message)
            .map_err(|_| anyhow!("signaling connection closed"))
    }

    pub fn send_signal(&self, to: ParticipantRole, signal: SignalPayload) -> Result<()> {
        self.send(ClientMessage::Signal { to, signal })
    }

    pub fn leave(&self) {
        let _ = self.out_tx.send(ClientMessage::Leave);
    }
}

/// The relay's HTTP session API.
pub struct RelayApi {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    pub candidate_id: String,
    pub invite_token: String,
    pub invite_url: String,
    pub recruiter_ws_url: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinGrant {
    pub session_id: String,
    pub candidate_id: String,
    pub ws_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiRejection {
    reason: String,
    message: String,
}

impl RelayApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn create_session(
        &self,
        candidate_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<CreatedSession> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(&serde_json::json!({ "candidate_id": candidate_id, "title": title }))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Present the invite token. The relay's verification is authoritative;
    /// a refusal carries the reason it gave.
    pub async fn join_session(&self, session_id: &str, invite_token: &str) -> Result<JoinGrant> {
        let response = self
            .http
            .post(format!("{}/sessions/{}/join", self.base_url, session_id))
            .json(&serde_json::json!({ "invite_token": invite_token }))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        match response.json::<ApiRejection>().await {
            Ok(rejection) => bail!(
                "relay rejected the request ({}): {}",
                rejection.reason,
                rejection.message
            ),
            Err(_) => bail!("relay returned {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn send_json(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        msg: &ServerMessage,
    ) {
        let json = serde_json::to_string(msg).unwrap();
        ws.send(WsMessage::Text(json.into())).await.unwrap();
    }

    #[tokio::test]
    async fn signals_arriving_before_the_join_verdict_are_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if matches!(
                            serde_json::from_str::<ClientMessage>(text.as_str()),
                            Ok(ClientMessage::Join { .. })
                        ) {
                            break;
                        }
                    }
                    _ => panic!("client closed before joining"),
                }
            }

            // The other peer live-delivers an offer before the verdict.
            send_json(
                &mut ws,
                &ServerMessage::Signal {
                    from: ParticipantRole::Recruiter,
                    signal: SignalPayload::Offer { sdp: "v=0".into() },
                },
            )
            .await;
            send_json(
                &mut ws,
                &ServerMessage::JoinSuccess {
                    session_id: "sess-1".into(),
                    role: ParticipantRole::Candidate,
                    peers: vec![],
                },
            )
            .await;

            // Hold the socket open until the client is done.
            while ws.next().await.is_some() {}
        });

        let (client, mut incoming) = SignalingClient::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let joined = client.join(&mut incoming, None).await.unwrap();

        assert!(joined.peers.is_empty());
        assert_eq!(joined.pending.len(), 1);
        assert!(matches!(
            joined.pending[0],
            ServerMessage::Signal {
                from: ParticipantRole::Recruiter,
                signal: SignalPayload::Offer { .. },
            }
        ));
    }
}
