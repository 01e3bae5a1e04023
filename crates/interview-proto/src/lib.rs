//! Wire types shared by the greenroom relay and the studio client.
//!
//! Every message that crosses the signaling websocket is defined here, so the
//! relay and both participant flows agree on one serialized shape.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The two participants of an interview session.
///
/// The recruiter initiates the WebRTC handshake; the candidate answers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Recruiter,
    Candidate,
}

impl ParticipantRole {
    /// The role signaling traffic from this participant is addressed to.
    pub fn opposite(self) -> Self {
        match self {
            ParticipantRole::Recruiter => ParticipantRole::Candidate,
            ParticipantRole::Candidate => ParticipantRole::Recruiter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Recruiter => "recruiter",
            ParticipantRole::Candidate => "candidate",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipantRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recruiter" => Ok(ParticipantRole::Recruiter),
            "candidate" => Ok(ParticipantRole::Candidate),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown participant role: {}", self.0)
    }
}

impl std::error::Error for UnknownRole {}

/// WebRTC signaling payloads exchanged between the two peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal_type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::IceCandidate { .. } => SignalKind::IceCandidate,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        };
        f.write_str(name)
    }
}

/// A signaling message as the relay stores and forwards it.
///
/// Envelopes are append-only: once written they are never mutated, and a
/// queued envelope is removed exactly when it is delivered to the addressed
/// role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub session_id: String,
    pub from: ParticipantRole,
    pub to: ParticipantRole,
    pub signal: SignalPayload,
    pub sent_at_ms: i64,
}

impl SignalEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        from: ParticipantRole,
        to: ParticipantRole,
        signal: SignalPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from,
            to,
            signal,
            sent_at_ms: now_ms(),
        }
    }
}

/// Summary of a connected participant, included in join responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub role: ParticipantRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub joined_at: i64,
}

/// Messages sent from a participant to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce presence on the session channel.
    Join {
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Forward a signaling payload to the addressed role.
    Signal {
        to: ParticipantRole,
        signal: SignalPayload,
    },
    /// Explicit teardown before closing the socket.
    Leave,
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Messages sent from the relay to a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JoinSuccess {
        session_id: String,
        role: ParticipantRole,
        peers: Vec<PeerSummary>,
    },
    JoinError {
        reason: String,
    },
    PeerJoined {
        role: ParticipantRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    PeerLeft {
        role: ParticipantRole,
    },
    /// A signaling payload from the other participant.
    Signal {
        from: ParticipantRole,
        signal: SignalPayload,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Generate a unique session ID.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_opposite_is_symmetric() {
        assert_eq!(
            ParticipantRole::Recruiter.opposite(),
            ParticipantRole::Candidate
        );
        assert_eq!(
            ParticipantRole::Candidate.opposite(),
            ParticipantRole::Recruiter
        );
        assert_eq!(
            ParticipantRole::Recruiter.opposite().opposite(),
            ParticipantRole::Recruiter
        );
    }

    #[test]
    fn role_parses_from_path_segment() {
        assert_eq!(
            "recruiter".parse::<ParticipantRole>().unwrap(),
            ParticipantRole::Recruiter
        );
        assert!("interviewer".parse::<ParticipantRole>().is_err());
    }

    #[test]
    fn signal_payload_uses_tagged_snake_case() {
        let payload = SignalPayload::IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["signal_type"], "ice_candidate");

        let offer: SignalPayload =
            serde_json::from_str(r#"{"signal_type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(offer.kind(), SignalKind::Offer);
    }

    #[test]
    fn client_message_join_tolerates_missing_display_name() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Join { display_name: None }));
    }
}
