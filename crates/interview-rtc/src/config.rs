use interview_proto::ParticipantRole;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Configuration for a peer connection.
#[derive(Clone)]
pub struct RtcConfig {
    /// Which participant this connection belongs to.
    pub role: ParticipantRole,
    /// Session the connection's signaling is correlated under.
    pub session_id: String,
    /// ICE servers for connection establishment.
    pub ice_servers: Vec<RTCIceServer>,
}

impl RtcConfig {
    /// Default configuration with public STUN for NAT traversal.
    pub fn new(role: ParticipantRole, session_id: impl Into<String>) -> Self {
        Self {
            role,
            session_id: session_id.into(),
            ice_servers: default_stun_servers(),
        }
    }

    /// Localhost-only configuration with no STUN/TURN, for tests.
    pub fn localhost(role: ParticipantRole, session_id: impl Into<String>) -> Self {
        Self {
            role,
            session_id: session_id.into(),
            ice_servers: vec![],
        }
    }

    pub fn with_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }
}

fn default_stun_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}
