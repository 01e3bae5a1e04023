//! Peer-connection management for interview sessions.
//!
//! Wraps the native WebRTC stack: local media attachment, offer/answer
//! exchange, trickled ICE in both directions, mute toggles that never
//! renegotiate, idempotent teardown, bounded handshake waits, and a
//! reconnection supervisor with bounded backoff.

pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod media;
pub mod peer;
pub mod supervisor;

pub use channel::LocalSignalingChannel;
pub use config::RtcConfig;
pub use error::{MediaError, RtcError};
pub use media::{
    MediaDescriptor, MediaFrame, MediaSource, SyntheticSource, TrackKind, TrackReadyState,
};
pub use peer::{ConnectionPhase, PeerConnection, RemoteTrackInfo};
pub use supervisor::{RetryPolicy, SessionState, Supervisor};
