use std::time::Duration;
use thiserror::Error;

/// Errors from peer-connection setup and signaling application.
#[derive(Debug, Error)]
pub enum RtcError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("webrtc: {0}")]
    Webrtc(#[from] webrtc::Error),
    #[error("signaling channel closed")]
    SignalingClosed,
    #[error("timed out after {0:?} waiting for {1}")]
    HandshakeTimeout(Duration, &'static str),
    #[error("peer connection failed")]
    ConnectionFailed,
    #[error("peer connection closed")]
    Closed,
    #[error("gave up after {attempts} connection attempts")]
    GaveUp { attempts: u32 },
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Local media acquisition failures, classified for user-facing reporting.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture unsupported on this platform: {0}")]
    Unsupported(String),
    #[error("media error: {0}")]
    Other(String),
}
