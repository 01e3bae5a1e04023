use std::sync::Arc;

use interview_proto::SignalPayload;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::RtcError;

/// In-process duplex signaling channel.
///
/// Each half sends into the other half's receiver. Used to wire two peer
/// connections together in tests and the loopback self-test, standing in for
/// the relay.
#[derive(Clone)]
pub struct LocalSignalingChannel {
    tx: mpsc::UnboundedSender<SignalPayload>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<SignalPayload>>>,
}

impl LocalSignalingChannel {
    /// Create a cross-wired pair of channel halves.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self {
                tx: tx_a,
                rx: Arc::new(AsyncMutex::new(rx_b)),
            },
            Self {
                tx: tx_b,
                rx: Arc::new(AsyncMutex::new(rx_a)),
            },
        )
    }

    pub fn send(&self, signal: SignalPayload) -> Result<(), RtcError> {
        self.tx.send(signal).map_err(|_| RtcError::SignalingClosed)
    }

    pub async fn recv(&self) -> Option<SignalPayload> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn halves_are_cross_wired() {
        let (a, b) = LocalSignalingChannel::pair();
        a.send(SignalPayload::Offer { sdp: "v=0".into() }).unwrap();
        match b.recv().await {
            Some(SignalPayload::Offer { sdp }) => assert_eq!(sdp, "v=0"),
            other => panic!("unexpected: {other:?}"),
        }

        b.send(SignalPayload::Answer { sdp: "v=0a".into() }).unwrap();
        assert!(matches!(a.recv().await, Some(SignalPayload::Answer { .. })));
    }
}
