//! Reconnection supervision.
//!
//! A dropped peer connection is not terminal: the supervisor drives a
//! caller-supplied connect step under a bounded exponential backoff and only
//! lands in [`SessionState::GaveUp`] once the policy is exhausted. A clean
//! close ends supervision without retrying.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::RtcError;
use crate::peer::ConnectionPhase;

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// What the supervisor is currently doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting { attempt: u32 },
    Online,
    Backoff { attempt: u32 },
    GaveUp,
}

pub struct Supervisor {
    policy: RetryPolicy,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
}

enum Outcome {
    /// The connection closed deliberately.
    Finished,
    /// The connection dropped; `was_online` records whether it ever came up.
    Dropped { was_online: bool },
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            policy,
            state_tx,
            state_rx,
        }
    }

    /// Observe supervision state, including the terminal `GaveUp`.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Drive `connect` until the session ends cleanly or retries run out.
    ///
    /// `connect` builds (or rebuilds) the peer connection and returns its
    /// phase watcher; the caller keeps ownership of the connection itself.
    /// A period of successful connectivity resets the attempt counter, so
    /// only consecutive failures count against the policy.
    pub async fn run<F, Fut>(&self, mut connect: F) -> Result<(), RtcError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<watch::Receiver<ConnectionPhase>, RtcError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let _ = self.state_tx.send(SessionState::Connecting { attempt });

            match connect(attempt).await {
                Ok(phases) => match self.watch_connection(phases).await {
                    Outcome::Finished => {
                        let _ = self.state_tx.send(SessionState::Idle);
                        return Ok(());
                    }
                    Outcome::Dropped { was_online } => {
                        if was_online {
                            info!("peer connection dropped after being online");
                            attempt = 1;
                        } else {
                            warn!(attempt, "connection attempt did not come up");
                        }
                    }
                },
                Err(err) => warn!(attempt, %err, "connect step failed"),
            }

            if attempt >= self.policy.max_attempts {
                let _ = self.state_tx.send(SessionState::GaveUp);
                return Err(RtcError::GaveUp { attempts: attempt });
            }

            let _ = self.state_tx.send(SessionState::Backoff { attempt });
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    async fn watch_connection(&self, mut phases: watch::Receiver<ConnectionPhase>) -> Outcome {
        let mut was_online = false;
        loop {
            let phase = *phases.borrow_and_update();
            match phase {
                ConnectionPhase::Connected => {
                    if !was_online {
                        was_online = true;
                        let _ = self.state_tx.send(SessionState::Online);
                    }
                }
                ConnectionPhase::Closed => return Outcome::Finished,
                ConnectionPhase::Disconnected | ConnectionPhase::Failed => {
                    return Outcome::Dropped { was_online };
                }
                ConnectionPhase::New | ConnectionPhase::Connecting => {}
            }
            if phases.changed().await.is_err() {
                return Outcome::Dropped { was_online };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(450));
        assert_eq!(policy.delay_for(30), Duration::from_millis(450));
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_gave_up() {
        let supervisor = Supervisor::new(fast_policy(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let err = supervisor
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(RtcError::ConnectionFailed) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RtcError::GaveUp { attempts: 3 }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*supervisor.state().borrow(), SessionState::GaveUp);
    }

    #[tokio::test]
    async fn clean_close_ends_supervision_without_retry() {
        let supervisor = Supervisor::new(fast_policy(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        supervisor
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    let (tx, rx) = watch::channel(ConnectionPhase::Connected);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        let _ = tx.send(ConnectionPhase::Closed);
                    });
                    Ok(rx)
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*supervisor.state().borrow(), SessionState::Idle);
    }

    #[tokio::test]
    async fn drop_after_online_resets_the_attempt_budget() {
        let supervisor = Supervisor::new(fast_policy(2));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = supervisor
            .run(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let (tx, rx) = watch::channel(ConnectionPhase::Connected);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        // First two connections drop after being online; the
                        // third closes cleanly.
                        if n < 3 {
                            let _ = tx.send(ConnectionPhase::Disconnected);
                        } else {
                            let _ = tx.send(ConnectionPhase::Closed);
                        }
                    });
                    Ok(rx)
                }
            })
            .await;

        // Two online drops never exhaust a 2-attempt budget because each
        // online period resets it.
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
