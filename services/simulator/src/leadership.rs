//! Leadership gate.
//!
//! Leadership is a watch channel over [`LeadershipState`]. The producer side
//! ([`LeadershipHandle`]) is driven by an elector; any number of tasks hold
//! a cloned [`LeadershipGate`] and wait on it independently.
//!
//! `Lost` is terminal: a process that loses leadership never regains it
//! under the same gate. It restarts as a follower instead.

use thiserror::Error;
use tokio::sync::watch;

/// Observed leadership of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Pending,
    Elected,
    Lost,
}

impl LeadershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadershipState::Pending => "pending",
            LeadershipState::Elected => "elected",
            LeadershipState::Lost => "lost",
        }
    }
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why [`LeadershipGate::await_elected`] gave up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("leadership was lost before this task was released")]
    Lost,

    #[error("leadership signal closed before election")]
    Closed,
}

/// Create a new gate in the `Pending` state.
pub fn channel() -> (LeadershipHandle, LeadershipGate) {
    let (tx, rx) = watch::channel(LeadershipState::Pending);
    (LeadershipHandle { tx }, LeadershipGate { rx })
}

/// Producer side of the gate.
#[derive(Debug)]
pub struct LeadershipHandle {
    tx: watch::Sender<LeadershipState>,
}

impl LeadershipHandle {
    /// Mark this process as leader. Returns false if it was already elected
    /// or leadership was already lost.
    pub fn elect(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == LeadershipState::Pending {
                *state = LeadershipState::Elected;
                true
            } else {
                false
            }
        })
    }

    /// Mark leadership as lost. Idempotent.
    pub fn revoke(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == LeadershipState::Lost {
                false
            } else {
                *state = LeadershipState::Lost;
                true
            }
        })
    }

    pub fn state(&self) -> LeadershipState {
        *self.tx.borrow()
    }

    /// A new observer of this gate.
    pub fn gate(&self) -> LeadershipGate {
        LeadershipGate {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of the gate.
#[derive(Debug, Clone)]
pub struct LeadershipGate {
    rx: watch::Receiver<LeadershipState>,
}

impl LeadershipGate {
    /// Wait until this process is confirmed leader.
    ///
    /// Never returns `Ok` for a process that is not elected: if leadership
    /// is lost first, or the producer goes away, this returns an error.
    pub async fn await_elected(&self) -> Result<(), GateError> {
        let mut rx = self.rx.clone();
        let state = match rx.wait_for(|s| *s != LeadershipState::Pending).await {
            Ok(state) => *state,
            Err(_) => return Err(GateError::Closed),
        };
        match state {
            LeadershipState::Elected => Ok(()),
            _ => Err(GateError::Lost),
        }
    }

    /// Resolves once leadership is lost or the producer is dropped.
    pub async fn lost(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|s| *s == LeadershipState::Lost).await;
    }

    pub fn is_elected(&self) -> bool {
        *self.rx.borrow() == LeadershipState::Elected
    }

    pub fn state(&self) -> LeadershipState {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_await_elected_blocks_until_elect() {
        let (handle, gate) = channel();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.await_elected().await }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert!(!gate.is_elected());

        assert!(handle.elect());
        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(gate.is_elected());
    }

    #[tokio::test]
    async fn test_many_waiters_released_independently() {
        let (handle, gate) = channel();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.await_elected().await })
            })
            .collect();

        handle.elect();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_await_after_election_returns_immediately() {
        let (handle, gate) = channel();
        handle.elect();
        assert_eq!(gate.await_elected().await, Ok(()));
        // Still satisfied for a late subscriber.
        assert_eq!(handle.gate().await_elected().await, Ok(()));
    }

    #[tokio::test]
    async fn test_never_elected_never_succeeds() {
        let (handle, gate) = channel();
        handle.revoke();
        assert_eq!(gate.await_elected().await, Err(GateError::Lost));

        let (handle, gate) = channel();
        drop(handle);
        assert_eq!(gate.await_elected().await, Err(GateError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_gate_does_not_resolve() {
        let (_handle, gate) = channel();
        let result = tokio::time::timeout(Duration::from_secs(60), gate.await_elected()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_lost_is_terminal() {
        let (handle, gate) = channel();
        handle.elect();
        assert!(handle.revoke());
        assert!(!handle.revoke());
        assert!(!handle.elect());
        gate.lost().await;
        assert_eq!(gate.state(), LeadershipState::Lost);
        assert!(!gate.is_elected());
    }

    #[tokio::test]
    async fn test_lost_resolves_when_producer_dropped() {
        let (handle, gate) = channel();
        handle.elect();
        drop(handle);
        gate.lost().await;
    }
}
