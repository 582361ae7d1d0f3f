//! Connection lifecycle state
//!
//! The manager exposes its lifecycle as an explicit state machine rather
//! than connect/error callbacks. Consumers read the current state or hold a
//! watch receiver to react to transitions.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// State of one logical cluster connection.
///
/// Exactly one state holds at any time. `Closed` is terminal and is entered
/// at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Attempting the first connection
    Connecting,
    /// Connected and serving commands
    Ready,
    /// Health checks failing; commands still attempted
    Degraded,
    /// Shut down, or pre-connect retries exhausted
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared state cell with transition subscription.
///
/// Transitions out of `Closed` are rejected; setting `Closed` repeatedly is
/// a no-op, which makes shutdown idempotent.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Transitions to `next`. Returns the previous state, or `None` if the
    /// transition was rejected (already terminal) or a self-transition.
    pub fn set(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });
        previous
    }

    /// Watch receiver observing every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let cell = StateCell::new(ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connecting);

        assert_eq!(
            cell.set(ConnectionState::Ready),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(
            cell.set(ConnectionState::Degraded),
            Some(ConnectionState::Ready)
        );
        assert_eq!(
            cell.set(ConnectionState::Ready),
            Some(ConnectionState::Degraded)
        );
    }

    #[test]
    fn test_closed_is_terminal() {
        let cell = StateCell::new(ConnectionState::Ready);
        assert_eq!(cell.set(ConnectionState::Closed), Some(ConnectionState::Ready));
        // Repeat close is a no-op
        assert_eq!(cell.set(ConnectionState::Closed), None);
        // No way back out
        assert_eq!(cell.set(ConnectionState::Ready), None);
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_self_transition_does_not_notify() {
        let cell = StateCell::new(ConnectionState::Ready);
        let rx = cell.subscribe();
        assert_eq!(cell.set(ConnectionState::Ready), None);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let cell = StateCell::new(ConnectionState::Connecting);
        let mut rx = cell.subscribe();

        cell.set(ConnectionState::Ready);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Ready);
    }
}
