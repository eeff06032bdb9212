use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Configured,
    Streaming,
    Faulted,
    Reconnecting,
    Closed,
}

impl SessionState {
    /// Whether the session may move from `self` to `next`
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Configured)
            | (Configured, Configured)
            | (Configured, Streaming)
            | (Streaming, Configured)
            | (Streaming, Faulted)
            | (Faulted, Reconnecting)
            | (Reconnecting, Configured) => true,
            _ => false,
        }
    }

    /// A device handle is held in this state
    pub fn holds_device(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Configured | SessionState::Streaming
        )
    }
}

impl SessionState {
    const ALL: [SessionState; 7] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Configured,
        SessionState::Streaming,
        SessionState::Faulted,
        SessionState::Reconnecting,
        SessionState::Closed,
    ];

    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .unwrap_or(SessionState::Closed)
    }
}

/// Lock-free mirror of the session state for readers
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SessionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::{SessionState, StateCell};

    #[test]
    fn test_state_cell_round_trips_every_state() {
        let cell = StateCell::new(Disconnected);
        for state in SessionState::ALL {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Configured));
        assert!(Configured.can_transition(Streaming));
        assert!(Streaming.can_transition(Configured));
    }

    #[test]
    fn test_recovery_path() {
        assert!(Streaming.can_transition(Faulted));
        assert!(Faulted.can_transition(Reconnecting));
        assert!(Reconnecting.can_transition(Configured));
        assert!(Reconnecting.can_transition(Closed));
        assert!(!Faulted.can_transition(Streaming));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Disconnected.can_transition(Streaming));
        assert!(!Connecting.can_transition(Streaming));
        assert!(!Configured.can_transition(Faulted));
        assert!(!Closed.can_transition(Connecting));
        assert!(!Closed.can_transition(Closed));
    }

    #[test]
    fn test_any_live_state_can_close() {
        for state in [
            Disconnected,
            Connecting,
            Configured,
            Streaming,
            Faulted,
            Reconnecting,
        ] {
            assert!(state.can_transition(Closed), "{state} -> Closed");
        }
    }
}
