//! Session lifecycle
//!
//! ```text
//! Connecting -> Handshaking -> Authenticating -> Active -> Closing -> Closed
//!      \______________\_______________\____________\_________\____> Failed
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::SessionErrorKind;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Handshaking,
    Authenticating,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Closed and Failed accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Connecting, Handshaking)
            | (Handshaking, Authenticating)
            | (Authenticating, Active)
            | (Active, Closing)
            | (Closing, Closed) => true,
            _ => false,
        }
    }
}

/// Attempted transition that the lifecycle does not allow
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid session transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Tracks one session's state and why it failed, if it did
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    failure: Option<SessionErrorKind>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Start in `Connecting`
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Failure kind recorded by [`Self::fail`]
    pub fn failure(&self) -> Option<SessionErrorKind> {
        self.failure
    }

    /// Move to `next`, rejecting transitions the lifecycle forbids
    pub fn advance(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` from any non-terminal state
    ///
    /// Failing an already terminal session keeps the original outcome.
    pub fn fail(&mut self, kind: SessionErrorKind) {
        if self.state.is_terminal() {
            return;
        }
        debug!(from = ?self.state, kind = %kind, "Session failed");
        self.state = SessionState::Failed;
        self.failure = Some(kind);
    }

    /// Walk `Active -> Closing -> Closed`
    pub fn close(&mut self) -> Result<(), InvalidTransition> {
        if self.state == SessionState::Active {
            self.advance(SessionState::Closing)?;
        }
        self.advance(SessionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = SessionStateMachine::new();
        machine.advance(SessionState::Handshaking).unwrap();
        machine.advance(SessionState::Authenticating).unwrap();
        machine.advance(SessionState::Active).unwrap();
        machine.close().unwrap();
        assert_eq!(machine.state(), SessionState::Closed);
        assert_eq!(machine.failure(), None);
    }

    #[test]
    fn test_cannot_skip_authentication() {
        let mut machine = SessionStateMachine::new();
        machine.advance(SessionState::Handshaking).unwrap();
        let err = machine.advance(SessionState::Active).unwrap_err();
        assert_eq!(err.from, SessionState::Handshaking);
        assert_eq!(machine.state(), SessionState::Handshaking);
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        for steps in 0..4 {
            let mut machine = SessionStateMachine::new();
            let path = [
                SessionState::Handshaking,
                SessionState::Authenticating,
                SessionState::Active,
                SessionState::Closing,
            ];
            for next in &path[..steps] {
                machine.advance(*next).unwrap();
            }
            machine.fail(SessionErrorKind::TransportLost);
            assert_eq!(machine.state(), SessionState::Failed);
            assert_eq!(machine.failure(), Some(SessionErrorKind::TransportLost));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut machine = SessionStateMachine::new();
        machine.fail(SessionErrorKind::Handshake);
        machine.fail(SessionErrorKind::Timeout);
        assert_eq!(machine.failure(), Some(SessionErrorKind::Handshake));
        assert!(machine.advance(SessionState::Handshaking).is_err());
        assert!(!SessionState::Closed.can_transition_to(SessionState::Failed));
    }
}
