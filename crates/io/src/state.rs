//! Connection state machine.

use std::fmt;

/// State of a [`Connection`](crate::Connection).
///
/// Server side connections move `Invalid → Handshaking → Handshaked →
/// Connected`, client side connections pass through `Connecting` before
/// `Handshaking`. `Closing → Closed` is reachable from every live state and
/// `Failed` is a sink reachable from any state which is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed, the session has not been set up.
    Invalid,
    /// The security handshake is in progress.
    Handshaking,
    /// The handshake completed.
    Handshaked,
    /// The client side started setting up the session.
    Connecting,
    /// Usable for application I/O.
    Connected,
    /// Shutdown was initiated.
    Closing,
    /// Resources were released.
    Closed,
    /// An unrecoverable error occurred.
    Failed,
}

impl State {
    /// Returns `true` if a connection in this state may move to `next`.
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;

        matches!(
            (self, next),
            (Invalid, Connecting | Handshaking | Closing | Failed)
                | (Connecting, Handshaking | Closing | Failed)
                | (Handshaking, Handshaked | Closing | Failed)
                | (Handshaked, Connected | Closing | Failed)
                | (Connected, Closing | Failed)
                | (Closing, Closed | Failed)
        )
    }

    /// Returns `true` if no transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Closed | State::Failed)
    }

    /// Returns `true` if application data may be exchanged in this state.
    pub fn is_usable(self) -> bool {
        self == State::Connected
    }

    /// Moves to `next`, rejecting transitions outside of the state table.
    pub(crate) fn transition(&mut self, next: State) -> Result<State, StateError> {
        if !self.can_transition_to(next) {
            return Err(StateError::Transition {
                from: *self,
                to: next,
            });
        }

        Ok(std::mem::replace(self, next))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Invalid => "invalid",
            State::Handshaking => "handshaking",
            State::Handshaked => "handshaked",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Closing => "closing",
            State::Closed => "closed",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error for operations the current state does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The requested transition is not in the state table.
    #[error("illegal transition from {from} to {to}")]
    Transition {
        /// State before the transition.
        from: State,
        /// Requested state.
        to: State,
    },
    /// The operation needs a different state.
    #[error("cannot {op} while the connection is {state}")]
    Unusable {
        /// Name of the rejected operation.
        op: &'static str,
        /// State at the time of the call.
        state: State,
    },
}
