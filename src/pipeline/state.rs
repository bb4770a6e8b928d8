//! Session state management

use std::time::Instant;

/// Connection state of a [`StreamSession`](super::session::StreamSession)
///
/// A session only moves forward. `Degraded` and `Streaming` may alternate
/// while the link quality changes, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the peer and the initial negotiation
    Connecting,

    /// Media is flowing within the loss and latency budget
    Streaming {
        /// When media started (or resumed) flowing
        since: Instant,
    },

    /// Media is flowing but loss or latency is over budget
    Degraded {
        since: Instant,
    },

    /// Session ended and cannot be reused
    Closed,
}

impl SessionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Connecting, Streaming { .. }) => true,
            (Connecting, Closed) => true, // negotiation failed

            (Streaming { .. }, Degraded { .. }) => true,
            (Streaming { .. }, Closed) => true,

            (Degraded { .. }, Streaming { .. }) => true,
            (Degraded { .. }, Closed) => true,

            // Closed is terminal, nothing goes back to Connecting
            (Closed, _) => false,
            (_, Connecting) => false,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::Streaming { .. } => "Streaming",
            SessionState::Degraded { .. } => "Degraded",
            SessionState::Closed => "Closed",
        }
    }

    /// Check if media is flowing (streaming or degraded)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Streaming { .. } | SessionState::Degraded { .. }
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::Streaming { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, SessionState::Degraded { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
