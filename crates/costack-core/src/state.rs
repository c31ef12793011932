//! Coroutine state and connection status types

use core::fmt;

/// State of a coroutine
///
/// `Ready -> Running -> (Suspended <-> Running)* -> Dead`. Dead is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created, body not entered yet
    Ready = 0,

    /// Parked in a yield, stack saved off the shared stack
    Suspended = 1,

    /// Currently executing on the shared stack
    Running = 2,

    /// Body returned
    Dead = 3,
}

impl CoroutineState {
    /// Check if `resume()` may switch into a coroutine in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, CoroutineState::Ready | CoroutineState::Suspended)
    }

    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, CoroutineState::Dead)
    }
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoroutineState::Ready => write!(f, "READY"),
            CoroutineState::Suspended => write!(f, "SUSPENDED"),
            CoroutineState::Running => write!(f, "RUNNING"),
            CoroutineState::Dead => write!(f, "DEAD"),
        }
    }
}

/// Status of a coroutine-driven connection
///
/// Doubles as the gate deciding which reactor callback may resume the
/// coroutine waiting on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Open, nobody waiting
    Idle = 0,

    /// Terminal
    Closed = 1,

    /// Parked in a read until more bytes arrive
    WaitingMessage = 2,

    /// Parked in a write until the outbound buffer drains
    WaitingWriteDone = 3,

    /// Parked in close until the close callback fires
    WaitingClose = 4,
}

impl ConnStatus {
    /// Check if a coroutine is parked on this connection
    #[inline]
    pub const fn is_waiting(&self) -> bool {
        matches!(
            self,
            ConnStatus::WaitingMessage | ConnStatus::WaitingWriteDone | ConnStatus::WaitingClose
        )
    }
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnStatus::Idle => write!(f, "IDLE"),
            ConnStatus::Closed => write!(f, "CLOSED"),
            ConnStatus::WaitingMessage => write!(f, "WAITING_MESSAGE"),
            ConnStatus::WaitingWriteDone => write!(f, "WAITING_WRITE_DONE"),
            ConnStatus::WaitingClose => write!(f, "WAITING_CLOSE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(CoroutineState::Ready.is_resumable());
        assert!(CoroutineState::Suspended.is_resumable());
        assert!(!CoroutineState::Running.is_resumable());
        assert!(!CoroutineState::Dead.is_resumable());
        assert!(CoroutineState::Dead.is_dead());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CoroutineState::Suspended.to_string(), "SUSPENDED");
        assert_eq!(ConnStatus::WaitingWriteDone.to_string(), "WAITING_WRITE_DONE");
    }

    #[test]
    fn test_conn_status_waiting() {
        assert!(!ConnStatus::Idle.is_waiting());
        assert!(!ConnStatus::Closed.is_waiting());
        assert!(ConnStatus::WaitingMessage.is_waiting());
        assert!(ConnStatus::WaitingWriteDone.is_waiting());
        assert!(ConnStatus::WaitingClose.is_waiting());
    }
}
