//! Error types for costack

use core::fmt;

/// Result type for coroutine-driven I/O
pub type CoResult<T> = Result<T, CoError>;

/// Errors surfaced to the coroutine at the call that could not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoError {
    /// Connection was already closed, or closed while waiting
    Closed,

    /// Wait deadline elapsed before the operation completed
    Timeout,

    /// Non-blocking connect was refused or timed out
    ConnectFailed,

    /// Buffer would grow past its hard maximum
    BufferFull,

    /// Shared stack could not be set up
    Stack(StackError),

    /// Raw errno from a failed syscall
    Os(i32),
}

impl CoError {
    /// Capture errno of the last failed syscall on this thread
    pub fn last_os_error() -> Self {
        CoError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Check if the error is a closed connection
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, CoError::Closed)
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoError::Timeout)
    }
}

impl fmt::Display for CoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoError::Closed => write!(f, "connection closed"),
            CoError::Timeout => write!(f, "operation timed out"),
            CoError::ConnectFailed => write!(f, "connect failed"),
            CoError::BufferFull => write!(f, "buffer full"),
            CoError::Stack(e) => write!(f, "stack error: {}", e),
            CoError::Os(code) => {
                write!(f, "os error {}: {}", code, std::io::Error::from_raw_os_error(*code))
            }
        }
    }
}

impl std::error::Error for CoError {}

impl From<std::io::Error> for CoError {
    fn from(e: std::io::Error) -> Self {
        CoError::Os(e.raw_os_error().unwrap_or(0))
    }
}

/// Shared-stack errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed,

    /// mprotect on the guard page failed
    ProtectionFailed,

    /// Live stack is larger than the maximum logical stack
    Overflow { used: usize, max: usize },
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::Overflow { used, max } => {
                write!(f, "stack overflow: {} bytes used, {} allowed", used, max)
            }
        }
    }
}

impl From<StackError> for CoError {
    fn from(e: StackError) -> Self {
        CoError::Stack(e)
    }
}
