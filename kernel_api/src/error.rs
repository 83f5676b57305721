//! Kernel error types

use thiserror::Error;

/// Errors returned by kernel IPC operations
///
/// Every variant is recoverable at the syscall boundary, where it becomes a
/// negative status. Broken kernel invariants are not represented here; they
/// panic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// No port bound at the path, or no such object
    #[error("Not found")]
    NotFound,

    /// Object exists but is not in a state that allows the operation
    #[error("Not ready")]
    NotReady,

    /// Receive queue or pending-connection list is empty
    #[error("No message")]
    NoMessage,

    /// A wait is already in progress where only one is allowed
    #[error("Already started")]
    AlreadyStarted,

    /// Malformed arguments
    #[error("Invalid arguments")]
    InvalidArgs,

    /// Message queue has no free slot
    #[error("Message queue full")]
    QueueFull,

    /// Wait exceeded its deadline
    #[error("Operation timed out")]
    TimedOut,

    /// Path already bound, or object already registered
    #[error("Already exists")]
    AlreadyExists,

    /// Operation attempted after the peer hung up
    #[error("Peer closed")]
    PeerClosed,

    /// Operation not supported by this object or syscall
    #[error("Not supported")]
    NotSupported,

    /// Argument exceeds a configured size limit
    #[error("Too big")]
    TooBig,

    /// Message or segment length exceeds the configured maximum
    #[error("Bad length")]
    BadLen,

    /// Invalid memory reference supplied by the application
    #[error("Bad user address")]
    Fault,

    /// Handle table or pending-connection queue is full
    #[error("No space")]
    NoSpace,

    /// Stale or out-of-range handle id
    #[error("Invalid handle")]
    InvalidHandle,

    /// Port does not accept connections from this client
    #[error("Access denied")]
    AccessDenied,

    /// Non-blocking call cannot proceed immediately
    #[error("Operation would block")]
    WouldBlock,
}

impl KernelError {
    /// Every error, in status-code order
    pub const ALL: [KernelError; 17] = [
        KernelError::NotFound,
        KernelError::NotReady,
        KernelError::NoMessage,
        KernelError::AlreadyStarted,
        KernelError::InvalidArgs,
        KernelError::QueueFull,
        KernelError::TimedOut,
        KernelError::AlreadyExists,
        KernelError::PeerClosed,
        KernelError::NotSupported,
        KernelError::TooBig,
        KernelError::BadLen,
        KernelError::Fault,
        KernelError::NoSpace,
        KernelError::InvalidHandle,
        KernelError::AccessDenied,
        KernelError::WouldBlock,
    ];

    /// Negative status returned to applications
    pub const fn status(self) -> i64 {
        match self {
            KernelError::NotFound => -2,
            KernelError::NotReady => -3,
            KernelError::NoMessage => -4,
            KernelError::AlreadyStarted => -6,
            KernelError::InvalidArgs => -8,
            KernelError::QueueFull => -9,
            KernelError::TimedOut => -13,
            KernelError::AlreadyExists => -14,
            KernelError::PeerClosed => -15,
            KernelError::NotSupported => -24,
            KernelError::TooBig => -25,
            KernelError::BadLen => -32,
            KernelError::Fault => -40,
            KernelError::NoSpace => -41,
            KernelError::InvalidHandle => -42,
            KernelError::AccessDenied => -43,
            KernelError::WouldBlock => -45,
        }
    }

    /// Decodes a negative status back into an error
    pub fn from_status(status: i64) -> Option<KernelError> {
        Self::ALL.iter().copied().find(|e| e.status() == status)
    }
}

/// Result type used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;

/// Collapses a result into the value a syscall hands back to user space
pub fn to_status(result: KernelResult<i64>) -> i64 {
    match result {
        Ok(value) => value,
        Err(err) => err.status(),
    }
}
