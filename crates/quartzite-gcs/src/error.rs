//! Error types for the group communication adapter.

use thiserror::Error;

/// Group communication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Endpoint is not connected to a group.
    #[error("not connected to a group")]
    NotConnected,

    /// The connection was closed.
    #[error("group connection closed")]
    Closed,

    /// A blocking call was interrupted (scheduled send cancelled, receive
    /// handed off to state transfer).
    #[error("operation interrupted")]
    Interrupted,

    /// Delivery is paused for state-transfer handoff; retry after the
    /// controller resumes receiving.
    #[error("receive paused for state transfer")]
    Paused,

    /// Action exceeds the maximum replicable size.
    #[error("action of {0} bytes exceeds maximum action size")]
    SizeExceeded(usize),

    /// Causal position could not be obtained before the deadline.
    #[error("causal wait timed out")]
    Timeout,

    /// Unknown schedule handle.
    #[error("unknown schedule handle {0}")]
    BadHandle(i64),

    /// Malformed payload on the group channel.
    #[error("malformed group payload: {0}")]
    Malformed(String),

    /// Operation is not provided by this backend.
    #[error("operation not implemented by this backend")]
    NotImplemented,
}

/// Result type for group communication operations.
pub type Result<T> = std::result::Result<T, Error>;
