//! Error types for incremental state transfer.

use thiserror::Error;

use quartzite_types::GlobalSeqno;

/// IST errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Header checksum mismatch; the stream cannot be trusted.
    #[error("corrupted message header")]
    Corrupted,

    /// Peer speaks a different wire protocol version.
    #[error("protocol version mismatch: peer {peer}, expected {expected}")]
    VersionMismatch { peer: u8, expected: u8 },

    /// Dialog violation: unexpected message type or control code.
    #[error("protocol error: {0}")]
    Proto(String),

    /// Peer reported an error through a negative control code.
    #[error("peer reported error code {0}")]
    PeerError(i8),

    /// The transfer was interrupted locally (joiner shutdown).
    #[error("transfer interrupted")]
    Interrupted,

    /// Received seqno breaks the expected sequence.
    #[error("unexpected seqno {got}, expected {expected}")]
    Sequence {
        expected: GlobalSeqno,
        got: GlobalSeqno,
    },

    /// Transfer ended before the requested range completed.
    #[error("incomplete range: last received {current}, expected {last}")]
    Incomplete {
        current: GlobalSeqno,
        last: GlobalSeqno,
    },

    /// Receive endpoint could not be determined from configuration.
    #[error("cannot determine receive address: {0}")]
    Address(String),

    /// `ssl://` endpoint requested without TLS configuration.
    #[error("TLS not configured for ssl:// endpoint")]
    TlsNotConfigured,

    /// Donor cache does not hold the requested range.
    #[error(transparent)]
    Cache(#[from] quartzite_cache::Error),

    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for IST operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is the joiner's own interrupt rather than a
    /// failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}
