//! Provider status taxonomy and internal errors.

use thiserror::Error;

/// Status codes surfaced to the embedding database engine.
///
/// `Ok` continues normally. `TrxFail` and `BfAbort` are the two transaction
/// outcomes the caller must handle: roll back, or (for `BfAbort` with a
/// commit-flagged write-set) replay. `Fatal` means the node is inconsistent
/// and must leave the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Recoverable oddity, e.g. setting an unknown parameter.
    Warning,
    /// Operation referenced an unknown transaction.
    TrxMissing,
    /// Certification failed; the caller must roll the transaction back.
    TrxFail,
    /// Preempted by a higher-priority transaction; replay if commit-flagged.
    BfAbort,
    /// Write-set exceeds the maximum replicable size.
    SizeExceeded,
    /// Not in a replicating state, or interrupted by a view change.
    ConnFail,
    /// Non-fatal local failure (e.g. group connection lost).
    NodeFail,
    /// Inconsistency detected; unrecoverable.
    Fatal,
    /// BF-abort rejected: the victim outranks the aborter.
    NotAllowed,
    /// Hook present in the provider surface but not used by this build.
    NotImplemented,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::TrxMissing => "TRX_MISSING",
            Status::TrxFail => "TRX_FAIL",
            Status::BfAbort => "BF_ABORT",
            Status::SizeExceeded => "SIZE_EXCEEDED",
            Status::ConnFail => "CONN_FAIL",
            Status::NodeFail => "NODE_FAIL",
            Status::Fatal => "FATAL",
            Status::NotAllowed => "NOT_ALLOWED",
            Status::NotImplemented => "NOT_IMPLEMENTED",
        };
        f.write_str(s)
    }
}

/// Internal errors of the replication core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("group communication: {0}")]
    Gcs(#[from] quartzite_gcs::Error),

    #[error("state transfer: {0}")]
    Ist(#[from] quartzite_ist::Error),

    #[error("cache: {0}")]
    Cache(#[from] quartzite_cache::Error),

    #[error("configuration: {0}")]
    Config(#[from] quartzite_config::Error),

    #[error("malformed write-set: {0}")]
    MalformedWriteSet(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(i32),

    #[error("state file: {0}")]
    StateFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for internal operations.
pub type Result<T> = std::result::Result<T, Error>;
