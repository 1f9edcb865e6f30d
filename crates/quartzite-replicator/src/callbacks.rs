//! Callbacks from the replication core into the embedding database engine.

use bytes::Bytes;

use quartzite_types::{GlobalSeqno, Gtid, NodeId, TrxId, View, WsFlags};

/// Callback outcome. Anything but `Success` is fatal for the node: the core
/// surfaces a zero view and shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbResult {
    Success,
    Failure,
}

/// One ordered write-set handed to the apply callback.
#[derive(Debug, Clone)]
pub struct ApplyEvent {
    /// Position of this write-set in group history.
    pub gtid: Gtid,
    pub source: NodeId,
    pub trx_id: TrxId,
    pub flags: WsFlags,
    /// Newest predecessor this write-set depends on.
    pub depends: GlobalSeqno,
    /// Opaque replicated data.
    pub data: Bytes,
}

/// Application-reported apply failure, voted on across the group.
#[derive(Debug, Clone)]
pub struct ApplyError {
    pub message: Bytes,
}

/// The embedder's side of the replication contract.
///
/// Callbacks are invoked from applier threads; implementations must be
/// thread-safe. Returning [`CbResult::Failure`] from any of them aborts the
/// node after a best-effort zero view.
pub trait ApplicationCallbacks: Send + Sync {
    /// A new view was installed.
    fn view_cb(&self, view: &View) -> CbResult;

    /// First connection to a group (or group change); delivered before the
    /// corresponding view.
    fn connected_cb(&self, view: &View) -> CbResult {
        let _ = view;
        CbResult::Success
    }

    /// The node needs a state snapshot; return the opaque request payload
    /// forwarded to the donor, or `None` if no snapshot is required
    /// (equivalent to the trivial transfer marker).
    fn sst_request_cb(&self) -> Option<Bytes>;

    /// Apply one ordered write-set. Runs inside the apply monitor.
    fn apply_cb(&self, event: &ApplyEvent) -> Result<(), ApplyError>;

    /// Out-of-order payload delivery (unordered actions).
    fn unordered_cb(&self, data: &Bytes) -> CbResult {
        let _ = data;
        CbResult::Success
    }

    /// Serve a state snapshot to a joiner. `bypass` is set when only the
    /// missing write-set range is needed (IST-only donation).
    fn sst_donate_cb(&self, request: &Bytes, gtid: Gtid, bypass: bool) -> CbResult;

    /// The node reached the SYNCED state.
    fn synced_cb(&self) -> CbResult;
}
