//! Transaction state machines and handles.
//!
//! A transaction has two faces. The master handle ([`TrxMaster`]) lives on
//! the node where the client executes and owns the write-set under
//! construction. The slave handle ([`TrxSlave`]) describes the same
//! write-set as delivered in total order, on every node including the
//! origin; it is what flows through certification, apply and commit.
//!
//! The master owns a reference-counted slave handle after replication; the
//! slave's back-reference is the `(source, conn_id, trx_id)` identity, never
//! a pointer.
//!
//! Master states:
//!
//! ```text
//! EXECUTING -> REPLICATING -> CERTIFYING -> APPLYING -> COMMITTING -> COMMITTED
//!     ^                                                                  |
//!     +------------------------- streaming fragment --------------------+
//!
//! any pre-commit state --BF abort--> MUST_ABORT --> { MUST_REPLAY | ABORTING }
//! MUST_REPLAY --> REPLAYING --> COMMITTING
//! ABORTING --> { ROLLING_BACK -> ROLLED_BACK | ROLLED_BACK | EXECUTING }
//! ```
//!
//! The slave machine is a strict subset; replay adds
//! `APPLYING/COMMITTING -> REPLAYING -> COMMITTING`.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use quartzite_cache::BufferRef;
use quartzite_gcs::ScheduleHandle;
use quartzite_types::{ConnId, GlobalSeqno, LocalSeqno, NodeId, TrxId, WsFlags};

use crate::error::Result;
use crate::writeset::{WriteSet, WsKey, WS_VERSION};

// ============================================================================
// States
// ============================================================================

/// Transaction lifecycle states, shared by both handle kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrxState {
    Executing,
    MustAbort,
    Aborting,
    Replicating,
    Certifying,
    MustReplay,
    Replaying,
    Applying,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrxState::Executing => "EXECUTING",
            TrxState::MustAbort => "MUST_ABORT",
            TrxState::Aborting => "ABORTING",
            TrxState::Replicating => "REPLICATING",
            TrxState::Certifying => "CERTIFYING",
            TrxState::MustReplay => "MUST_REPLAY",
            TrxState::Replaying => "REPLAYING",
            TrxState::Applying => "APPLYING",
            TrxState::Committing => "COMMITTING",
            TrxState::RollingBack => "ROLLING_BACK",
            TrxState::Committed => "COMMITTED",
            TrxState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// Master-side transition table.
pub fn master_edge_allowed(from: TrxState, to: TrxState) -> bool {
    use TrxState::*;
    matches!(
        (from, to),
        (Executing, Replicating)
            | (Executing, RolledBack)
            | (Executing, MustAbort)
            | (Replicating, Certifying)
            | (Replicating, MustAbort)
            | (Certifying, Applying)
            | (Certifying, Aborting)
            | (Certifying, MustAbort)
            | (Applying, Committing)
            | (Applying, MustAbort)
            | (Committing, Committed)
            | (Committing, MustAbort)
            // streaming: next fragment starts executing again
            | (Committed, Executing)
            | (MustAbort, MustReplay)
            | (MustAbort, Aborting)
            | (MustReplay, Replaying)
            // in-order certification failed for a BF'ed action
            | (MustReplay, Aborting)
            | (Replaying, Committing)
            | (Aborting, RolledBack)
            | (Aborting, RollingBack)
            // streaming rollback returns to execution
            | (Aborting, Executing)
            | (RollingBack, RolledBack)
    )
}

/// Slave-side transition table.
pub fn slave_edge_allowed(from: TrxState, to: TrxState) -> bool {
    use TrxState::*;
    matches!(
        (from, to),
        (Replicating, Certifying)
            // BF'ed or skipped during state transfer
            | (Replicating, Aborting)
            | (Certifying, Applying)
            | (Certifying, Aborting)
            | (Aborting, RollingBack)
            | (Applying, Committing)
            | (Applying, Replaying)
            | (Committing, Replaying)
            | (Replaying, Committing)
            | (Committing, Committed)
            // error reported while leaving commit order
            | (Committing, RolledBack)
            | (RollingBack, RolledBack)
    )
}

// ============================================================================
// Slave handle
// ============================================================================

/// Shared handle to a delivered write-set.
pub type TrxSlavePtr = Arc<TrxSlave>;

#[derive(Debug)]
struct SlaveInner {
    state: TrxState,
    ws: WriteSet,
    global_seqno: GlobalSeqno,
    local_seqno: LocalSeqno,
    depends: GlobalSeqno,
    buf: Option<BufferRef>,
    local: bool,
    /// Certification failed (or skip placeholder): ordered but not applied.
    dummy: bool,
    /// Explicit rollback fragment: certification is bypassed.
    cert_bypass: bool,
    /// Parked in the pending certification queue.
    queued: bool,
}

/// Slave-side view of one write-set as delivered in total order.
#[derive(Debug)]
pub struct TrxSlave {
    inner: Mutex<SlaveInner>,
}

impl TrxSlave {
    /// Builds a slave handle from delivered action bytes.
    pub fn from_delivered(
        buf: BufferRef,
        seqno_g: GlobalSeqno,
        seqno_l: LocalSeqno,
        local: bool,
    ) -> Result<TrxSlavePtr> {
        let ws = WriteSet::decode(buf.data())?;
        let cert_bypass = ws.flags.is_rollback();
        Ok(Arc::new(Self {
            inner: Mutex::new(SlaveInner {
                state: TrxState::Replicating,
                ws,
                global_seqno: seqno_g,
                local_seqno: seqno_l,
                depends: GlobalSeqno::UNDEFINED,
                buf: Some(buf),
                local,
                dummy: false,
                cert_bypass,
                queued: false,
            }),
        }))
    }

    /// A placeholder for a skipped event (transfer gap filler).
    pub fn skip_placeholder(seqno_g: GlobalSeqno, buf: Option<BufferRef>) -> TrxSlavePtr {
        Arc::new(Self {
            inner: Mutex::new(SlaveInner {
                state: TrxState::Replicating,
                ws: WriteSet {
                    version: WS_VERSION,
                    source: NodeId::NIL,
                    conn_id: ConnId::UNDEFINED,
                    trx_id: TrxId::UNDEFINED,
                    flags: WsFlags::default(),
                    last_seen: GlobalSeqno::UNDEFINED,
                    keys: Vec::new(),
                    data: Bytes::new(),
                },
                global_seqno: seqno_g,
                local_seqno: LocalSeqno::UNDEFINED,
                depends: GlobalSeqno::UNDEFINED,
                buf,
                local: false,
                dummy: true,
                cert_bypass: false,
                queued: false,
            }),
        })
    }

    pub fn state(&self) -> TrxState {
        self.inner.lock().state
    }

    /// Shifts the slave state machine; panics on an illegal edge.
    pub fn set_state(&self, next: TrxState) {
        let mut inner = self.inner.lock();
        assert!(
            slave_edge_allowed(inner.state, next),
            "illegal slave transition {} -> {next} (seqno {})",
            inner.state,
            inner.global_seqno,
        );
        trace!(seqno = %inner.global_seqno, from = %inner.state, to = %next, "slave state");
        inner.state = next;
    }

    pub fn global_seqno(&self) -> GlobalSeqno {
        self.inner.lock().global_seqno
    }

    pub fn local_seqno(&self) -> LocalSeqno {
        self.inner.lock().local_seqno
    }

    pub fn last_seen(&self) -> GlobalSeqno {
        self.inner.lock().ws.last_seen
    }

    pub fn depends(&self) -> GlobalSeqno {
        self.inner.lock().depends
    }

    pub fn set_depends(&self, depends: GlobalSeqno) {
        self.inner.lock().depends = depends;
    }

    pub fn flags(&self) -> WsFlags {
        self.inner.lock().ws.flags
    }

    pub fn source(&self) -> NodeId {
        self.inner.lock().ws.source
    }

    pub fn trx_id(&self) -> TrxId {
        self.inner.lock().ws.trx_id
    }

    pub fn conn_id(&self) -> ConnId {
        self.inner.lock().ws.conn_id
    }

    pub fn data(&self) -> Bytes {
        self.inner.lock().ws.data.clone()
    }

    pub fn keys(&self) -> Vec<WsKey> {
        self.inner.lock().ws.keys.clone()
    }

    pub fn is_local(&self) -> bool {
        self.inner.lock().local
    }

    pub fn is_dummy(&self) -> bool {
        self.inner.lock().dummy
    }

    /// Marks this write-set ordered-but-not-applied (failed certification
    /// or voted inconsistent).
    pub fn mark_dummy(&self) {
        let mut inner = self.inner.lock();
        inner.dummy = true;
        inner.depends = GlobalSeqno::UNDEFINED;
    }

    pub fn cert_bypass(&self) -> bool {
        self.inner.lock().cert_bypass
    }

    pub fn is_queued(&self) -> bool {
        self.inner.lock().queued
    }

    pub fn set_queued(&self, queued: bool) {
        self.inner.lock().queued = queued;
    }

    pub fn buffer(&self) -> Option<BufferRef> {
        self.inner.lock().buf.clone()
    }

    /// Swaps the cache buffer (transfer overlap: the copy assigned by the
    /// transfer stream wins over the group-delivered one).
    pub fn exchange_buffer(&self, buf: BufferRef) {
        self.inner.lock().buf = Some(buf);
    }

    pub fn is_commit(&self) -> bool {
        self.flags().is_commit()
    }
}

impl fmt::Display for TrxSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "ws(source: {} trx: {} l: {} g: {} s: {} d: {} state: {}{})",
            inner.ws.source,
            inner.ws.trx_id,
            inner.local_seqno,
            inner.global_seqno,
            inner.ws.last_seen,
            inner.depends,
            inner.state,
            if inner.dummy { " dummy" } else { "" },
        )
    }
}

// ============================================================================
// Master handle
// ============================================================================

/// Shared handle to a client transaction on its origin node.
pub type TrxMasterPtr = Arc<TrxMaster>;

#[derive(Debug)]
struct MasterInner {
    state: TrxState,
    flags: WsFlags,
    keys: Vec<WsKey>,
    data: BytesMut,
    ts: Option<TrxSlavePtr>,
    gcs_handle: Option<ScheduleHandle>,
}

/// Master-side transaction handle, owned by the client session.
///
/// Mutated by the owning client thread; an aborter thread only ever flips
/// the state to `MUST_ABORT` through [`TrxMaster::set_state`], which the
/// owner observes at every yield point.
#[derive(Debug)]
pub struct TrxMaster {
    source: NodeId,
    conn_id: ConnId,
    trx_id: TrxId,
    inner: Mutex<MasterInner>,
}

impl TrxMaster {
    pub fn new(source: NodeId, conn_id: ConnId, trx_id: TrxId) -> TrxMasterPtr {
        Arc::new(Self {
            source,
            conn_id,
            trx_id,
            inner: Mutex::new(MasterInner {
                state: TrxState::Executing,
                flags: WsFlags::new(WsFlags::BEGIN),
                keys: Vec::new(),
                data: BytesMut::new(),
                ts: None,
                gcs_handle: None,
            }),
        })
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    pub fn state(&self) -> TrxState {
        self.inner.lock().state
    }

    /// Shifts the master state machine; panics on an illegal edge.
    pub fn set_state(&self, next: TrxState) {
        let mut inner = self.inner.lock();
        assert!(
            master_edge_allowed(inner.state, next),
            "illegal master transition {} -> {next} (trx {})",
            inner.state,
            self.trx_id,
        );
        trace!(trx = %self.trx_id, from = %inner.state, to = %next, "master state");
        inner.state = next;
    }

    /// `set_state` that tolerates a concurrent BF abort: returns false if
    /// the transaction was flipped to `MUST_ABORT` instead.
    pub fn try_set_state(&self, next: TrxState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TrxState::MustAbort && next != TrxState::MustAbort {
            return false;
        }
        assert!(
            master_edge_allowed(inner.state, next),
            "illegal master transition {} -> {next} (trx {})",
            inner.state,
            self.trx_id,
        );
        inner.state = next;
        true
    }

    pub fn flags(&self) -> WsFlags {
        self.inner.lock().flags
    }

    pub fn set_flags(&self, flags: WsFlags) {
        self.inner.lock().flags = flags;
    }

    pub fn append_key(&self, key: WsKey) {
        self.inner.lock().keys.push(key);
    }

    pub fn append_data(&self, data: &[u8]) {
        self.inner.lock().data.extend_from_slice(data);
    }

    /// Size of the write-set built so far.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.data.len() + inner.keys.iter().map(|k| k.0.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.keys.is_empty() && inner.data.is_empty()
    }

    /// Freezes the write-set for replication, stamping the snapshot seqno.
    pub fn finalize(&self, last_seen: GlobalSeqno) -> WriteSet {
        let inner = self.inner.lock();
        WriteSet {
            version: WS_VERSION,
            source: self.source,
            conn_id: self.conn_id,
            trx_id: self.trx_id,
            flags: inner.flags,
            last_seen,
            keys: inner.keys.clone(),
            data: inner.data.clone().freeze(),
        }
    }

    pub fn ts(&self) -> Option<TrxSlavePtr> {
        self.inner.lock().ts.clone()
    }

    pub fn set_ts(&self, ts: TrxSlavePtr) {
        self.inner.lock().ts = Some(ts);
    }

    pub fn reset_ts(&self) {
        self.inner.lock().ts = None;
    }

    pub fn gcs_handle(&self) -> Option<ScheduleHandle> {
        self.inner.lock().gcs_handle
    }

    pub fn set_gcs_handle(&self, handle: Option<ScheduleHandle>) {
        self.inner.lock().gcs_handle = handle;
    }

    /// Resets per-fragment state for the next streaming fragment.
    pub fn next_fragment(&self) {
        let mut inner = self.inner.lock();
        inner.keys.clear();
        inner.data.clear();
        inner.flags = WsFlags::default();
        inner.ts = None;
    }
}

impl fmt::Display for TrxMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "trx(source: {} conn: {} id: {} flags: {} state: {})",
            self.source, self.conn_id, self.trx_id, inner.flags, inner.state,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TrxState::Executing, TrxState::Replicating, true)]
    #[test_case(TrxState::Replicating, TrxState::Certifying, true)]
    #[test_case(TrxState::Certifying, TrxState::Applying, true)]
    #[test_case(TrxState::Applying, TrxState::Committing, true)]
    #[test_case(TrxState::Committing, TrxState::Committed, true)]
    #[test_case(TrxState::Committed, TrxState::Executing, true; "streaming fragment")]
    #[test_case(TrxState::MustAbort, TrxState::MustReplay, true)]
    #[test_case(TrxState::MustAbort, TrxState::Aborting, true)]
    #[test_case(TrxState::MustReplay, TrxState::Replaying, true)]
    #[test_case(TrxState::Replaying, TrxState::Committing, true)]
    #[test_case(TrxState::Executing, TrxState::Committed, false)]
    #[test_case(TrxState::Committed, TrxState::MustAbort, false; "committed is final")]
    #[test_case(TrxState::RolledBack, TrxState::Executing, false)]
    fn master_edges(from: TrxState, to: TrxState, allowed: bool) {
        assert_eq!(master_edge_allowed(from, to), allowed);
    }

    #[test_case(TrxState::Replicating, TrxState::Certifying, true)]
    #[test_case(TrxState::Certifying, TrxState::Applying, true)]
    #[test_case(TrxState::Certifying, TrxState::Aborting, true)]
    #[test_case(TrxState::Applying, TrxState::Replaying, true)]
    #[test_case(TrxState::Committing, TrxState::Replaying, true)]
    #[test_case(TrxState::Aborting, TrxState::RollingBack, true)]
    #[test_case(TrxState::Replicating, TrxState::Applying, false)]
    #[test_case(TrxState::Replicating, TrxState::MustAbort, false; "no must abort on slave")]
    fn slave_edges(from: TrxState, to: TrxState, allowed: bool) {
        assert_eq!(slave_edge_allowed(from, to), allowed);
    }

    #[test]
    fn master_builds_writeset() {
        let trx = TrxMaster::new(NodeId::random(), ConnId::new(1), TrxId::new(9));
        trx.append_key(WsKey::new(&b"k1"[..]));
        trx.append_data(b"payload");
        trx.set_flags(trx.flags().with(WsFlags::COMMIT));

        let ws = trx.finalize(GlobalSeqno::new(3));
        assert_eq!(ws.trx_id, TrxId::new(9));
        assert_eq!(ws.last_seen, GlobalSeqno::new(3));
        assert_eq!(ws.keys.len(), 1);
        assert!(ws.flags.is_commit());
        assert_eq!(ws.data.as_ref(), b"payload");
    }

    #[test]
    fn slave_handle_from_delivered_bytes() {
        let trx = TrxMaster::new(NodeId::random(), ConnId::new(1), TrxId::new(9));
        trx.append_key(WsKey::new(&b"k1"[..]));
        trx.append_data(b"payload");
        let encoded = trx.finalize(GlobalSeqno::new(0)).encode();

        let cache = quartzite_cache::WriteSetCache::new();
        let buf = cache.store(encoded);
        let ts = TrxSlave::from_delivered(buf, GlobalSeqno::new(1), LocalSeqno::new(1), false)
            .unwrap();

        assert_eq!(ts.state(), TrxState::Replicating);
        assert_eq!(ts.global_seqno(), GlobalSeqno::new(1));
        assert_eq!(ts.trx_id(), TrxId::new(9));
        assert!(!ts.is_local());
        assert!(!ts.cert_bypass());
    }

    #[test]
    fn rollback_fragment_bypasses_certification() {
        let trx = TrxMaster::new(NodeId::random(), ConnId::new(1), TrxId::new(9));
        trx.set_flags(WsFlags::new(WsFlags::ROLLBACK));
        let encoded = trx.finalize(GlobalSeqno::new(0)).encode();

        let cache = quartzite_cache::WriteSetCache::new();
        let buf = cache.store(encoded);
        let ts = TrxSlave::from_delivered(buf, GlobalSeqno::new(1), LocalSeqno::new(1), true)
            .unwrap();
        assert!(ts.cert_bypass());
    }

    #[test]
    #[should_panic(expected = "illegal master transition")]
    fn illegal_master_edge_panics() {
        let trx = TrxMaster::new(NodeId::random(), ConnId::new(1), TrxId::new(9));
        trx.set_state(TrxState::Committed);
    }

    #[test]
    fn try_set_state_observes_concurrent_abort() {
        let trx = TrxMaster::new(NodeId::random(), ConnId::new(1), TrxId::new(9));
        trx.set_state(TrxState::MustAbort);
        assert!(!trx.try_set_state(TrxState::Replicating));
        assert_eq!(trx.state(), TrxState::MustAbort);
    }
}
