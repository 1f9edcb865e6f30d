//! The replication core: certification, ordered apply/commit, BF aborts,
//! configuration changes and state transfer glue.
//!
//! Data flow: the dispatch loop ([`Replicator::async_recv`] /
//! [`Replicator::process_one`]) drains ordered actions from group
//! communication. Every action enters the local monitor in local-seqno
//! order; write-sets certify there, then proceed through the apply monitor
//! (global order relaxed by dependencies) and the commit monitor (strict
//! global order). The committed position is reported back to the group so
//! members can purge caches and certification indexes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use quartzite_cache::{BufKind, BufferRef, WriteSetCache};
use quartzite_cert::{CertOutcome, CertRequest, Certification, PendingCertQueue, Verdict};
use quartzite_config::ParamStore;
use quartzite_gcs::{Action, ConfChange, Gcs, Payload};
use quartzite_ist::{Receiver as IstReceiver, ReceiverConfig, SenderPool};
use quartzite_monitor::SeqnoMonitor;
use quartzite_types::{
    Capabilities, ConnId, GlobalSeqno, GroupId, Gtid, LocalSeqno, MemberState, NodeId, TrxId, View,
    WsFlags,
};

use crate::callbacks::{ApplicationCallbacks, ApplyError, ApplyEvent, CbResult};
use crate::error::{Error, Result};
use crate::orders::{ApplyOrder, CommitOrder, CommitOrderMode, LocalOrder};
use crate::params::{self, keys, ResolvedParams, MAX_PROTO_VER, PROTO_VER_ORDERED_CC};
use crate::error::Status;
use crate::state_file::SavedState;
use crate::state_machine::{NodeState, StateMachine};
use crate::trx::{TrxMaster, TrxMasterPtr, TrxSlave, TrxSlavePtr, TrxState};
use crate::writeset::PayloadCodec;

/// Capabilities advertised with every view.
fn capabilities(proto_ver: i32) -> Capabilities {
    let mut caps = Capabilities::MULTI_MASTER
        | Capabilities::CERTIFICATION
        | Capabilities::PARALLEL_APPLYING
        | Capabilities::TRX_REPLAY
        | Capabilities::ISOLATION
        | Capabilities::PAUSE
        | Capabilities::CAUSAL_READS;
    if proto_ver >= 4 {
        caps |= Capabilities::INCREMENTAL_WRITESET;
    }
    if proto_ver >= 10 {
        caps |= Capabilities::NBO;
    }
    Capabilities::new(caps)
}

/// Write-set protocol version for a replication protocol version.
pub(crate) fn trx_proto_for(repl_proto: i32) -> Result<i32> {
    Ok(match repl_proto {
        1 | 2 => 1,
        3 | 4 => 2,
        5..=8 => 3,
        9 => 4,
        10 => 5,
        other => return Err(Error::UnsupportedProtocol(other)),
    })
}

// ============================================================================
// Statistics
// ============================================================================

/// Monotonic counters; snapshot with [`Replicator::stats`].
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub replicated: AtomicU64,
    pub replicated_bytes: AtomicU64,
    pub received: AtomicU64,
    pub received_bytes: AtomicU64,
    pub local_commits: AtomicU64,
    pub local_cert_failures: AtomicU64,
    pub local_bf_aborts: AtomicU64,
    pub local_replays: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub replicated: u64,
    pub replicated_bytes: u64,
    pub received: u64,
    pub received_bytes: u64,
    pub local_commits: u64,
    pub local_cert_failures: u64,
    pub local_bf_aborts: u64,
    pub local_replays: u64,
    pub last_committed: i64,
}

// ============================================================================
// State transfer request payload
// ============================================================================

/// Joiner's state request as routed through the group to the donor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StRequest {
    /// Joiner's transfer receive endpoint.
    pub recv_addr: String,
    /// Joiner's current history position; donors in the same history may
    /// serve the gap incrementally.
    pub position: Gtid,
    /// Opaque snapshot request from the application; `None` means only the
    /// write-set gap is needed.
    pub app_req: Option<Bytes>,
}

impl StRequest {
    fn encode(&self) -> Bytes {
        Bytes::from(postcard::to_allocvec(self).expect("state request serialization cannot fail"))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| Error::MalformedWriteSet(e.to_string()))
    }
}

// ============================================================================
// IST event queue
// ============================================================================

pub(crate) enum IstEvent {
    WriteSet {
        ts: TrxSlavePtr,
        must_apply: bool,
        preload: bool,
    },
    ConfChange {
        seqno: GlobalSeqno,
        conf: ConfChange,
        must_apply: bool,
    },
    Eof(std::result::Result<GlobalSeqno, quartzite_ist::Error>),
}

#[derive(Default)]
pub(crate) struct IstEventQueue {
    queue: Mutex<VecDeque<IstEvent>>,
    cond: Condvar,
}

impl IstEventQueue {
    fn push(&self, event: IstEvent) {
        self.queue.lock().push_back(event);
        self.cond.notify_all();
    }

    fn pop(&self) -> Option<IstEvent> {
        self.queue.lock().pop_front()
    }

    fn pop_wait(&self, timeout: Duration) -> Option<IstEvent> {
        let mut queue = self.queue.lock();
        if let Some(e) = queue.pop_front() {
            return Some(e);
        }
        let _ = self.cond.wait_for(&mut queue, timeout);
        queue.pop_front()
    }
}

/// Bridges the transfer receiver thread into the core's event queue.
struct IstHandler {
    queue: Arc<IstEventQueue>,
}

impl quartzite_ist::EventHandler for IstHandler {
    fn ist_writeset(
        &self,
        seqno: GlobalSeqno,
        buf: BufferRef,
        skip: bool,
        must_apply: bool,
        preload: bool,
    ) {
        let ts = if skip {
            TrxSlave::skip_placeholder(seqno, Some(buf))
        } else {
            match TrxSlave::from_delivered(buf.clone(), seqno, LocalSeqno::UNDEFINED, false) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(seqno = %seqno, error = %e, "undecodable transferred write-set");
                    TrxSlave::skip_placeholder(seqno, Some(buf))
                }
            }
        };
        self.queue.push(IstEvent::WriteSet {
            ts,
            must_apply,
            preload,
        });
    }

    fn ist_conf_change(&self, seqno: GlobalSeqno, buf: BufferRef, must_apply: bool, _preload: bool) {
        match ConfChange::decode(buf.data()) {
            Ok(conf) => self.queue.push(IstEvent::ConfChange {
                seqno,
                conf,
                must_apply,
            }),
            Err(e) => warn!(seqno = %seqno, error = %e, "undecodable transferred conf change"),
        }
    }

    fn ist_end(&self, result: std::result::Result<GlobalSeqno, quartzite_ist::Error>) {
        self.queue.push(IstEvent::Eof(result));
    }
}

// ============================================================================
// Core state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SstState {
    None,
    Waiting,
    JoinSent,
}

#[derive(Debug)]
struct CoreState {
    /// Current cluster history id.
    group: GroupId,
    /// Negotiated replication protocol; -1 before the first primary view.
    protocol_version: i32,
    first_view_seen: bool,
    /// Seqno of the last processed configuration change.
    cc_seqno: GlobalSeqno,
    /// Lowest live certification entry at the last CC (preload boundary).
    cc_lowest_trx_seqno: GlobalSeqno,
    /// Position installed by the last state snapshot.
    sst_seqno: GlobalSeqno,
    sst_state: SstState,
    /// Result of an in-flight snapshot handoff.
    sst_result: Option<(Gtid, i64)>,
    corrupt: bool,
    closing: bool,
    safe_to_bootstrap: bool,
    incoming: Vec<String>,
    pause_at: Option<LocalSeqno>,
    /// Peers served by write-set-only donations; rejoin when their sender
    /// finishes.
    bypass_peers: HashSet<String>,
}

/// One node's replication engine.
pub struct Replicator {
    node_name: String,
    incoming_addr: String,
    node_id: NodeId,

    callbacks: Arc<dyn ApplicationCallbacks>,
    gcs: Gcs,
    cache: WriteSetCache,

    cert: Mutex<Certification>,
    pending_cert_queue: PendingCertQueue<TrxSlavePtr>,

    local_monitor: SeqnoMonitor,
    apply_monitor: SeqnoMonitor,
    commit_monitor: SeqnoMonitor,
    co_mode: CommitOrderMode,

    state: StateMachine,
    core: Mutex<CoreState>,
    sst_cond: Condvar,
    saved_state: SavedState,

    params: Mutex<ParamStore>,
    resolved: ResolvedParams,

    local_trxs: Mutex<HashMap<u64, TrxMasterPtr>>,
    receivers: AtomicUsize,

    ist_receiver: IstReceiver,
    ist_senders: Arc<SenderPool>,
    ist_events: Arc<IstEventQueue>,

    counters: StatsCounters,
}

impl Replicator {
    /// Builds the engine around a group communication backend.
    ///
    /// `make_gcs` receives the node's write-set cache so the backend can
    /// hand delivered buffers through it.
    pub fn new(
        mut store: ParamStore,
        callbacks: Arc<dyn ApplicationCallbacks>,
        node_name: &str,
        incoming_addr: &str,
        make_gcs: impl FnOnce(&WriteSetCache) -> Gcs,
    ) -> Result<Arc<Self>> {
        params::register(&mut store);
        let resolved = ResolvedParams::from_store(&store)?;
        store.seal();

        let saved_state = SavedState::open(std::path::Path::new(&resolved.base_dir))?;
        let position = saved_state.position();

        let cache = WriteSetCache::new();
        let gcs = make_gcs(&cache);
        let node_id = gcs.node_id();

        let trx_ver = trx_proto_for(resolved.proto_max)?;
        let mut cert = Certification::new(trx_ver);
        let monitor_pos = position.seqno.get().max(0);
        if !position.seqno.is_undefined() && !position.group.is_nil() {
            cert.assign_initial_position(position, trx_ver);
            gcs.set_initial_position(position)?;
            cache.reset(position);
        }

        let ist_events = Arc::new(IstEventQueue::default());
        let ist_receiver = IstReceiver::new(
            ReceiverConfig {
                recv_addr: resolved.ist_recv_addr.clone(),
                recv_bind: resolved.ist_recv_bind.clone(),
                base_host: resolved.base_host.clone(),
                base_port: resolved.base_port,
                keep_keys: resolved.ist_keep_keys,
                tls: None,
            },
            cache.clone(),
            Arc::new(IstHandler {
                queue: Arc::clone(&ist_events),
            }),
        );
        let ist_senders = SenderPool::new(
            cache.clone(),
            resolved.ist_keep_keys,
            None,
            Arc::new(PayloadCodec),
        );

        info!(
            node = %node_id,
            name = node_name,
            position = %position,
            commit_order = ?resolved.commit_order,
            "replicator initialized"
        );

        let repl = Arc::new(Self {
            node_name: node_name.to_string(),
            incoming_addr: incoming_addr.to_string(),
            node_id,
            callbacks,
            gcs,
            cache,
            cert: Mutex::new(cert),
            pending_cert_queue: PendingCertQueue::new(),
            local_monitor: SeqnoMonitor::new("local"),
            apply_monitor: SeqnoMonitor::with_position("apply", monitor_pos),
            commit_monitor: SeqnoMonitor::with_position("commit", monitor_pos),
            co_mode: resolved.commit_order,
            state: StateMachine::new(),
            core: Mutex::new(CoreState {
                group: position.group,
                protocol_version: -1,
                first_view_seen: false,
                cc_seqno: GlobalSeqno::UNDEFINED,
                cc_lowest_trx_seqno: GlobalSeqno::UNDEFINED,
                sst_seqno: GlobalSeqno::UNDEFINED,
                sst_state: SstState::None,
                sst_result: None,
                corrupt: false,
                closing: false,
                safe_to_bootstrap: saved_state.safe_to_bootstrap(),
                incoming: Vec::new(),
                pause_at: None,
                bypass_peers: HashSet::new(),
            }),
            sst_cond: Condvar::new(),
            saved_state,
            params: Mutex::new(store),
            resolved,
            local_trxs: Mutex::new(HashMap::new()),
            receivers: AtomicUsize::new(0),
            ist_receiver,
            ist_senders,
            ist_events,
            counters: StatsCounters::default(),
        });

        // donation completion feeds back into the node state machine
        let weak = Arc::downgrade(&repl);
        repl.ist_senders.set_on_done(Arc::new(move |peer, seqno| {
            if let Some(repl) = weak.upgrade() {
                repl.ist_send_done(peer, seqno);
            }
        }));
        Ok(repl)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_state(&self) -> NodeState {
        self.state.get()
    }

    pub fn corrupt(&self) -> bool {
        self.core.lock().corrupt
    }

    pub fn cache(&self) -> &WriteSetCache {
        &self.cache
    }

    /// Highest seqno known committed on this node.
    pub fn last_committed(&self) -> GlobalSeqno {
        let s = if self.co_mode.uses_monitor() {
            self.commit_monitor.last_left()
        } else {
            self.apply_monitor.last_left()
        };
        GlobalSeqno::new(s)
    }

    /// Last committed position with its history id.
    pub fn last_committed_id(&self) -> Gtid {
        Gtid::new(self.core.lock().group, self.last_committed())
    }

    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            replicated: c.replicated.load(Ordering::Relaxed),
            replicated_bytes: c.replicated_bytes.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            received_bytes: c.received_bytes.load(Ordering::Relaxed),
            local_commits: c.local_commits.load(Ordering::Relaxed),
            local_cert_failures: c.local_cert_failures.load(Ordering::Relaxed),
            local_bf_aborts: c.local_bf_aborts.load(Ordering::Relaxed),
            local_replays: c.local_replays.load(Ordering::Relaxed),
            last_committed: self.last_committed().get(),
        }
    }

    pub fn param_set(&self, key: &str, value: &str) -> Status {
        match self.params.lock().set(key, value) {
            Ok(()) => Status::Ok,
            Err(quartzite_config::Error::UnknownKey(_)) => Status::Warning,
            Err(e) => {
                warn!(key, value, error = %e, "parameter rejected");
                Status::Warning
            }
        }
    }

    pub fn param_get(&self, key: &str) -> Option<String> {
        self.params.lock().get(key).ok().map(str::to_string)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Joins the group. The node becomes operational once the dispatch
    /// loop has processed the resulting primary view.
    pub fn connect(&self, cluster_name: &str, cluster_url: &str, bootstrap: bool) -> Status {
        if bootstrap && !self.saved_state.safe_to_bootstrap() {
            error!(
                "it may not be safe to bootstrap the cluster from this node; \
                 if you are sure, edit the grastate.dat file and set \
                 safe_to_bootstrap to 1"
            );
            return Status::NodeFail;
        }
        let position = self.saved_state.position();
        if let Err(e) = self.gcs.set_initial_position(position) {
            error!(error = %e, "failed to seed group position");
            return Status::NodeFail;
        }
        // seqno is undefined on disk while we may be applying
        self.saved_state.mark_unsafe();

        match self.gcs.connect(cluster_name, cluster_url, bootstrap) {
            Ok(()) => {
                self.state.shift_to(NodeState::Connected);
                Status::Ok
            }
            Err(e) => {
                error!(error = %e, "group connect failed");
                Status::NodeFail
            }
        }
    }

    /// Starts an orderly shutdown; the self-leave view shifts the node to
    /// CLOSED once it drains through the dispatch loop.
    pub fn close(&self) -> Status {
        {
            let mut core = self.core.lock();
            if core.closing {
                return Status::Ok;
            }
            core.closing = true;
        }
        self.ist_senders.cancel();
        if self.ist_receiver.running() {
            self.ist_receiver.finished();
        }
        self.gcs.close();
        Status::Ok
    }

    fn start_closing(&self) {
        let mut core = self.core.lock();
        core.closing = true;
    }

    fn shift_to_closed(&self) {
        self.state.shift_to(NodeState::Closed);
        let core = self.core.lock();
        self.saved_state
            .set(core.group, self.last_committed(), core.safe_to_bootstrap);
    }

    fn on_inconsistency(&self) {
        error!("node consistency compromised, leaving cluster");
        {
            let mut core = self.core.lock();
            core.corrupt = true;
        }
        self.saved_state.mark_corrupt();
        self.close();
    }

    /// Surfaces a zero view so the application can clean up, then closes.
    fn deliver_zero_view(&self) {
        let group = self.core.lock().group;
        let view = View::zero(group);
        let _ = self.callbacks.view_cb(&view);
        self.shift_to_closed();
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Applier thread body: drains ordered actions until close or failure.
    pub fn async_recv(&self) -> Status {
        if self.state.get() <= NodeState::Closed {
            error!("receive loop cannot start, node is closed");
            return Status::Fatal;
        }

        self.receivers.fetch_add(1, Ordering::SeqCst);
        let mut retval = Status::Ok;

        while retval == Status::Ok && self.state.get() > NodeState::Closed {
            match self.process_one() {
                Ok(()) => {}
                Err(Error::Gcs(quartzite_gcs::Error::Paused)) => {
                    // state transfer controller owns the stream; serve its
                    // events and retry
                    self.process_available_ist_events();
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(Error::Gcs(quartzite_gcs::Error::Closed)) => break,
                Err(Error::Gcs(quartzite_gcs::Error::NotConnected)) => {
                    retval = Status::ConnFail;
                }
                Err(e) => {
                    if self.corrupt() {
                        retval = Status::Fatal;
                    } else {
                        warn!(error = %e, "dispatch failed");
                        retval = Status::ConnFail;
                    }
                }
            }
        }

        let remaining = self.receivers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let closing = self.core.lock().closing;
            if self.state.get() > NodeState::Closed && !closing {
                // last receiver exiting on error: leave the group cleanly
                warn!(retval = %retval, "last applier thread exiting, closing node");
                self.start_closing();
                self.deliver_zero_view();
            } else if self.state.get() > NodeState::Closed {
                self.shift_to_closed();
            }
        }

        debug!(retval = %retval, "applier thread exit");
        retval
    }

    /// Receives and dispatches exactly one action.
    pub fn process_one(&self) -> Result<()> {
        let action = self.gcs.recv()?;
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.dispatch(action)
    }

    fn dispatch(&self, action: Action) -> Result<()> {
        let seqno_l = action.seqno_l;
        let seqno_g = action.seqno_g;
        debug!(kind = action.kind_name(), seqno_g = %seqno_g, seqno_l = %seqno_l, "action");

        match action.payload {
            Payload::WriteSet(buf) => {
                self.counters
                    .received_bytes
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                let ts = TrxSlave::from_delivered(buf, seqno_g, seqno_l, false)?;
                self.process_trx(&ts);
                Ok(())
            }
            Payload::CommitCut(cut) => {
                self.process_commit_cut(cut, seqno_l);
                Ok(())
            }
            Payload::ConfChange {
                conf,
                my_index,
                buf,
            } => {
                self.process_conf_change(&conf, my_index, buf, seqno_l, seqno_g);
                Ok(())
            }
            Payload::StateRequest(req) => {
                self.process_state_req(&req, seqno_l, seqno_g);
                Ok(())
            }
            Payload::Join(code) => {
                self.process_join(code, seqno_l);
                Ok(())
            }
            Payload::Sync => {
                self.process_sync(seqno_l);
                Ok(())
            }
            Payload::Vote { gtid, code } => {
                self.process_vote(gtid, code, seqno_l);
                Ok(())
            }
            Payload::Inconsistency => {
                self.on_inconsistency();
                Err(Error::Gcs(quartzite_gcs::Error::Closed))
            }
        }
    }
}

// ============================================================================
// Local transactions: replicate / certify / commit ordering
// ============================================================================

impl Replicator {
    /// Looks up or creates the master handle for a client transaction.
    pub fn get_local_trx(&self, trx_id: TrxId, create: bool) -> Option<TrxMasterPtr> {
        let mut trxs = self.local_trxs.lock();
        match trxs.get(&trx_id.get()) {
            Some(trx) => Some(Arc::clone(trx)),
            None if create => {
                let trx = TrxMaster::new(self.node_id, ConnId::UNDEFINED, trx_id);
                trxs.insert(trx_id.get(), Arc::clone(&trx));
                Some(trx)
            }
            None => None,
        }
    }

    pub fn discard_local_trx(&self, trx_id: TrxId) {
        self.local_trxs.lock().remove(&trx_id.get());
    }

    /// Submits the transaction's write-set for total ordering.
    ///
    /// On `Ok` the transaction holds a slave handle with assigned seqnos
    /// and must proceed to [`Replicator::certify`].
    pub fn replicate(&self, trx: &TrxMasterPtr) -> Status {
        assert!(!trx.flags().is_rollback());

        if self.state.get() < NodeState::Joined || trx.state() == TrxState::MustAbort {
            return self.replicate_failed(trx);
        }

        if trx.size() > self.resolved.max_ws_size {
            warn!(trx = %trx.trx_id(), size = trx.size(), "write-set too large");
            trx.set_state(TrxState::MustAbort);
            self.replicate_failed(trx);
            return Status::SizeExceeded;
        }

        let payload = trx.finalize(self.last_committed()).encode();
        trx.set_state(TrxState::Replicating);

        let replicated = loop {
            let handle = match self.gcs.schedule() {
                Ok(h) => h,
                Err(e) => {
                    debug!(error = %e, "group schedule failed");
                    return self.replicate_failed(trx);
                }
            };
            trx.set_gcs_handle(Some(handle));

            match self.gcs.repl(payload.clone(), Some(handle)) {
                Ok(r) => break r,
                Err(quartzite_gcs::Error::Interrupted) => {
                    // BF abort observed while scheduled into the group
                    trx.set_gcs_handle(None);
                    return self.replicate_failed(trx);
                }
                Err(e) => {
                    trx.set_gcs_handle(None);
                    debug!(trx = %trx.trx_id(), error = %e, "replication failed");
                    return self.replicate_failed(trx);
                }
            }
        };
        trx.set_gcs_handle(None);

        self.counters.replicated.fetch_add(1, Ordering::Relaxed);
        self.counters
            .replicated_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let ts = match TrxSlave::from_delivered(
            replicated.buf,
            replicated.seqno_g,
            replicated.seqno_l,
            true,
        ) {
            Ok(ts) => ts,
            Err(e) => {
                error!(error = %e, "own write-set failed to decode");
                return self.replicate_failed(trx);
            }
        };
        trx.set_ts(Arc::clone(&ts));

        if trx.state() == TrxState::MustAbort {
            // aborted between ordering and return
            self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
            if ts.is_commit() {
                trx.set_state(TrxState::MustReplay);
                return Status::BfAbort;
            }
            trx.set_state(TrxState::Aborting);
            self.queue_aborted_for_cert(&ts);
            return Status::TrxFail;
        }

        debug_assert_eq!(trx.state(), TrxState::Replicating);
        Status::Ok
    }

    /// Rolls a transaction into the aborting lane before it was ordered.
    fn replicate_failed(&self, trx: &TrxMasterPtr) -> Status {
        if matches!(trx.state(), TrxState::Executing | TrxState::Replicating) {
            trx.set_state(TrxState::MustAbort);
        }
        if trx.state() == TrxState::MustAbort {
            trx.set_state(TrxState::Aborting);
        }
        if trx.ts().is_some() {
            trx.reset_ts();
        }
        if self.corrupt() {
            Status::NodeFail
        } else {
            Status::ConnFail
        }
    }

    /// Replicates an explicit rollback fragment of a streaming transaction.
    ///
    /// Uses grab-mode sending so rollback cannot deadlock behind flow
    /// control, bypasses certification and never blocks in monitors.
    pub fn send_rollback_fragment(&self, trx: &TrxMasterPtr) -> Status {
        assert!(trx.flags().is_rollback());
        let payload = trx.finalize(self.last_committed()).encode();

        let replicated = match self.gcs.repl_grab(payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "rollback fragment replication failed");
                return Status::ConnFail;
            }
        };
        let ts = match TrxSlave::from_delivered(
            replicated.buf,
            replicated.seqno_g,
            replicated.seqno_l,
            true,
        ) {
            Ok(ts) => ts,
            Err(e) => {
                error!(error = %e, "own rollback fragment failed to decode");
                return Status::ConnFail;
            }
        };
        debug_assert!(ts.cert_bypass());
        self.queue_aborted_for_cert(&ts);
        Status::Ok
    }

    /// Parks a BF-aborted write-set for in-order certification and cancels
    /// its monitor slots.
    fn queue_aborted_for_cert(&self, ts: &TrxSlavePtr) {
        ts.set_queued(true);
        self.pending_cert_queue.push(ts.local_seqno(), Arc::clone(ts));
        self.local_monitor.self_cancel(&LocalOrder::for_ts(ts));
        self.cancel_global_monitors(ts.global_seqno());
    }

    fn cancel_global_monitors(&self, seqno: GlobalSeqno) {
        self.apply_monitor
            .self_cancel(&ApplyOrder::cancel_only(seqno));
        if self.co_mode.uses_monitor() {
            self.commit_monitor
                .self_cancel(&CommitOrder::cancel_only(seqno, self.co_mode));
        }
    }

    /// Certifies a replicated transaction and, on success, admits it to
    /// the apply stage.
    pub fn certify(&self, trx: &TrxMasterPtr) -> Status {
        assert_eq!(trx.state(), TrxState::Replicating);
        let ts = trx.ts().expect("certify without replicated write-set");
        assert!(!ts.flags().is_rollback());

        let retval = self.cert_for(Some(trx), &ts);
        if retval != Status::Ok {
            return retval;
        }

        if self.enter_apply_monitor_for_local(trx, &ts) {
            ts.set_state(TrxState::Applying);
            if trx.state() == TrxState::MustAbort {
                self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
                trx.set_state(TrxState::MustReplay);
                Status::BfAbort
            } else {
                Status::Ok
            }
        } else {
            self.handle_apply_monitor_interrupted(trx, &ts)
        }
    }

    fn enter_apply_monitor_for_local(&self, trx: &TrxMasterPtr, ts: &TrxSlavePtr) -> bool {
        assert!(ts.global_seqno() > self.last_committed());
        trx.set_state(TrxState::Applying);
        self.apply_monitor.enter(&ApplyOrder::for_ts(ts)).is_ok()
    }

    fn handle_apply_monitor_interrupted(&self, trx: &TrxMasterPtr, ts: &TrxSlavePtr) -> Status {
        assert_eq!(trx.state(), TrxState::MustAbort);
        self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
        if ts.is_commit() {
            trx.set_state(TrxState::MustReplay);
            Status::BfAbort
        } else {
            trx.set_state(TrxState::Aborting);
            Status::TrxFail
        }
    }

    /// Enters the commit monitor for a local transaction (commit or
    /// in-order rollback of a certified write-set).
    pub fn commit_order_enter_local(&self, trx: &TrxMasterPtr) -> Status {
        let ts = trx.ts().expect("commit ordering without write-set");
        assert!(matches!(
            trx.state(),
            TrxState::Applying | TrxState::Aborting | TrxState::Replaying
        ));

        if trx.state() != TrxState::Applying {
            // rolling back or replaying: the apply monitor may not be held
            // yet
            self.enter_apply_monitor_for_local_not_committing(&ts);
        }

        let next_state = if trx.state() == TrxState::Aborting {
            TrxState::RollingBack
        } else {
            TrxState::Committing
        };
        trx.set_state(next_state);

        if !self.co_mode.uses_monitor() {
            ts.set_state(TrxState::Committing);
            return Status::Ok;
        }
        if matches!(ts.state(), TrxState::Committing | TrxState::Committed) {
            // BF'ed after having entered the commit monitor (streaming
            // fragment); nothing to enter again
            return Status::Ok;
        }

        match self.commit_monitor.enter(&CommitOrder::for_ts(&ts, self.co_mode)) {
            Ok(()) => {
                ts.set_state(TrxState::Committing);
                if !ts.is_commit() && trx.state() == TrxState::MustAbort {
                    return self.handle_commit_interrupt(trx, &ts);
                }
                debug_assert!(matches!(
                    trx.state(),
                    TrxState::Committing | TrxState::RollingBack
                ));
                Status::Ok
            }
            Err(_) => self.handle_commit_interrupt(trx, &ts),
        }
    }

    fn handle_commit_interrupt(&self, trx: &TrxMasterPtr, ts: &TrxSlavePtr) -> Status {
        assert_eq!(trx.state(), TrxState::MustAbort);
        self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
        if ts.is_commit() {
            trx.set_state(TrxState::MustReplay);
            Status::BfAbort
        } else {
            trx.set_state(TrxState::Aborting);
            Status::TrxFail
        }
    }

    fn enter_apply_monitor_for_local_not_committing(&self, ts: &TrxSlavePtr) {
        match ts.state() {
            TrxState::Replicating => {
                ts.set_state(TrxState::Certifying);
                ts.set_state(TrxState::Applying);
                self.apply_monitor
                    .enter(&ApplyOrder::for_ts(ts))
                    .expect("apply monitor entry for rollback interrupted");
            }
            TrxState::Certifying => {
                ts.set_state(TrxState::Applying);
                self.apply_monitor
                    .enter(&ApplyOrder::for_ts(ts))
                    .expect("apply monitor entry for rollback interrupted");
            }
            TrxState::Applying => {}
            other => panic!("unexpected slave state {other} entering commit order"),
        }
    }

    /// Leaves the commit monitor after the engine committed (or an error
    /// occurred, which triggers the group vote).
    pub fn commit_order_leave(&self, trx: &TrxMasterPtr, error: Option<&ApplyError>) -> Status {
        let ts = trx.ts().expect("commit ordering without write-set");
        assert_eq!(ts.state(), TrxState::Committing);

        let mut retval = Status::Ok;
        if let Some(err) = error {
            retval = self.handle_apply_error(&ts, err);
        }

        if self.co_mode.uses_monitor() {
            self.commit_monitor
                .leave(&CommitOrder::for_ts(&ts, self.co_mode));
        }
        ts.set_state(TrxState::Committed);
        if trx.state() == TrxState::Committing {
            trx.set_state(TrxState::Committed);
        }
        retval
    }

    /// Final release after a successful local commit: leaves the apply
    /// monitor and reports the committed position.
    pub fn release_commit(&self, trx: &TrxMasterPtr) -> Status {
        let ts = trx.ts().expect("release without write-set");
        assert!(!ts.flags().is_rollback());
        assert_eq!(ts.state(), TrxState::Committed);

        let safe_to_discard = self.cert.lock().set_committed(ts.global_seqno());
        self.apply_monitor.leave(&ApplyOrder::for_ts(&ts));

        if !ts.is_commit() && trx.state() == TrxState::Committed {
            // streaming: fragment committed, transaction continues
            trx.set_state(TrxState::Executing);
            trx.next_fragment();
        } else {
            trx.reset_ts();
        }

        self.counters.local_commits.fetch_add(1, Ordering::Relaxed);
        self.report_last_committed(safe_to_discard);
        Status::Ok
    }

    /// Final release after a rollback on any local failure path.
    pub fn release_rollback(&self, trx: &TrxMasterPtr) -> Status {
        if trx.state() == TrxState::MustAbort {
            trx.set_state(TrxState::Aborting);
        }

        if let Some(ts) = trx.ts() {
            match ts.state() {
                TrxState::Committing => {
                    // certified rollback ordered through the commit monitor
                    let safe = self.cert.lock().set_committed(ts.global_seqno());
                    if self.co_mode.uses_monitor() {
                        self.commit_monitor
                            .leave(&CommitOrder::for_ts(&ts, self.co_mode));
                    }
                    ts.set_state(TrxState::Committed);
                    self.apply_monitor.leave(&ApplyOrder::for_ts(&ts));
                    self.report_last_committed(safe);
                }
                TrxState::Committed => {
                    // commit ordering already left (in-order rollback of a
                    // streaming fragment); release the apply stage
                    let safe = self.cert.lock().set_committed(ts.global_seqno());
                    self.apply_monitor.leave(&ApplyOrder::for_ts(&ts));
                    self.report_last_committed(safe);
                }
                TrxState::Certifying if !ts.is_queued() => {
                    // cert-failed locally: ordered but never applying; the
                    // global slots must not hold up successors
                    let safe = self.cert.lock().set_committed(ts.global_seqno());
                    self.cancel_global_monitors(ts.global_seqno());
                    self.report_last_committed(safe);
                }
                _ => {}
            }
        }

        match trx.state() {
            TrxState::Aborting | TrxState::Executing => trx.set_state(TrxState::RolledBack),
            TrxState::RollingBack => trx.set_state(TrxState::RolledBack),
            TrxState::RolledBack => {}
            other => {
                warn!(trx = %trx.trx_id(), state = %other, "unexpected state in rollback release");
            }
        }
        trx.reset_ts();
        Status::Ok
    }

    /// BF abort: a higher-priority transaction (`bf_seqno`) preempts a
    /// local victim. Returns the victim's seqno when the claim stands.
    pub fn abort_trx(
        &self,
        victim: &TrxMasterPtr,
        bf_seqno: GlobalSeqno,
    ) -> (Status, Option<GlobalSeqno>) {
        let ts = victim.ts();
        if let Some(ts) = &ts {
            let victim_seqno = ts.global_seqno();
            if !victim_seqno.is_undefined() && victim_seqno < bf_seqno && ts.is_commit() {
                // the victim outranks the aborter
                debug!(bf = %bf_seqno, victim = %victim_seqno, "abort refused: victim ordered first");
                return (Status::NotAllowed, Some(victim_seqno));
            }
        }

        let retval = match victim.state() {
            TrxState::MustAbort | TrxState::Aborting | TrxState::MustReplay => {
                // already on the way out
                Status::NotAllowed
            }
            TrxState::Executing => {
                victim.set_state(TrxState::MustAbort);
                Status::Ok
            }
            TrxState::Replicating => {
                victim.set_state(TrxState::MustAbort);
                if let Some(handle) = victim.gcs_handle() {
                    if let Err(e) = self.gcs.interrupt(handle) {
                        debug!(error = %e, "group interrupt failed");
                    }
                }
                Status::Ok
            }
            TrxState::Certifying => {
                // waiting in the local monitor
                victim.set_state(TrxState::MustAbort);
                let ts = ts.as_ref().expect("certifying trx has write-set");
                self.local_monitor.interrupt(&LocalOrder::for_ts(ts));
                Status::Ok
            }
            TrxState::Applying => {
                victim.set_state(TrxState::MustAbort);
                let ts = ts.as_ref().expect("applying trx has write-set");
                self.apply_monitor.interrupt(&ApplyOrder::for_ts(ts));
                Status::Ok
            }
            TrxState::Committing => {
                let ts = ts.as_ref().expect("committing trx has write-set");
                if self.co_mode.uses_monitor() {
                    let interrupted = self
                        .commit_monitor
                        .interrupt(&CommitOrder::for_ts(ts, self.co_mode));
                    if interrupted || !ts.is_commit() {
                        victim.set_state(TrxState::MustAbort);
                        Status::Ok
                    } else {
                        Status::NotAllowed
                    }
                } else {
                    Status::Ok
                }
            }
            TrxState::Committed => {
                let ts = ts.as_ref().expect("committed trx has write-set");
                if ts.global_seqno() < bf_seqno && ts.is_commit() {
                    Status::NotAllowed
                } else {
                    Status::Ok
                }
            }
            other => {
                warn!(victim = %victim.trx_id(), state = %other, "abort in unexpected state");
                Status::NotAllowed
            }
        };

        let victim_seqno = ts.map(|t| t.global_seqno()).filter(|s| !s.is_undefined());
        (retval, victim_seqno)
    }

    /// Replays a BF-aborted commit-flagged transaction at its original
    /// position.
    pub fn replay_trx(&self, trx: &TrxMasterPtr) -> Status {
        let ts = trx.ts().expect("replay without write-set");
        assert!(ts.global_seqno() > self.last_committed());

        if trx.state() == TrxState::MustAbort {
            // aborted outside the provider
            trx.set_state(TrxState::MustReplay);
        }
        assert_eq!(trx.state(), TrxState::MustReplay);
        debug!(trx = %trx.trx_id(), ws = %ts, "replaying");

        // resume from wherever the abort interrupted the pipeline
        if ts.state() == TrxState::Replicating {
            let retval = self.cert_for(Some(trx), &ts);
            if retval != Status::Ok {
                assert_eq!(retval, Status::TrxFail);
                assert!(ts.is_dummy());
                assert_eq!(trx.state(), TrxState::Aborting);
                debug!(trx = %trx.trx_id(), "replay failed certification");
                return retval;
            }
        }
        if ts.state() == TrxState::Certifying {
            self.apply_monitor
                .enter(&ApplyOrder::for_ts(&ts))
                .expect("replay apply entry interrupted");
            ts.set_state(TrxState::Applying);
        }

        assert!(matches!(
            ts.state(),
            TrxState::Applying | TrxState::Committing
        ));
        self.counters.local_replays.fetch_add(1, Ordering::Relaxed);

        // make sure all preceding transactions are ordered for commit
        // before re-applying
        if self.co_mode.uses_monitor() {
            self.commit_monitor.drain(ts.global_seqno().get() - 1);
        } else {
            self.apply_monitor.drain(ts.global_seqno().get() - 1);
        }
        trx.set_state(TrxState::Replaying);

        assert!(ts.is_commit());
        let event = self.apply_event_for(&ts);
        if let Err(e) = self.callbacks.apply_cb(&event) {
            error!(trx = %trx.trx_id(), "failed to replay own write-set");
            let _ = e;
            self.on_inconsistency();
            return Status::NodeFail;
        }

        let entered_commit = ts.state() == TrxState::Committing;
        if ts.state() == TrxState::Applying {
            ts.set_state(TrxState::Committing);
        } else {
            ts.set_state(TrxState::Replaying);
            ts.set_state(TrxState::Committing);
        }
        if self.co_mode.uses_monitor() && !entered_commit {
            self.commit_monitor
                .enter(&CommitOrder::for_ts(&ts, self.co_mode))
                .expect("replay commit entry interrupted");
        }
        if self.co_mode.uses_monitor() {
            self.commit_monitor
                .leave(&CommitOrder::for_ts(&ts, self.co_mode));
        }
        ts.set_state(TrxState::Committed);

        trx.set_state(TrxState::Committing);
        trx.set_state(TrxState::Committed);
        debug!(seqno = %ts.global_seqno(), "replayed");
        Status::Ok
    }
}

// ============================================================================
// Certification path (under the local monitor)
// ============================================================================

impl Replicator {
    /// Runs one write-set through in-order certification. `trx` is present
    /// for local transactions; only they can be interrupted here.
    fn cert_for(&self, trx: Option<&TrxMasterPtr>, ts: &TrxSlavePtr) -> Status {
        assert_eq!(ts.state(), TrxState::Replicating);
        assert!(!ts.local_seqno().is_undefined());
        assert!(!ts.global_seqno().is_undefined());
        assert!(ts.last_seen() < ts.global_seqno());

        let in_replay = trx.is_some_and(|t| t.state() == TrxState::MustReplay);
        if let Some(t) = trx {
            if !in_replay {
                t.set_state(TrxState::Certifying);
            }
        }

        let lo = LocalOrder::for_ts(ts);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {
                ts.set_state(TrxState::Certifying);
                self.finish_cert(trx, ts)
            }
            Err(_) => {
                let trx = trx.expect("remote write-set interrupted in local monitor");
                self.handle_local_monitor_interrupted(trx, ts)
            }
        }
    }

    /// The victim never made it into the local monitor: park it for
    /// in-order certification (or replay it if it was committing).
    fn handle_local_monitor_interrupted(&self, trx: &TrxMasterPtr, ts: &TrxSlavePtr) -> Status {
        assert_eq!(trx.state(), TrxState::MustAbort);
        assert_eq!(ts.state(), TrxState::Replicating);
        self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);

        if ts.is_commit() {
            // the local monitor slot stays untouched; replay re-enters it
            trx.set_state(TrxState::MustReplay);
            return Status::BfAbort;
        }
        // roll back, but keep the certification index in step with the
        // other nodes through the pending queue
        trx.set_state(TrxState::Aborting);
        self.queue_aborted_for_cert(ts);
        // local monitor must not be touched for this write-set again
        ts.set_state(TrxState::Certifying);
        Status::TrxFail
    }

    /// Certification proper; runs inside the local monitor and leaves it.
    fn finish_cert(&self, trx: Option<&TrxMasterPtr>, ts: &TrxSlavePtr) -> Status {
        assert_eq!(ts.state(), TrxState::Certifying);

        self.process_pending_queue(ts.local_seqno());

        let outcome = self.cert_append(ts);
        let retval = match outcome.verdict {
            Verdict::Ok => {
                ts.set_depends(outcome.depends);
                match trx {
                    Some(t) if t.state() == TrxState::MustAbort => {
                        self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
                        if ts.is_commit() {
                            t.set_state(TrxState::MustReplay);
                        } else {
                            t.set_state(TrxState::Aborting);
                        }
                        Status::BfAbort
                    }
                    _ => Status::Ok,
                }
            }
            Verdict::Failed => {
                ts.mark_dummy();
                if ts.is_local() {
                    self.counters
                        .local_cert_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
                if let Some(t) = trx {
                    t.set_state(TrxState::Aborting);
                }
                Status::TrxFail
            }
        };

        // seqno assignment must stay in delivery order, hence inside the
        // monitor
        if let Some(buf) = ts.buffer() {
            let skip = ts.is_dummy();
            if let Err(e) =
                self.cache
                    .seqno_assign(&buf, ts.global_seqno(), BufKind::WriteSet, skip)
            {
                match e {
                    quartzite_cache::Error::AlreadyAssigned(_) => {}
                    other => warn!(seqno = %ts.global_seqno(), error = %other, "cache assignment failed"),
                }
            }
        }

        self.local_monitor.leave(&LocalOrder::for_ts(ts));
        retval
    }

    fn cert_append(&self, ts: &TrxSlavePtr) -> CertOutcome {
        let keys = ts.keys();
        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        let flags = ts.flags();
        let req = CertRequest {
            global_seqno: ts.global_seqno(),
            last_seen: ts.last_seen(),
            pa_unsafe: flags.is_pa_unsafe(),
            isolation: flags.has(WsFlags::ISOLATION),
            bypass: ts.cert_bypass(),
            keys: &key_refs,
        };
        self.cert.lock().append(&req)
    }

    /// Drains BF-aborted write-sets preceding `before` into the index so
    /// the index evolves identically on every node.
    fn process_pending_queue(&self, before: LocalSeqno) {
        while let Some(qts) = self.pending_cert_queue.pop_next_before(before) {
            debug!(ws = %qts, "certifying parked write-set");
            let outcome = self.cert_append(&qts);
            debug_assert!(
                !qts.cert_bypass() || outcome.verdict == Verdict::Ok,
                "bypass write-set failed certification"
            );
            let skip = outcome.verdict == Verdict::Failed && !qts.cert_bypass();
            if outcome.verdict == Verdict::Ok {
                qts.set_depends(outcome.depends);
            }
            if skip {
                qts.mark_dummy();
            }
            if let Some(buf) = qts.buffer() {
                let _ = self
                    .cache
                    .seqno_assign(&buf, qts.global_seqno(), BufKind::WriteSet, skip);
            }
            self.cert.lock().set_committed(qts.global_seqno());
        }
    }
}

// ============================================================================
// Remote write-set processing
// ============================================================================

impl Replicator {
    /// Processes one totally ordered remote write-set end to end.
    pub(crate) fn process_trx(&self, ts: &TrxSlavePtr) {
        assert!(!ts.local_seqno().is_undefined());
        assert!(!ts.global_seqno().is_undefined());

        // The state transfer path drains monitors when it finishes, so
        // comparing against the apply position reliably detects overlap
        // between the group stream and the transfer stream.
        if ts.global_seqno().get() <= self.apply_monitor.last_left() {
            self.handle_trx_overlapping_ist(ts);
            return;
        }

        match self.cert_for(None, ts) {
            // certification failure still travels the pipeline as a
            // skip, keeping monitors and positions in step
            Status::Ok | Status::TrxFail => self.apply_trx(ts),
            other => {
                error!(ws = %ts, status = %other, "unexpected certification outcome");
                self.on_inconsistency();
            }
        }
    }

    /// Applies a certified write-set under the apply and commit monitors.
    fn apply_trx(&self, ts: &TrxSlavePtr) {
        ts.set_state(TrxState::Applying);
        self.apply_monitor
            .enter(&ApplyOrder::for_ts(ts))
            .expect("remote apply admission interrupted");

        let apply_error = if ts.is_dummy() {
            None
        } else {
            let event = self.apply_event_for(ts);
            self.callbacks.apply_cb(&event).err()
        };

        if self.co_mode.uses_monitor() {
            self.commit_monitor
                .enter(&CommitOrder::for_ts(ts, self.co_mode))
                .expect("remote commit admission interrupted");
        }
        ts.set_state(TrxState::Committing);

        // apply errors are voted on in commit order so every node reaches
        // the same verdict at the same position
        if let Some(err) = &apply_error {
            let _ = self.handle_apply_error(ts, err);
        }

        if self.co_mode.uses_monitor() {
            self.commit_monitor
                .leave(&CommitOrder::for_ts(ts, self.co_mode));
        }
        ts.set_state(TrxState::Committed);

        let safe_to_discard = self.cert.lock().set_committed(ts.global_seqno());
        self.apply_monitor.leave(&ApplyOrder::for_ts(ts));

        // transfer-stream write-sets have no local seqno and must not
        // re-report positions already covered by the snapshot
        if !ts.local_seqno().is_undefined() {
            self.report_last_committed(safe_to_discard);
        }
    }

    fn apply_event_for(&self, ts: &TrxSlavePtr) -> ApplyEvent {
        ApplyEvent {
            gtid: Gtid::new(self.core.lock().group, ts.global_seqno()),
            source: ts.source(),
            trx_id: ts.trx_id(),
            flags: ts.flags(),
            depends: ts.depends(),
            data: ts.data(),
        }
    }

    /// Application failed to apply a write-set: vote on the outcome. If the
    /// group agrees the write-set is bad it becomes a skip everywhere;
    /// otherwise this node is inconsistent.
    fn handle_apply_error(&self, ts: &TrxSlavePtr, err: &ApplyError) -> Status {
        let gtid = Gtid::new(self.core.lock().group, ts.global_seqno());
        error!(gtid = %gtid, "failed to apply write-set");

        let vote = if ts.local_seqno().is_undefined() {
            // transfer-delivered write-set: no vote possible, the snapshot
            // is authoritative
            Err(quartzite_gcs::Error::NotConnected)
        } else {
            self.gcs.vote(gtid, -1, &err.message)
        };

        match vote {
            Ok(0) => {
                info!(gtid = %gtid, "group agreed the write-set is invalid, skipping");
                let _ = self.cache.seqno_skip(ts.global_seqno());
                Status::Ok
            }
            Ok(_) | Err(_) => {
                self.on_inconsistency();
                Status::NodeFail
            }
        }
    }

    /// Reports the locally committed position back to the group.
    fn report_last_committed(&self, safe_to_discard: GlobalSeqno) {
        if safe_to_discard.is_undefined() {
            return;
        }
        let group = self.core.lock().group;
        if let Err(e) = self
            .gcs
            .set_last_applied(Gtid::new(group, safe_to_discard))
        {
            debug!(error = %e, "failed to report last committed");
        }
    }

    /// Group-wide commit cut: purge certification entries and cached
    /// buffers at or below `cut`.
    pub(crate) fn process_commit_cut(&self, cut: GlobalSeqno, seqno_l: LocalSeqno) {
        let lo = LocalOrder(seqno_l);
        self.local_monitor
            .enter(&lo)
            .expect("commit cut interrupted in local monitor");
        self.process_pending_queue(seqno_l);

        let cc_seqno = self.core.lock().cc_seqno;
        if cut >= cc_seqno {
            debug_assert!(cut <= self.last_committed());
            self.cert.lock().purge_upto(cut);
            self.cache.purge_upto(cut);
        }

        self.local_monitor.leave(&lo);
        debug!(cut = %cut, "commit cut");
    }

    /// A write-set received through both the group and the transfer stream:
    /// keep the transfer copy and install keys if certification has not
    /// seen the seqno yet.
    fn handle_trx_overlapping_ist(&self, ts: &TrxSlavePtr) {
        assert!(!ts.is_local());
        debug!(ws = %ts, "write-set overlaps state transfer");

        match self.cache.seqno_buffer(ts.global_seqno()) {
            Ok(cached) => {
                // the transfer stream's copy is the canonical one
                ts.exchange_buffer(cached.buf);
            }
            Err(_) => {
                // not part of the transfer: assign the group copy
                if let Some(buf) = ts.buffer() {
                    let _ = self.cache.seqno_assign(
                        &buf,
                        ts.global_seqno(),
                        BufKind::WriteSet,
                        false,
                    );
                }
            }
        }

        let lo = LocalOrder::for_ts(ts);
        self.local_monitor
            .enter(&lo)
            .expect("overlapping write-set interrupted in local monitor");
        if ts.global_seqno() > self.cert.lock().position() {
            // not covered by index preload: install the keys, no apply
            let outcome = self.cert_append(ts);
            if outcome.verdict == Verdict::Ok {
                ts.set_depends(outcome.depends);
            }
            let safe = self.cert.lock().set_committed(ts.global_seqno());
            self.report_last_committed(safe);
        }
        self.local_monitor.leave(&lo);
    }
}

// ============================================================================
// Configuration changes
// ============================================================================

fn state2node(state: MemberState) -> NodeState {
    match state {
        MemberState::NonPrimary | MemberState::Primary => NodeState::Connected,
        MemberState::Joiner => NodeState::Joining,
        MemberState::Joined => NodeState::Joined,
        MemberState::Synced => NodeState::Synced,
        MemberState::Donor => NodeState::Donor,
    }
}

impl Replicator {
    fn fatal(&self, msg: &str) -> ! {
        error!("{msg}; this is unrecoverable, restart required");
        self.saved_state.mark_corrupt();
        std::process::abort();
    }

    fn submit_view(&self, view: &View) {
        if self.callbacks.view_cb(view) != CbResult::Success {
            self.fatal("view callback failed");
        }
    }

    fn drain_monitors(&self, upto: GlobalSeqno) {
        self.apply_monitor.drain(upto.get());
        if self.co_mode.uses_monitor() {
            self.commit_monitor.drain(upto.get());
        }
    }

    fn drain_monitors_for_local_cc(&self) {
        let upto = self.cert.lock().position();
        if upto.is_undefined() {
            return;
        }
        let committed = self.last_committed();
        if upto >= committed {
            debug!(from = %committed, upto = %upto, "draining monitors");
            self.drain_monitors(upto);
        } else {
            warn!(position = %upto, committed = %committed, "certification position behind commits");
        }
    }

    fn set_initial_position(&self, seqno: i64) {
        let pos = seqno.max(0);
        self.apply_monitor.set_position(pos);
        if self.co_mode.uses_monitor() {
            self.commit_monitor.set_position(pos);
        }
    }

    fn establish_protocol_versions(&self, proto_ver: i32) {
        if proto_ver < 1 || proto_ver > MAX_PROTO_VER || trx_proto_for(proto_ver).is_err() {
            self.fatal(&format!(
                "configuration change advertises unsupported protocol version {proto_ver}"
            ));
        }
        let mut core = self.core.lock();
        if core.protocol_version != proto_ver {
            info!(proto_ver, "replication protocol established");
            core.protocol_version = proto_ver;
        }
    }

    fn record_cc_seqnos(&self, cc_seqno: GlobalSeqno, source: &str) {
        let lowest = self.cert.lock().lowest_live_seqno();
        let mut core = self.core.lock();
        core.cc_seqno = cc_seqno;
        core.cc_lowest_trx_seqno = lowest.unwrap_or(GlobalSeqno::UNDEFINED);
        info!(
            cc_seqno = %cc_seqno,
            lowest = %core.cc_lowest_trx_seqno,
            source,
            "certification index boundary recorded"
        );
    }

    fn update_incoming_list(&self, view: &View) {
        let mut core = self.core.lock();
        core.incoming = view
            .members
            .iter()
            .filter(|m| !m.incoming.is_empty())
            .map(|m| m.incoming.clone())
            .collect();
    }

    /// Currently known client-facing addresses of the cluster.
    pub fn incoming_list(&self) -> Vec<String> {
        self.core.lock().incoming.clone()
    }

    pub(crate) fn process_conf_change(
        &self,
        conf: &ConfChange,
        my_index: Option<usize>,
        buf: BufferRef,
        seqno_l: LocalSeqno,
        seqno_g: GlobalSeqno,
    ) {
        let lo = LocalOrder(seqno_l);
        self.local_monitor
            .enter(&lo)
            .expect("configuration change interrupted in local monitor");
        self.process_pending_queue(seqno_l);

        if conf.is_primary() {
            // a change that consumed a global seqno is processed in order
            let ordered = seqno_g.get() > 0;
            self.process_prim_conf_change(conf, my_index, buf, ordered);
        } else {
            self.process_non_prim_conf_change(conf, my_index);
        }

        let _ = self.gcs.resume_recv();
        self.local_monitor.leave(&lo);

        if conf.is_self_leave() {
            debug!("self-leave received, connection closed");
            self.shift_to_closed();
        }
    }

    fn process_non_prim_conf_change(&self, conf: &ConfChange, my_index: Option<usize>) {
        {
            let core = self.core.lock();
            // outdated view from before the snapshot
            if conf.group == core.group
                && !conf.seqno.is_undefined()
                && conf.seqno < core.sst_seqno
            {
                return;
            }
        }
        let view = conf.to_view(my_index, capabilities(conf.repl_proto_ver));
        debug_assert!(!view.is_primary());

        // monitors may be blocked by failed appliers when corrupt
        if !self.corrupt() {
            self.drain_monitors_for_local_cc();
        }
        self.update_incoming_list(&view);
        self.submit_view(&view);

        if self.state.get() > NodeState::Connected {
            self.state.shift_to(NodeState::Connected);
        }
    }

    fn process_prim_conf_change(
        &self,
        conf: &ConfChange,
        my_index: Option<usize>,
        cc_buf: BufferRef,
        ordered: bool,
    ) {
        let group_uuid = conf.group;
        let group_seqno = conf.seqno;
        debug_assert!(!ordered || group_seqno.get() > 0);

        let Some(my_idx) = my_index else {
            self.fatal("this node is absent from its own primary view");
        };
        assert!(my_idx < conf.members.len());

        {
            let mut core = self.core.lock();
            if core.group != group_uuid {
                // group change invalidates any previous snapshot position
                core.sst_seqno = GlobalSeqno::UNDEFINED;
            }
        }

        // contained in the received snapshot: only keep positions in step
        let sst_seqno = self.core.lock().sst_seqno;
        if ordered && group_seqno <= sst_seqno {
            if group_seqno > self.cert.lock().position() {
                let view = conf.to_view(Some(my_idx), capabilities(conf.repl_proto_ver));
                let trx_ver = trx_proto_for(conf.repl_proto_ver).unwrap_or(-1);
                self.cert.lock().adjust_position(
                    &view,
                    Gtid::new(group_uuid, group_seqno),
                    trx_ver,
                );
                let _ =
                    self.cache
                        .seqno_assign(&cc_buf, group_seqno, BufKind::ConfChange, false);
            }
            info!(seqno = %group_seqno, "skipping view contained in snapshot");
            return;
        }

        info!(
            seqno = %group_seqno,
            members = conf.members.len(),
            ordered,
            "processing primary view"
        );

        if !self.corrupt() {
            self.drain_monitors_for_local_cc();
        }

        let (prev_proto, first_view) = {
            let core = self.core.lock();
            (core.protocol_version, !core.first_view_seen)
        };

        let view = conf.to_view(Some(my_idx), capabilities(conf.repl_proto_ver));
        let group_changed = {
            let core = self.core.lock();
            !first_view && core.group != group_uuid
        };
        if first_view || group_changed {
            if self.callbacks.connected_cb(&view) != CbResult::Success {
                self.fatal("connect callback failed");
            }
            let mut core = self.core.lock();
            core.first_view_seen = true;
            core.group = group_uuid;
        }

        {
            let mut core = self.core.lock();
            core.safe_to_bootstrap = conf.members.len() == 1;
        }
        self.update_incoming_list(&view);

        let my_state = conf.members[my_idx].state;
        let st_required = my_state == MemberState::Joiner;
        let next_state = state2node(my_state);

        self.reset_index_if_needed(&view, prev_proto, conf.repl_proto_ver, st_required);

        if st_required {
            self.run_state_transfer(conf);
            self.become_joined_if_needed();
            self.record_cc_seqnos(group_seqno, "sst");
            return;
        }

        self.establish_protocol_versions(conf.repl_proto_ver);

        if ordered {
            // the view consumes a seqno without passing certification
            assert!(group_seqno > self.cert.lock().position());
            let trx_ver = trx_proto_for(conf.repl_proto_ver).unwrap_or(-1);
            self.cert
                .lock()
                .adjust_position(&view, Gtid::new(group_uuid, group_seqno), trx_ver);
        }

        if first_view {
            let init = group_seqno.get().max(0) - i64::from(ordered);
            self.set_initial_position(init);
            self.cache.reset(Gtid::new(group_uuid, GlobalSeqno::new(init)));
        }
        {
            let core = self.core.lock();
            self.saved_state
                .set(core.group, GlobalSeqno::UNDEFINED, core.safe_to_bootstrap);
        }

        if ordered {
            // views delivered by state transfer already carry assignments
            let _ = self
                .cache
                .seqno_assign(&cc_buf, group_seqno, BufKind::ConfChange, false);
        }

        self.shift_to_next_state(next_state);
        self.submit_view(&view);
        self.become_joined_if_needed();
        self.record_cc_seqnos(group_seqno, "group");

        // cancel after the view has been delivered so last-committed
        // queries from the view callback stay correct
        if ordered {
            self.cancel_global_monitors(group_seqno);
        }
    }

    fn reset_index_if_needed(
        &self,
        view: &View,
        prev_proto: i32,
        next_proto: i32,
        st_required: bool,
    ) {
        // the index resets when crossing or preceding the ordered-CC
        // protocol, on any protocol change, and when a state transfer will
        // rebuild it
        let reset =
            next_proto < PROTO_VER_ORDERED_CC || prev_proto != next_proto || st_required;
        if !reset {
            info!("keeping certification index across view");
            return;
        }

        // everything ordered before this view is void; parked write-sets
        // with it
        self.pending_cert_queue.clear();

        let (position, trx_ver) = if next_proto < PROTO_VER_ORDERED_CC {
            (
                view.state_id,
                trx_proto_for(next_proto).unwrap_or(-1),
            )
        } else {
            // index is rebuilt by transfer preload from an undefined
            // position
            (Gtid::UNDEFINED, -1)
        };
        info!(
            position = %position,
            proto = next_proto,
            st_required,
            "certification index reset"
        );
        self.cert.lock().assign_initial_position(position, trx_ver);
    }

    fn shift_to_next_state(&self, next: NodeState) {
        let current = self.state.get();
        if !matches!(current, NodeState::Connected | NodeState::Donor) {
            return;
        }
        match next {
            NodeState::Joining | NodeState::Joined => self.state.shift_to(next),
            NodeState::Donor => {
                if current == NodeState::Connected {
                    self.state.shift_to(NodeState::Donor);
                }
            }
            NodeState::Synced => {
                self.state.shift_to(NodeState::Synced);
                if self.callbacks.synced_cb() != CbResult::Success {
                    self.fatal("synced callback failed");
                }
            }
            other => debug!(next = %other, "no state shift for view"),
        }
    }

    fn become_joined_if_needed(&self) {
        let (join_gtid, should_join) = {
            let mut core = self.core.lock();
            let should = self.state.get() == NodeState::Joining
                && core.sst_state == SstState::Waiting;
            if should {
                core.sst_state = SstState::JoinSent;
            }
            (Gtid::new(core.group, core.sst_seqno), should)
        };
        if should_join {
            if let Err(e) = self.gcs.join(join_gtid, 0) {
                warn!(error = %e, "failed to join the group after state transfer");
                self.core.lock().sst_state = SstState::Waiting;
            }
        }
    }
}

// ============================================================================
// State transfer (joiner and donor)
// ============================================================================

impl Replicator {
    /// Wire protocol version of the transfer stream for a replication
    /// protocol version.
    fn ist_wire_version(proto_ver: i32) -> u8 {
        proto_ver.clamp(4, 10) as u8
    }

    /// Joiner: full snapshot + incremental catch-up, run inside the
    /// configuration change that demanded it.
    fn run_state_transfer(&self, conf: &ConfChange) {
        let group_seqno = conf.seqno;
        let group_gtid = Gtid::new(conf.group, group_seqno);
        // the position this node can prove it holds: recovered history id
        // plus the locally committed seqno; a node with no history offers
        // nothing and will receive a full snapshot
        let recovered_group = self.saved_state.position().group;
        let local_position = if recovered_group.is_nil() {
            Gtid::UNDEFINED
        } else {
            Gtid::new(recovered_group, self.last_committed())
        };

        info!(
            group = %group_gtid,
            local = %local_position,
            "state transfer required"
        );

        if self.state.get() != NodeState::Connected {
            self.state.shift_to(NodeState::Connected);
        }

        let app_req = self.callbacks.sst_request_cb();
        let trivial = app_req.is_none();
        if trivial
            && (local_position.is_undefined() || local_position.group != group_gtid.group)
        {
            self.fatal("local state is from a different history and no snapshot was requested");
        }

        // open the receive endpoint before asking for the transfer
        let wire_ver = Self::ist_wire_version(conf.repl_proto_ver);
        let first_guess = GlobalSeqno::new(self.last_committed().get().max(0) + 1);
        let recv_addr = match self
            .ist_receiver
            .prepare(first_guess, group_seqno, wire_ver, self.node_id)
        {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "cannot open transfer endpoint, snapshot only");
                String::new()
            }
        };

        let request = StRequest {
            recv_addr,
            position: local_position,
            app_req,
        };

        {
            let mut core = self.core.lock();
            core.sst_state = SstState::Waiting;
            core.sst_result = None;
        }
        // other applier threads spin on the paused stream and pump
        // transfer events meanwhile
        self.gcs.pause_recv();

        if let Err(e) = self
            .gcs
            .request_state_transfer(request.encode(), "", group_gtid)
        {
            error!(error = %e, "state transfer request failed");
            let _ = self.gcs.resume_recv();
            if self.ist_receiver.running() {
                self.ist_receiver.finished();
            }
            self.core.lock().sst_state = SstState::None;
            return;
        }
        self.state.shift_to(NodeState::Joining);

        if trivial {
            // nothing to snapshot: the gap starts right after the local
            // position
            self.sst_received(local_position, 0);
        }

        // wait for the snapshot handoff
        let (state_id, rcode) = {
            let mut core = self.core.lock();
            while core.sst_result.is_none() {
                self.sst_cond.wait(&mut core);
            }
            core.sst_result.take().expect("snapshot result present")
        };
        if rcode < 0 {
            error!(rcode, "snapshot transfer failed, need to restart");
            self.on_inconsistency();
            return;
        }
        info!(position = %state_id, "snapshot installed, receiving write-set gap");

        let final_seqno = if state_id.seqno >= group_seqno {
            // snapshot covers the whole requested range; the incremental
            // stream carries at most a bare EOF
            self.ist_receiver.finished();
            while let Some(event) = self.ist_events.pop() {
                if !matches!(event, IstEvent::Eof(_)) {
                    self.process_ist_event(event);
                }
            }
            state_id.seqno
        } else {
            // pump the incremental stream to completion
            let last = loop {
                match self.ist_events.pop_wait(Duration::from_millis(100)) {
                    Some(IstEvent::Eof(Ok(last))) => break last,
                    Some(IstEvent::Eof(Err(e))) => {
                        if e.is_interrupt() {
                            break self.last_committed();
                        }
                        error!(error = %e, "incremental state transfer failed");
                        self.on_inconsistency();
                        return;
                    }
                    Some(event) => self.process_ist_event(event),
                    None => {}
                }
            };
            self.ist_receiver.finished();
            last
        };

        {
            let mut core = self.core.lock();
            core.sst_seqno = core.sst_seqno.max(final_seqno).max(state_id.seqno);
        }
        self.establish_protocol_versions(conf.repl_proto_ver);
        info!(seqno = %final_seqno, "state transfer complete");
    }

    /// Embedder signal: the state snapshot has been committed locally.
    pub fn sst_received(&self, state_id: Gtid, rcode: i64) -> Status {
        info!(position = %state_id, rcode, "snapshot received");
        if rcode >= 0 {
            {
                let mut core = self.core.lock();
                core.group = state_id.group;
                core.sst_seqno = state_id.seqno;
            }
            self.set_initial_position(state_id.seqno.get());
            self.cache.reset(state_id);
            self.saved_state
                .set(state_id.group, GlobalSeqno::UNDEFINED, false);
            if self.ist_receiver.running() {
                self.ist_receiver
                    .ready(GlobalSeqno::new(state_id.seqno.get().max(0) + 1));
            }
        }
        let mut core = self.core.lock();
        core.sst_result = Some((state_id, rcode));
        self.sst_cond.notify_all();
        Status::Ok
    }

    /// Embedder signal: the donated snapshot left this node.
    pub fn sst_sent(&self, state_id: Gtid, rcode: i64) -> Status {
        info!(position = %state_id, rcode, "snapshot donated");
        if let Err(e) = self.gcs.join(state_id, rcode) {
            warn!(error = %e, "failed to rejoin after donating");
            return Status::NodeFail;
        }
        Status::Ok
    }

    /// Donor: a joiner's state request was routed here.
    pub(crate) fn process_state_req(&self, raw: &Bytes, seqno_l: LocalSeqno, order: GlobalSeqno) {
        let lo = LocalOrder(seqno_l);
        self.local_monitor
            .enter(&lo)
            .expect("state request interrupted in local monitor");

        let result = self.serve_state_req(raw, order);
        if let Err(e) = result {
            warn!(error = %e, "state request failed");
        }
        self.local_monitor.leave(&lo);
    }

    fn serve_state_req(&self, raw: &Bytes, order: GlobalSeqno) -> Result<()> {
        let request = StRequest::decode(raw)?;
        let (group, cc_lowest) = {
            let core = self.core.lock();
            (core.group, core.cc_lowest_trx_seqno)
        };
        let last = if order.get() > 0 {
            order
        } else {
            self.last_committed()
        };

        self.state.try_shift_to(NodeState::Donor);

        let first = GlobalSeqno::new(request.position.seqno.get() + 1);
        let ist_possible = request.position.group == group
            && !request.position.seqno.is_undefined()
            && !request.recv_addr.is_empty()
            && (first > last || self.cache.seqno_buffer(first).is_ok());
        let bypass = ist_possible && request.app_req.is_none();

        info!(
            peer = %request.recv_addr,
            first = %first,
            last = %last,
            bypass,
            "serving state request"
        );

        let donate_req = request.app_req.clone().unwrap_or_default();
        let gtid = Gtid::new(group, last);
        if self.callbacks.sst_donate_cb(&donate_req, gtid, bypass) != CbResult::Success {
            warn!("snapshot donation rejected by application");
            let _ = self.gcs.join(gtid, -1);
            return Ok(());
        }
        if bypass {
            self.core.lock().bypass_peers.insert(request.recv_addr.clone());
        }

        if !request.recv_addr.is_empty() {
            let wire_ver = Self::ist_wire_version(self.core.lock().protocol_version);
            let spawned = if ist_possible && first <= last {
                // preload reaches back to the oldest live certification
                // entry so the joiner can rebuild its index
                let (send_first, preload_start) =
                    if !cc_lowest.is_undefined() && cc_lowest < first {
                        (cc_lowest, cc_lowest)
                    } else {
                        (first, GlobalSeqno::UNDEFINED)
                    };
                self.ist_senders
                    .run(&request.recv_addr, send_first, last, preload_start, wire_ver)
            } else {
                // nothing to replay (joiner caught up, or the snapshot
                // covers the whole history): connect and send a bare EOF
                self.ist_senders.run(
                    &request.recv_addr,
                    GlobalSeqno::new(last.get() + 1),
                    last,
                    GlobalSeqno::UNDEFINED,
                    wire_ver,
                )
            };
            if let Err(e) = spawned {
                self.core.lock().bypass_peers.remove(&request.recv_addr);
                let _ = self.gcs.join(gtid, -1);
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// A background transfer sender finished serving `peer`.
    fn ist_send_done(&self, peer: &str, seqno: GlobalSeqno) {
        let was_bypass = self.core.lock().bypass_peers.remove(peer);
        if !was_bypass {
            return;
        }
        if seqno.is_undefined() {
            warn!(peer, "incremental donation failed");
        }
        let gtid = Gtid::new(self.core.lock().group, self.last_committed());
        if let Err(e) = self.gcs.join(gtid, if seqno.is_undefined() { -1 } else { 0 }) {
            warn!(error = %e, "failed to rejoin after incremental donation");
        }
    }

    /// Drains any transfer events that arrived while the group stream is
    /// paused.
    fn process_available_ist_events(&self) {
        while let Some(event) = self.ist_events.pop() {
            self.process_ist_event(event);
        }
    }

    fn process_ist_event(&self, event: IstEvent) {
        match event {
            IstEvent::WriteSet {
                ts,
                must_apply,
                preload,
            } => self.process_ist_writeset(&ts, must_apply, preload),
            IstEvent::ConfChange {
                seqno,
                conf,
                must_apply,
            } => self.process_ist_conf_change(seqno, &conf, must_apply),
            IstEvent::Eof(result) => {
                // stream ended while nobody was pumping synchronously
                let mut core = self.core.lock();
                if let Ok(last) = result {
                    core.sst_seqno = core.sst_seqno.max(last);
                }
                self.sst_cond.notify_all();
            }
        }
    }

    /// One transferred write-set: always certifies (index preload),
    /// applies only within the requested gap.
    fn process_ist_writeset(&self, ts: &TrxSlavePtr, must_apply: bool, preload: bool) {
        let _ = preload;
        ts.set_state(TrxState::Certifying);
        let outcome = self.cert_append(ts);
        match outcome.verdict {
            Verdict::Ok => ts.set_depends(outcome.depends),
            Verdict::Failed => ts.mark_dummy(),
        }

        if must_apply {
            self.apply_trx(ts);
        } else {
            self.cert.lock().set_committed(ts.global_seqno());
        }
    }

    /// A configuration change replayed by the transfer stream (ordered-CC
    /// protocols deliver them in-stream).
    fn process_ist_conf_change(&self, seqno: GlobalSeqno, conf: &ConfChange, must_apply: bool) {
        self.establish_protocol_versions(conf.repl_proto_ver);
        let my_index = conf
            .members
            .iter()
            .position(|m| m.id == self.node_id);
        let view = conf.to_view(my_index, capabilities(conf.repl_proto_ver));
        let trx_ver = trx_proto_for(conf.repl_proto_ver).unwrap_or(-1);
        self.cert
            .lock()
            .adjust_position(&view, Gtid::new(conf.group, seqno), trx_ver);

        if must_apply {
            {
                let mut core = self.core.lock();
                core.group = conf.group;
            }
            self.submit_view(&view);
            self.record_cc_seqnos(seqno, "ist");
            self.cancel_global_monitors(seqno);
        }
    }
}

// ============================================================================
// Service operations
// ============================================================================

impl Replicator {
    /// Processes join status delivered by the group.
    pub(crate) fn process_join(&self, code: i64, seqno_l: LocalSeqno) {
        let lo = LocalOrder(seqno_l);
        self.local_monitor
            .enter(&lo)
            .expect("join interrupted in local monitor");
        let upto = self.cert.lock().position();
        self.drain_monitors(upto);

        if code < 0 && self.state.get() == NodeState::Joining {
            error!(code, "failed to receive state transfer, need to restart");
            self.local_monitor.leave(&lo);
            self.on_inconsistency();
            return;
        }
        self.state.try_shift_to(NodeState::Joined);
        self.core.lock().sst_state = SstState::None;
        self.local_monitor.leave(&lo);
    }

    /// The group reports this node caught up.
    pub(crate) fn process_sync(&self, seqno_l: LocalSeqno) {
        let lo = LocalOrder(seqno_l);
        self.local_monitor
            .enter(&lo)
            .expect("sync interrupted in local monitor");
        let upto = self.cert.lock().position();
        self.drain_monitors(upto);

        if self.state.get() == NodeState::Joined {
            self.state.shift_to(NodeState::Synced);
            if self.callbacks.synced_cb() != CbResult::Success {
                self.fatal("synced callback failed");
            }
        } else {
            debug!(state = %self.state.get(), "sync in non-joined state ignored");
        }
        self.local_monitor.leave(&lo);
    }

    /// Consensus voting on action outcomes.
    pub(crate) fn process_vote(&self, gtid: Gtid, code: i64, seqno_l: LocalSeqno) {
        let lo = LocalOrder(seqno_l);
        self.local_monitor
            .enter(&lo)
            .expect("vote interrupted in local monitor");

        if code > 0 {
            // vote request: make sure the write-set outcome is settled here
            info!(gtid = %gtid, "vote requested");
            if self.last_committed() < gtid.seqno {
                self.drain_monitors(gtid.seqno);
            }
            if !self.corrupt() {
                match self.gcs.vote(gtid, 0, &[]) {
                    Ok(0) => debug!(gtid = %gtid, "success vote consistent with group"),
                    Ok(_) => {
                        error!(gtid = %gtid, "success vote inconsistent with group, leaving");
                        self.on_inconsistency();
                    }
                    Err(e) => {
                        error!(gtid = %gtid, error = %e, "vote failed, assuming inconsistency");
                        self.on_inconsistency();
                    }
                }
            }
        } else if code < 0 {
            error!(gtid = %gtid, "group voted down a write-set this node applied");
            self.on_inconsistency();
        }
        self.local_monitor.leave(&lo);
    }

    /// Causal read barrier: waits until everything ordered before `upto`
    /// (or before "now" if unset) has committed locally.
    pub fn sync_wait(
        &self,
        upto: Option<Gtid>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Gtid, Status> {
        let wait = timeout.unwrap_or_else(|| {
            self.params
                .lock()
                .get_duration(keys::CAUSAL_READ_TIMEOUT)
                .unwrap_or(self.resolved.causal_read_timeout)
        });
        let deadline = Instant::now() + wait;

        let target = match upto {
            Some(gtid) if !gtid.seqno.is_undefined() => gtid,
            _ => self.gcs.caused(deadline).map_err(|e| {
                debug!(error = %e, "causal position unavailable");
                Status::ConnFail
            })?,
        };

        let monitor = if self.co_mode.uses_monitor() {
            &self.commit_monitor
        } else {
            &self.apply_monitor
        };
        monitor
            .drain_until(target.seqno.get(), deadline)
            .map_err(|_| Status::ConnFail)?;
        Ok(self.last_committed_id())
    }

    /// Fences all ordered processing; returns the paused position.
    pub fn pause(&self) -> std::result::Result<GlobalSeqno, Status> {
        {
            let core = self.core.lock();
            if core.pause_at.is_some() {
                return Err(Status::Warning);
            }
        }
        let seqno_l = self.gcs.local_sequence();
        self.local_monitor
            .enter(&LocalOrder(seqno_l))
            .map_err(|_| Status::ConnFail)?;
        self.core.lock().pause_at = Some(seqno_l);
        info!(seqno_l = %seqno_l, "replication paused");
        Ok(self.last_committed())
    }

    pub fn resume(&self) -> Status {
        let Some(seqno_l) = self.core.lock().pause_at.take() else {
            warn!("resume without pause");
            return Status::Warning;
        };
        self.local_monitor.leave(&LocalOrder(seqno_l));
        info!("replication resumed");
        Status::Ok
    }

    /// Voluntarily leaves the synced group state (e.g. before a blocking
    /// admin operation).
    pub fn desync(&self) -> Status {
        match self.gcs.desync() {
            Ok(_) => {
                if self.state.get() == NodeState::Synced {
                    self.state.shift_to(NodeState::Donor);
                }
                Status::Ok
            }
            Err(quartzite_gcs::Error::NotImplemented) => Status::Ok,
            Err(e) => {
                warn!(error = %e, "desync failed");
                Status::NodeFail
            }
        }
    }

    pub fn resync(&self) -> Status {
        if let Err(e) = self.gcs.join(self.last_committed_id(), 0) {
            warn!(error = %e, "resync failed");
            return Status::NodeFail;
        }
        self.state.try_shift_to(NodeState::Joined);
        Status::Ok
    }

    /// Provider hook for externally ordered write-set collection; not
    /// wired in this build.
    pub fn preordered_collect(&self, _data: &[u8]) -> Status {
        Status::NotImplemented
    }

    /// Provider hook for committing externally ordered write-sets; not
    /// wired in this build.
    pub fn preordered_commit(&self, _source: NodeId, _flags: WsFlags, _commit: bool) -> Status {
        Status::NotImplemented
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn incoming_addr(&self) -> &str {
        &self.incoming_addr
    }

    /// Access to the group backend (test orchestration).
    pub fn gcs(&self) -> &Gcs {
        &self.gcs
    }

    /// Number of parked write-sets awaiting in-order certification.
    pub fn pending_cert_len(&self) -> usize {
        self.pending_cert_queue.len()
    }

    /// Current certification position.
    pub fn cert_position(&self) -> GlobalSeqno {
        self.cert.lock().position()
    }
}
