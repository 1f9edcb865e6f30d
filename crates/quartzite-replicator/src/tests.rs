//! End-to-end scenario tests for the replication core.
//!
//! Single-node scenarios run over the dummy group backend; multi-node
//! scenarios (ordering agreement, joiner catch-up) run over the in-process
//! hub with one applier thread per node.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use quartzite_cache::WriteSetCache;
use quartzite_config::ParamStore;
use quartzite_gcs::{ConfChange, ConfMember, DummyGcs, Gcs, GcsHub};
use quartzite_types::{GlobalSeqno, Gtid, MemberState, TrxId, View, WsFlags};

use crate::callbacks::{ApplicationCallbacks, ApplyError, ApplyEvent, CbResult};
use crate::error::Status;
use crate::params;
use crate::replicator::Replicator;
use crate::state_machine::NodeState;
use crate::trx::TrxState;
use crate::writeset::WsKey;

// ============================================================================
// Test application
// ============================================================================

#[derive(Default)]
struct TestApp {
    applied: Mutex<Vec<i64>>,
    views: Mutex<Vec<View>>,
    synced: AtomicUsize,
    /// What `sst_request_cb` returns; `None` requests no snapshot.
    sst_request: Mutex<Option<Bytes>>,
    donations: Mutex<Vec<(Gtid, bool)>>,
    /// Fail applying this seqno once.
    fail_apply_at: Mutex<Option<i64>>,
}

impl TestApp {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn applied(&self) -> Vec<i64> {
        self.applied.lock().clone()
    }
}

impl ApplicationCallbacks for TestApp {
    fn view_cb(&self, view: &View) -> CbResult {
        self.views.lock().push(view.clone());
        CbResult::Success
    }

    fn sst_request_cb(&self) -> Option<Bytes> {
        self.sst_request.lock().clone()
    }

    fn apply_cb(&self, event: &ApplyEvent) -> Result<(), ApplyError> {
        let seqno = event.gtid.seqno.get();
        if self.fail_apply_at.lock().take_if(|s| *s == seqno).is_some() {
            return Err(ApplyError {
                message: Bytes::from_static(b"injected apply failure"),
            });
        }
        self.applied.lock().push(seqno);
        Ok(())
    }

    fn sst_donate_cb(&self, _request: &Bytes, gtid: Gtid, bypass: bool) -> CbResult {
        self.donations.lock().push((gtid, bypass));
        CbResult::Success
    }

    fn synced_cb(&self) -> CbResult {
        self.synced.fetch_add(1, Ordering::SeqCst);
        CbResult::Success
    }
}

// ============================================================================
// Harness helpers
// ============================================================================

fn base_params(dir: &std::path::Path) -> ParamStore {
    let mut store = ParamStore::new();
    params::register(&mut store);
    store
        .set(params::keys::BASE_DIR, dir.to_str().unwrap())
        .unwrap();
    store.set(params::keys::BASE_HOST, "127.0.0.1").unwrap();
    store
        .set(params::keys::IST_RECV_ADDR, "tcp://127.0.0.1:0")
        .unwrap();
    store
}

/// A single node over the dummy backend, connected and synced.
fn single_node(dir: &std::path::Path) -> (Arc<Replicator>, Arc<TestApp>) {
    let app = TestApp::new();
    let repl = Replicator::new(
        base_params(dir),
        app.clone(),
        "node-1",
        "127.0.0.1:3306",
        |cache| Gcs::Dummy(DummyGcs::new(cache.clone(), 9, 1, "node-1", "127.0.0.1:3306")),
    )
    .unwrap();

    assert_eq!(repl.connect("test-cluster", "dummy://", true), Status::Ok);
    repl.process_one().unwrap(); // primary view
    repl.process_one().unwrap(); // sync
    assert_eq!(repl.node_state(), NodeState::Synced);
    assert_eq!(app.synced.load(Ordering::SeqCst), 1);
    (repl, app)
}

/// Drives one local transaction through the whole master-side pipeline.
fn commit_trx(repl: &Arc<Replicator>, id: u64, key: &[u8]) -> GlobalSeqno {
    let trx = repl.get_local_trx(TrxId::new(id), true).unwrap();
    trx.append_key(WsKey::new(key.to_vec()));
    trx.append_data(b"row data");
    trx.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));

    assert_eq!(repl.replicate(&trx), Status::Ok);
    assert_eq!(repl.certify(&trx), Status::Ok);
    let seqno = trx.ts().unwrap().global_seqno();
    assert_eq!(repl.commit_order_enter_local(&trx), Status::Ok);
    assert_eq!(repl.commit_order_leave(&trx, None), Status::Ok);
    assert_eq!(repl.release_commit(&trx), Status::Ok);
    repl.discard_local_trx(TrxId::new(id));
    seqno
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Single-node scenarios
// ============================================================================

/// A fresh node replicates one write-set: certification seeds from the
/// undefined position, monitors advance to 1, last-committed is reported.
#[test]
fn single_node_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let (repl, app) = single_node(dir.path());

    assert_eq!(repl.cert_position(), GlobalSeqno::UNDEFINED);

    let trx = repl.get_local_trx(TrxId::new(1), true).unwrap();
    trx.append_key(WsKey::new(&b"K1"[..]));
    trx.append_data(&[0u8; 128]);
    trx.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));

    assert_eq!(repl.replicate(&trx), Status::Ok);
    let ts = trx.ts().unwrap();
    assert_eq!(ts.global_seqno(), GlobalSeqno::new(1));

    assert_eq!(repl.certify(&trx), Status::Ok);
    assert_eq!(repl.cert_position(), GlobalSeqno::new(1));
    assert_eq!(ts.depends(), GlobalSeqno::UNDEFINED);

    assert_eq!(repl.commit_order_enter_local(&trx), Status::Ok);
    assert_eq!(repl.commit_order_leave(&trx, None), Status::Ok);
    assert_eq!(repl.release_commit(&trx), Status::Ok);

    assert_eq!(repl.last_committed(), GlobalSeqno::new(1));
    assert_eq!(trx.state(), TrxState::Committed);

    // the coalesced last-committed report comes back as a commit cut
    repl.process_one().unwrap();
    let stats = repl.stats();
    assert_eq!(stats.replicated, 1);
    assert_eq!(stats.local_commits, 1);
    assert_eq!(stats.last_committed, 1);

    // local transactions apply through the engine, not the callback
    assert!(app.applied().is_empty());
}

/// A commit-flagged transaction preempted after certification replays at
/// its original seqno and commits in order.
#[test]
fn bf_abort_of_committing_fragment_replays() {
    let dir = tempfile::tempdir().unwrap();
    let (repl, app) = single_node(dir.path());

    commit_trx(&repl, 1, b"base");

    let trx = repl.get_local_trx(TrxId::new(2), true).unwrap();
    trx.append_key(WsKey::new(&b"K1"[..]));
    trx.append_data(b"victim");
    trx.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));

    assert_eq!(repl.replicate(&trx), Status::Ok);
    assert_eq!(repl.certify(&trx), Status::Ok);
    let seqno = trx.ts().unwrap().global_seqno();
    assert_eq!(seqno, GlobalSeqno::new(2));

    // a remote transaction ordered earlier claims the victim
    let (status, victim_seqno) = repl.abort_trx(&trx, GlobalSeqno::new(1));
    assert_eq!(status, Status::Ok);
    assert_eq!(victim_seqno, Some(seqno));
    assert_eq!(trx.state(), TrxState::MustAbort);

    assert_eq!(repl.replay_trx(&trx), Status::Ok);
    assert_eq!(trx.state(), TrxState::Committed);
    assert_eq!(repl.release_commit(&trx), Status::Ok);

    assert_eq!(repl.last_committed(), seqno);
    // replay goes through the apply callback at the original position
    assert_eq!(app.applied(), vec![seqno.get()]);
    assert_eq!(repl.stats().local_replays, 1);
}

/// The aborter loses when the victim holds a smaller seqno with a commit
/// flag.
#[test]
fn bf_abort_rejected_for_outranking_victim() {
    let dir = tempfile::tempdir().unwrap();
    let (repl, _app) = single_node(dir.path());

    let trx = repl.get_local_trx(TrxId::new(1), true).unwrap();
    trx.append_key(WsKey::new(&b"K1"[..]));
    trx.append_data(b"data");
    trx.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));
    assert_eq!(repl.replicate(&trx), Status::Ok);
    assert_eq!(repl.certify(&trx), Status::Ok);
    let seqno = trx.ts().unwrap().global_seqno();

    // aborter was ordered later: claim refused
    let (status, victim_seqno) = repl.abort_trx(&trx, seqno.next());
    assert_eq!(status, Status::NotAllowed);
    assert_eq!(victim_seqno, Some(seqno));
    assert_eq!(trx.state(), TrxState::Applying);

    assert_eq!(repl.commit_order_enter_local(&trx), Status::Ok);
    assert_eq!(repl.commit_order_leave(&trx, None), Status::Ok);
    assert_eq!(repl.release_commit(&trx), Status::Ok);
}

/// Certification failure: conflicting writer outside the snapshot. The
/// transaction rolls back; the pipeline positions still advance.
#[test]
fn certification_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let (repl, _app) = single_node(dir.path());

    // both ordered before either commits, so both carry last_seen = 0
    let t1 = repl.get_local_trx(TrxId::new(1), true).unwrap();
    t1.append_key(WsKey::new(&b"K1"[..]));
    t1.append_data(b"first");
    t1.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));
    assert_eq!(repl.replicate(&t1), Status::Ok);

    let t2 = repl.get_local_trx(TrxId::new(2), true).unwrap();
    t2.append_key(WsKey::new(&b"K1"[..]));
    t2.append_data(b"second");
    t2.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));
    assert_eq!(repl.replicate(&t2), Status::Ok);

    // first writer commits
    assert_eq!(repl.certify(&t1), Status::Ok);
    assert_eq!(repl.commit_order_enter_local(&t1), Status::Ok);
    assert_eq!(repl.commit_order_leave(&t1, None), Status::Ok);
    assert_eq!(repl.release_commit(&t1), Status::Ok);

    // second writer could not have seen it
    assert_eq!(repl.certify(&t2), Status::TrxFail);
    assert_eq!(t2.state(), TrxState::Aborting);
    let ts2 = t2.ts().unwrap();
    assert!(ts2.is_dummy());
    assert_eq!(ts2.depends(), GlobalSeqno::UNDEFINED);

    assert_eq!(repl.release_rollback(&t2), Status::Ok);
    assert_eq!(t2.state(), TrxState::RolledBack);

    // the failed seqno still consumed its slots
    assert_eq!(repl.cert_position(), GlobalSeqno::new(2));
    assert_eq!(repl.last_committed(), GlobalSeqno::new(2));
    assert_eq!(repl.stats().local_cert_failures, 1);
}

/// Protocol upgrade through an ordered view: pending certification state
/// is dropped and the index restarts from the view's position.
#[test]
fn protocol_upgrade_resets_certification_index() {
    let dir = tempfile::tempdir().unwrap();
    let (repl, _app) = single_node(dir.path());

    commit_trx(&repl, 1, b"K1");
    assert_eq!(repl.cert_position(), GlobalSeqno::new(1));

    // group agrees on a new configuration advertising wire version 10
    let upgraded = ConfChange {
        conf_id: 2,
        seqno: GlobalSeqno::new(2),
        group: repl.last_committed_id().group,
        members: vec![ConfMember {
            id: repl.node_id(),
            name: "node-1".to_string(),
            incoming: "127.0.0.1:3306".to_string(),
            state: MemberState::Joined,
        }],
        repl_proto_ver: 10,
        appl_proto_ver: 1,
    };
    repl.gcs()
        .as_dummy()
        .unwrap()
        .inject_conf_change(upgraded, Some(0));
    repl.process_one().unwrap();

    assert_eq!(repl.pending_cert_len(), 0);
    assert_eq!(repl.cert_position(), GlobalSeqno::new(2));
    assert_eq!(repl.last_committed(), GlobalSeqno::new(2));

    // certification continues from the view's position; the pre-upgrade
    // write to K1 is gone from the rebuilt index, so this does not
    // conflict
    let t2 = repl.get_local_trx(TrxId::new(2), true).unwrap();
    t2.append_key(WsKey::new(&b"K1"[..]));
    t2.append_data(b"post-upgrade");
    t2.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));
    assert_eq!(repl.replicate(&t2), Status::Ok);

    // ordered before t2 commits: will see a post-upgrade conflict
    let t3 = repl.get_local_trx(TrxId::new(3), true).unwrap();
    t3.append_key(WsKey::new(&b"K1"[..]));
    t3.append_data(b"loser");
    t3.set_flags(WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT));
    assert_eq!(repl.replicate(&t3), Status::Ok);

    assert_eq!(repl.certify(&t2), Status::Ok);
    assert_eq!(t2.ts().unwrap().global_seqno(), GlobalSeqno::new(3));
    assert_eq!(repl.commit_order_enter_local(&t2), Status::Ok);
    assert_eq!(repl.commit_order_leave(&t2, None), Status::Ok);
    assert_eq!(repl.release_commit(&t2), Status::Ok);
    assert_eq!(repl.cert_position(), GlobalSeqno::new(3));

    // the new index is live again: t3 conflicts with the post-upgrade
    // writer
    assert_eq!(repl.certify(&t3), Status::TrxFail);
    repl.release_rollback(&t3);
}

/// `sync_wait` returns once the commit monitor has drained to the causal
/// position; `pause` fences ordered processing until `resume`.
#[test]
fn causal_wait_and_pause() {
    let dir = tempfile::tempdir().unwrap();
    let (repl, _app) = single_node(dir.path());

    let seqno = commit_trx(&repl, 1, b"K1");
    let gtid = repl.sync_wait(None, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(gtid.seqno, seqno);

    let paused_at = repl.pause().unwrap();
    assert_eq!(paused_at, seqno);
    // double pause is refused
    assert!(repl.pause().is_err());
    assert_eq!(repl.resume(), Status::Ok);
    assert_eq!(repl.resume(), Status::Warning);

    // processing continues after resume
    commit_trx(&repl, 2, b"K2");
    assert_eq!(repl.last_committed(), GlobalSeqno::new(2));
}

/// An orderly close persists the final position for the next start.
#[test]
fn restart_recovers_position() {
    let dir = tempfile::tempdir().unwrap();
    let group;
    {
        let (repl, _app) = single_node(dir.path());
        commit_trx(&repl, 1, b"K1");
        commit_trx(&repl, 2, b"K2");
        group = repl.last_committed_id().group;

        assert_eq!(repl.close(), Status::Ok);
        // drain until the self-leave shifts the node to CLOSED
        while repl.node_state() != NodeState::Closed {
            repl.process_one().unwrap();
        }
    }

    let saved = crate::state_file::SavedState::open(dir.path()).unwrap();
    assert_eq!(saved.position(), Gtid::new(group, GlobalSeqno::new(2)));

    let app = TestApp::new();
    let repl = Replicator::new(
        base_params(dir.path()),
        app,
        "node-1",
        "127.0.0.1:3306",
        |cache| Gcs::Dummy(DummyGcs::new(cache.clone(), 9, 1, "node-1", "127.0.0.1:3306")),
    )
    .unwrap();
    assert_eq!(repl.last_committed(), GlobalSeqno::new(2));
}

// ============================================================================
// Multi-node scenarios (hub backend)
// ============================================================================

struct HubNode {
    repl: Arc<Replicator>,
    app: Arc<TestApp>,
    applier: Option<thread::JoinHandle<Status>>,
}

impl HubNode {
    fn start(
        hub: &Arc<GcsHub>,
        name: &'static str,
        dir: &std::path::Path,
        sst_request: Option<Bytes>,
        bootstrap: bool,
    ) -> Self {
        let app = TestApp::new();
        *app.sst_request.lock() = sst_request;
        let hub = Arc::clone(hub);
        let repl = Replicator::new(
            base_params(dir),
            app.clone(),
            name,
            "127.0.0.1:3306",
            move |cache: &WriteSetCache| {
                Gcs::Hub(hub.endpoint(name, "127.0.0.1:3306", cache.clone()))
            },
        )
        .unwrap();

        assert_eq!(repl.connect("test-cluster", "hub://", bootstrap), Status::Ok);
        let applier = {
            let repl = Arc::clone(&repl);
            thread::spawn(move || repl.async_recv())
        };
        Self {
            repl,
            app,
            applier: Some(applier),
        }
    }

    /// Fresh member: joins through a full snapshot served by the test.
    fn join_with_snapshot(hub: &Arc<GcsHub>, name: &'static str, dir: &std::path::Path, donor: &HubNode) -> Self {
        let donations_before = donor.app.donations.lock().len();
        let node = Self::start(hub, name, dir, Some(Bytes::from_static(b"snapshot request")), false);
        wait_until("joiner requested transfer", || {
            node.repl.node_state() == NodeState::Joining
        });
        wait_until("donor invoked", || {
            donor.app.donations.lock().len() > donations_before
        });
        // simulate the snapshot glue: copy the donor state at the donation
        // position
        let (snapshot, bypass) = *donor.app.donations.lock().last().unwrap();
        assert!(!bypass);
        assert_eq!(node.repl.sst_received(snapshot, 0), Status::Ok);
        wait_until("joiner synced", || node.repl.node_state() == NodeState::Synced);
        // donor glue reports the donation done
        assert_eq!(donor.repl.sst_sent(snapshot, 0), Status::Ok);
        wait_until("donor resynced", || {
            donor.repl.node_state() == NodeState::Synced
        });
        node
    }

    fn stop(&mut self) {
        self.repl.close();
        if let Some(handle) = self.applier.take() {
            handle.join().unwrap();
        }
    }
}

/// Write-sets from two masters commit in the same global order on both
/// nodes; a freshly started member joins through a full snapshot, and a
/// restarted member closes its gap through incremental write-set replay.
#[test]
fn two_nodes_agree_and_restarted_member_catches_up() {
    let hub = GcsHub::new(10, 1);
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut a = HubNode::start(&hub, "node-a", dir_a.path(), None, true);
    wait_until("node a synced", || a.repl.node_state() == NodeState::Synced);

    // retain history so later joiners can be served incrementally
    let _pin = a.repl.cache().seqno_lock(GlobalSeqno::new(1));

    // some history before anyone joins
    for i in 0..12u64 {
        let key = format!("k{}", i % 3);
        commit_trx(&a.repl, i + 1, key.as_bytes());
    }

    // fresh member: full snapshot, no write-set replay
    let mut b = HubNode::join_with_snapshot(&hub, "node-b", dir_b.path(), &a);
    assert!(b.app.applied().is_empty());
    assert_eq!(a.repl.last_committed(), b.repl.last_committed());

    // traffic from both masters
    let ga = commit_trx(&a.repl, 100, b"k0");
    wait_until("b applied a's write-set", || b.repl.last_committed() >= ga);
    let gb = commit_trx(&b.repl, 200, b"k1");
    wait_until("a applied b's write-set", || a.repl.last_committed() >= gb);
    assert_eq!(b.app.applied(), vec![ga.get()]);

    // b leaves with its state on disk
    b.stop();
    wait_until("a observed the leave", || {
        a.repl.last_committed() > gb
    });

    // the group moves on while b is down
    let mut gap = Vec::new();
    for i in 0..3u64 {
        gap.push(commit_trx(&a.repl, 300 + i, b"k2").get());
    }

    // b restarts with its recovered position and catches up without a
    // snapshot (write-set replay only)
    let mut b2 = HubNode::start(&hub, "node-b", dir_b.path(), None, false);
    wait_until("restarted member synced", || {
        b2.repl.node_state() == NodeState::Synced
    });
    let (_, bypass) = *a.app.donations.lock().last().unwrap();
    assert!(bypass, "restart catch-up must not require a snapshot");
    wait_until("donor resynced after replay", || {
        a.repl.node_state() == NodeState::Synced
    });

    // exactly the gap was applied, in order
    assert_eq!(b2.app.applied(), gap);
    assert_eq!(a.repl.last_committed(), b2.repl.last_committed());
    assert_eq!(a.repl.cert_position(), b2.repl.cert_position());

    // both keep certifying in lockstep
    let g = commit_trx(&a.repl, 400, b"k0");
    wait_until("replayed member applies new traffic", || {
        b2.repl.last_committed() >= g
    });
    assert_eq!(a.repl.cert_position(), b2.repl.cert_position());

    // remote commit order is the global order
    let applied = b2.app.applied();
    let mut sorted = applied.clone();
    sorted.sort_unstable();
    assert_eq!(applied, sorted);

    b2.stop();
    a.stop();
}

/// A failed apply is voted on; when the group disagrees with this node it
/// marks itself corrupt and leaves.
#[test]
fn apply_failure_vote_marks_corrupt() {
    let hub = GcsHub::new(10, 1);
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut a = HubNode::start(&hub, "node-a", dir_a.path(), None, true);
    wait_until("node a synced", || a.repl.node_state() == NodeState::Synced);

    let mut b = HubNode::join_with_snapshot(&hub, "node-b", dir_b.path(), &a);

    // b fails to apply the next write-set; the rest of the group applies
    // it fine, so b loses the vote
    let next = a.repl.last_committed().get() + 1;
    *b.app.fail_apply_at.lock() = Some(next);

    commit_trx(&a.repl, 1, b"k");
    wait_until("b marked corrupt", || b.repl.corrupt());

    b.stop();
    a.stop();
}
