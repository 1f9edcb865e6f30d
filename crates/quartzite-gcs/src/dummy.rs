//! In-process single-member group communication backend.
//!
//! Assigns monotonic local and global seqnos, signals a single-member
//! primary view on connect, and turns last-applied reports into commit-cut
//! actions. Used by tests and by embedders running a standalone node.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use quartzite_cache::WriteSetCache;
use quartzite_types::{GlobalSeqno, GroupId, Gtid, LocalSeqno, MemberState, NodeId};

use crate::action::{Action, ConfChange, ConfMember, Payload};
use crate::error::{Error, Result};
use crate::{Replicated, ScheduleHandle, MAX_ACTION_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Open,
    Connected,
    Synced,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: State,
    global: i64,
    local: i64,
    group: GroupId,
    node: NodeId,
    conf_id: i64,
    repl_proto_ver: i32,
    appl_proto_ver: i32,
    /// Deliveries waiting for `recv`; conf changes, join, sync.
    queue: VecDeque<QueuedDelivery>,
    /// Coalesced last-applied reporting (one pending commit cut at a time).
    last_applied: i64,
    report_last_applied: bool,
    paused: bool,
    next_handle: i64,
    interrupted: HashSet<i64>,
}

#[derive(Debug)]
enum QueuedDelivery {
    ConfChange {
        conf: ConfChange,
        my_index: Option<usize>,
        /// Whether the change consumed a global seqno.
        ordered: bool,
    },
    Join(i64),
    Sync,
}

/// Single-member in-process backend.
pub struct DummyGcs {
    name: String,
    incoming: String,
    cache: WriteSetCache,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl DummyGcs {
    pub fn new(
        cache: WriteSetCache,
        repl_proto_ver: i32,
        appl_proto_ver: i32,
        name: &str,
        incoming: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            incoming: incoming.to_string(),
            cache,
            inner: Mutex::new(Inner {
                state: State::Open,
                global: 0,
                local: 0,
                group: GroupId::NIL,
                node: NodeId::random(),
                conf_id: 0,
                repl_proto_ver,
                appl_proto_ver,
                queue: VecDeque::new(),
                last_applied: GlobalSeqno::UNDEFINED.get(),
                report_last_applied: false,
                paused: false,
                next_handle: 0,
                interrupted: HashSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.lock().node
    }

    pub fn set_initial_position(&self, gtid: Gtid) -> Result<()> {
        let mut inner = self.inner.lock();
        if !gtid.group.is_nil() && !gtid.seqno.is_undefined() {
            inner.group = gtid.group;
            inner.global = gtid.seqno.get();
        }
        Ok(())
    }

    pub fn connect(&self, _cluster_name: &str, _cluster_url: &str, _bootstrap: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.group.is_nil() {
            inner.group = GroupId::random();
        }
        inner.conf_id += 1;
        let conf = ConfChange {
            conf_id: inner.conf_id,
            seqno: GlobalSeqno::new(inner.global.max(0)),
            group: inner.group,
            members: vec![ConfMember {
                id: inner.node,
                name: self.name.clone(),
                incoming: self.incoming.clone(),
                state: MemberState::Joined,
            }],
            repl_proto_ver: inner.repl_proto_ver,
            appl_proto_ver: inner.appl_proto_ver,
        };
        inner.queue.push_back(QueuedDelivery::ConfChange {
            conf,
            my_index: Some(0),
            ordered: false,
        });
        self.cond.notify_all();
        Ok(())
    }

    pub fn close(&self) {
        info!("closing dummy group connection");
        let mut inner = self.inner.lock();
        let conf = ConfChange {
            conf_id: -1,
            seqno: GlobalSeqno::UNDEFINED,
            group: inner.group,
            members: Vec::new(),
            repl_proto_ver: inner.repl_proto_ver,
            appl_proto_ver: inner.appl_proto_ver,
        };
        inner.queue.push_back(QueuedDelivery::ConfChange {
            conf,
            my_index: None,
            ordered: false,
        });
        self.cond.notify_all();
    }

    /// Test support: delivers an arbitrary configuration change as if the
    /// group agreed on it (protocol upgrades, membership edits).
    pub fn inject_conf_change(&self, mut conf: ConfChange, my_index: Option<usize>) {
        let mut inner = self.inner.lock();
        let ordered = conf.is_primary() && conf.seqno.get() > inner.global;
        if ordered {
            // ordered CC consumes a global seqno
            inner.global = conf.seqno.get();
        }
        inner.repl_proto_ver = conf.repl_proto_ver;
        if conf.group.is_nil() {
            conf.group = inner.group;
        }
        inner.queue.push_back(QueuedDelivery::ConfChange {
            conf,
            my_index,
            ordered,
        });
        self.cond.notify_all();
    }

    pub fn recv(&self) -> Result<Action> {
        let mut inner = self.inner.lock();
        loop {
            if inner.paused {
                return Err(Error::Paused);
            }
            if let Some(delivery) = inner.queue.pop_front() {
                inner.local += 1;
                let seqno_l = LocalSeqno::new(inner.local);
                return Ok(match delivery {
                    QueuedDelivery::ConfChange {
                        conf,
                        my_index,
                        ordered,
                    } => {
                        let primary = conf.is_primary();
                        if primary {
                            inner.state = State::Connected;
                        } else if conf.members.is_empty() {
                            inner.state = State::Closed;
                        }
                        // single member is trivially in sync after a
                        // primary view
                        if primary {
                            inner.queue.push_back(QueuedDelivery::Sync);
                        }
                        let buf = self.cache.store(conf.encode());
                        Action {
                            seqno_g: if ordered { conf.seqno } else { GlobalSeqno::UNDEFINED },
                            seqno_l,
                            payload: Payload::ConfChange { conf, my_index, buf },
                        }
                    }
                    QueuedDelivery::Join(code) => Action {
                        seqno_g: GlobalSeqno::UNDEFINED,
                        seqno_l,
                        payload: Payload::Join(code),
                    },
                    QueuedDelivery::Sync => {
                        inner.state = State::Synced;
                        Action {
                            seqno_g: GlobalSeqno::UNDEFINED,
                            seqno_l,
                            payload: Payload::Sync,
                        }
                    }
                });
            }
            if inner.report_last_applied {
                inner.report_last_applied = false;
                inner.local += 1;
                let cut = GlobalSeqno::new(inner.last_applied);
                return Ok(Action {
                    seqno_g: GlobalSeqno::UNDEFINED,
                    seqno_l: LocalSeqno::new(inner.local),
                    payload: Payload::CommitCut(cut),
                });
            }
            match inner.state {
                State::Open => return Err(Error::NotConnected),
                State::Closed => return Err(Error::Closed),
                _ => self.cond.wait(&mut inner),
            }
        }
    }

    pub fn repl(&self, payload: Bytes, handle: Option<ScheduleHandle>) -> Result<Replicated> {
        if payload.len() > MAX_ACTION_SIZE {
            return Err(Error::SizeExceeded(payload.len()));
        }
        let mut inner = self.inner.lock();
        if inner.state < State::Connected || inner.state == State::Closed {
            return Err(Error::NotConnected);
        }
        if let Some(h) = handle {
            if inner.interrupted.remove(&h.0) {
                return Err(Error::Interrupted);
            }
        }
        inner.global += 1;
        inner.local += 1;
        let buf = self.cache.store(payload);
        debug!(seqno_g = inner.global, seqno_l = inner.local, "write-set replicated");
        Ok(Replicated {
            seqno_g: GlobalSeqno::new(inner.global),
            seqno_l: LocalSeqno::new(inner.local),
            buf,
        })
    }

    pub fn schedule(&self) -> Result<ScheduleHandle> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        Ok(ScheduleHandle(inner.next_handle))
    }

    pub fn interrupt(&self, handle: ScheduleHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.interrupted.insert(handle.0);
        self.cond.notify_all();
        Ok(())
    }

    pub fn pause_recv(&self) {
        self.inner.lock().paused = true;
        self.cond.notify_all();
    }

    pub fn resume_recv(&self) -> Result<()> {
        self.inner.lock().paused = false;
        self.cond.notify_all();
        Ok(())
    }

    /// Coalesced last-applied reporting: repeated reports with
    /// non-decreasing seqnos collapse into a single commit cut.
    pub fn set_last_applied(&self, gtid: Gtid) -> Result<()> {
        let mut inner = self.inner.lock();
        if gtid.seqno.get() > inner.last_applied {
            inner.last_applied = gtid.seqno.get();
            inner.report_last_applied = true;
            self.cond.notify_all();
        }
        Ok(())
    }

    pub fn join(&self, _gtid: Gtid, code: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.queue.push_back(QueuedDelivery::Join(code));
        self.cond.notify_all();
        Ok(())
    }

    pub fn local_sequence(&self) -> LocalSeqno {
        let mut inner = self.inner.lock();
        inner.local += 1;
        LocalSeqno::new(inner.local)
    }

    pub fn desync(&self) -> Result<LocalSeqno> {
        Ok(self.local_sequence())
    }

    pub fn vote(&self, _gtid: Gtid, _code: i64, _data: &[u8]) -> Result<i64> {
        // single member: the local verdict is the group verdict
        Ok(0)
    }

    pub fn caused(&self, _deadline: Instant) -> Result<Gtid> {
        let inner = self.inner.lock();
        if inner.state < State::Connected {
            return Err(Error::NotConnected);
        }
        Ok(Gtid::new(inner.group, GlobalSeqno::new(inner.global)))
    }

    pub fn request_state_transfer(
        &self,
        _req: Bytes,
        _donor: &str,
        _ist_gtid: Gtid,
    ) -> Result<GlobalSeqno> {
        // a single-member group has nobody to transfer from
        Err(Error::NotImplemented)
    }

    pub fn max_action_size(&self) -> usize {
        MAX_ACTION_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> DummyGcs {
        DummyGcs::new(WriteSetCache::new(), 9, 1, "node-1", "127.0.0.1:3306")
    }

    #[test]
    fn connect_delivers_primary_view_then_sync() {
        let gcs = dummy();
        gcs.connect("test", "dummy://", true).unwrap();

        let cc = gcs.recv().unwrap();
        assert_eq!(cc.seqno_l, LocalSeqno::new(1));
        match cc.payload {
            Payload::ConfChange { conf, my_index, .. } => {
                assert!(conf.is_primary());
                assert_eq!(conf.members.len(), 1);
                assert_eq!(my_index, Some(0));
                assert_eq!(conf.seqno, GlobalSeqno::new(0));
            }
            other => panic!("expected conf change, got {other:?}"),
        }

        let sync = gcs.recv().unwrap();
        assert!(matches!(sync.payload, Payload::Sync));
        assert_eq!(sync.seqno_l, LocalSeqno::new(2));
    }

    #[test]
    fn repl_assigns_monotonic_seqnos() {
        let gcs = dummy();
        gcs.connect("test", "dummy://", true).unwrap();
        gcs.recv().unwrap();
        gcs.recv().unwrap();

        let a = gcs.repl(Bytes::from_static(b"ws-a"), None).unwrap();
        let b = gcs.repl(Bytes::from_static(b"ws-b"), None).unwrap();
        assert_eq!(a.seqno_g, GlobalSeqno::new(1));
        assert_eq!(b.seqno_g, GlobalSeqno::new(2));
        assert!(b.seqno_l > a.seqno_l);
    }

    #[test]
    fn last_applied_reports_coalesce() {
        let gcs = dummy();
        gcs.connect("test", "dummy://", true).unwrap();
        gcs.recv().unwrap();
        gcs.recv().unwrap();

        let g = gcs.caused(Instant::now()).unwrap().group;
        for s in [1, 2, 3] {
            gcs.set_last_applied(Gtid::new(g, GlobalSeqno::new(s))).unwrap();
        }
        // one commit cut, carrying the newest report
        let cut = gcs.recv().unwrap();
        match cut.payload {
            Payload::CommitCut(s) => assert_eq!(s, GlobalSeqno::new(3)),
            other => panic!("expected commit cut, got {other:?}"),
        }
        // stale re-report produces nothing
        gcs.set_last_applied(Gtid::new(g, GlobalSeqno::new(3))).unwrap();
        gcs.pause_recv();
        assert_eq!(gcs.recv().unwrap_err(), Error::Paused);
    }

    #[test]
    fn interrupted_schedule_cancels_repl() {
        let gcs = dummy();
        gcs.connect("test", "dummy://", true).unwrap();
        gcs.recv().unwrap();
        gcs.recv().unwrap();

        let handle = gcs.schedule().unwrap();
        gcs.interrupt(handle).unwrap();
        assert_eq!(
            gcs.repl(Bytes::from_static(b"ws"), Some(handle)).unwrap_err(),
            Error::Interrupted
        );
        // handle consumed; plain repl proceeds
        gcs.repl(Bytes::from_static(b"ws"), None).unwrap();
    }

    #[test]
    fn close_delivers_self_leave() {
        let gcs = dummy();
        gcs.connect("test", "dummy://", true).unwrap();
        gcs.recv().unwrap();
        gcs.recv().unwrap();
        gcs.close();

        let leave = gcs.recv().unwrap();
        match leave.payload {
            Payload::ConfChange { conf, .. } => {
                assert!(!conf.is_primary());
                assert!(conf.members.is_empty());
            }
            other => panic!("expected self-leave, got {other:?}"),
        }
        assert_eq!(gcs.recv().unwrap_err(), Error::Closed);
    }
}
