//! # quartzite-cert: Certification engine
//!
//! Certification decides, for every write-set delivered in total order,
//! whether it may commit: the write-set fails iff some key it touches was
//! written by a transaction the client's snapshot could not have seen
//! (`last_seen < writer's global seqno`). Successful write-sets install
//! their keys into the dependency index and receive a `depends` seqno (the
//! newest predecessor writing any of their keys) used to schedule parallel
//! applying.
//!
//! The index is a sliding window: entries at or below the group-wide commit
//! cut are purged. Appends and purges are serialized by the caller under
//! the local monitor, which is what keeps the index byte-identical across
//! nodes.
//!
//! The [`PendingCertQueue`] holds write-sets that were BF-aborted before
//! they could be appended: they are drained into the index in local-seqno
//! order before any later delivery certifies, so aborts do not make the
//! index diverge between nodes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, info, trace};
use twox_hash::XxHash64;

use quartzite_types::{GlobalSeqno, Gtid, LocalSeqno, View};

// ============================================================================
// Key fingerprints
// ============================================================================

/// Seed for key fingerprinting; must be identical on every node.
const KEY_HASH_SEED: u64 = 0xd1b5_4a32_d192_ed03;

/// Fingerprint of a write-set key. The index stores fingerprints only.
pub fn key_fingerprint(key: &[u8]) -> u64 {
    XxHash64::oneshot(KEY_HASH_SEED, key)
}

// ============================================================================
// Verdicts
// ============================================================================

/// Outcome of certifying one write-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No conflict; the write-set may apply and commit.
    Ok,
    /// Conflict with a committed writer outside the snapshot; roll back.
    Failed,
}

/// What the caller needs from certification: the verdict and the computed
/// dependency seqno (undefined on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertOutcome {
    pub verdict: Verdict,
    pub depends: GlobalSeqno,
}

/// One write-set as seen by the certification engine.
#[derive(Debug)]
pub struct CertRequest<'a> {
    pub global_seqno: GlobalSeqno,
    /// The client's observed snapshot at commit-request time.
    pub last_seen: GlobalSeqno,
    /// Forces full serialization against the immediate predecessor.
    pub pa_unsafe: bool,
    /// Total-order isolated actions serialize like `pa_unsafe`.
    pub isolation: bool,
    /// Explicit rollback fragments skip the conflict test.
    pub bypass: bool,
    /// Raw key bytes; fingerprinted internally.
    pub keys: &'a [&'a [u8]],
}

// ============================================================================
// Certification
// ============================================================================

/// The sliding dependency index plus live-transaction accounting.
///
/// Not internally synchronized: the replicator calls it under the local
/// monitor (appends, purges) or its own lock (position queries).
#[derive(Debug)]
pub struct Certification {
    /// key fingerprint -> newest global seqno that wrote it.
    index: HashMap<u64, i64>,
    /// live (unpurged) writer -> its installed fingerprints.
    trx_keys: BTreeMap<i64, Vec<u64>>,
    /// certified but not yet committed/purged, in seqno order.
    live: BTreeMap<i64, bool>,
    /// current certified position; every append must be position + 1.
    position: i64,
    /// all seqnos <= floor are committed (safe to discard).
    committed_floor: i64,
    /// write-set protocol version in effect.
    trx_proto_ver: i32,
}

impl Certification {
    /// A fresh engine at the undefined position: the first append after
    /// construction (or reset) re-seeds the position from its own seqno,
    /// which is how IST index preload starts mid-history.
    pub fn new(trx_proto_ver: i32) -> Self {
        Self {
            index: HashMap::new(),
            trx_keys: BTreeMap::new(),
            live: BTreeMap::new(),
            position: GlobalSeqno::UNDEFINED.get(),
            committed_floor: GlobalSeqno::UNDEFINED.get(),
            trx_proto_ver,
        }
    }

    /// Current certified position.
    pub fn position(&self) -> GlobalSeqno {
        GlobalSeqno::new(self.position)
    }

    pub fn trx_proto_ver(&self) -> i32 {
        self.trx_proto_ver
    }

    /// Lowest write-set whose keys are still installed; the preload start
    /// for a joiner rebuilding this index over IST.
    pub fn lowest_live_seqno(&self) -> Option<GlobalSeqno> {
        self.trx_keys.keys().next().map(|s| GlobalSeqno::new(*s))
    }

    /// Certifies one write-set and, on success, installs its keys.
    ///
    /// Must be called in global seqno order: `req.global_seqno` is either
    /// `position + 1` or, when the position is undefined, any seqno (the
    /// index re-seeds).
    pub fn append(&mut self, req: &CertRequest<'_>) -> CertOutcome {
        let g = req.global_seqno.get();
        if self.position >= 0 {
            assert_eq!(
                g,
                self.position + 1,
                "certification out of order: seqno {g}, position {}",
                self.position
            );
        }
        if self.live.is_empty() && self.committed_floor < g - 1 {
            self.committed_floor = g - 1;
        }

        let outcome = if req.bypass {
            // Explicit rollback fragments pass by definition; they carry no
            // conflicting writes.
            CertOutcome {
                verdict: Verdict::Ok,
                depends: GlobalSeqno::new(g - 1),
            }
        } else {
            self.test(req, g)
        };

        self.position = g;
        self.live.insert(g, false);

        if outcome.verdict == Verdict::Ok && !req.bypass {
            let mut fingerprints = Vec::with_capacity(req.keys.len());
            for key in req.keys {
                let fp = key_fingerprint(key);
                self.index.insert(fp, g);
                fingerprints.push(fp);
            }
            if !fingerprints.is_empty() {
                self.trx_keys.insert(g, fingerprints);
            }
        }

        trace!(
            seqno = g,
            verdict = ?outcome.verdict,
            depends = %outcome.depends,
            "certified"
        );
        outcome
    }

    fn test(&self, req: &CertRequest<'_>, g: i64) -> CertOutcome {
        let mut depends = GlobalSeqno::UNDEFINED.get();

        for key in req.keys {
            let fp = key_fingerprint(key);
            if let Some(&writer) = self.index.get(&fp) {
                debug_assert!(writer < g);
                if writer > req.last_seen.get() {
                    debug!(
                        seqno = g,
                        writer,
                        last_seen = %req.last_seen,
                        "certification conflict"
                    );
                    return CertOutcome {
                        verdict: Verdict::Failed,
                        depends: GlobalSeqno::UNDEFINED,
                    };
                }
                depends = depends.max(writer);
            }
        }

        if req.pa_unsafe || req.isolation {
            // Serialize against the immediate predecessor: no parallel
            // applying for this write-set.
            depends = g - 1;
        }

        debug_assert!(depends < g);
        CertOutcome {
            verdict: Verdict::Ok,
            depends: GlobalSeqno::new(depends),
        }
    }

    /// Marks a certified write-set committed and returns the highest seqno
    /// below which everything is committed (safe to discard group-wide).
    pub fn set_committed(&mut self, seqno: GlobalSeqno) -> GlobalSeqno {
        if let Some(committed) = self.live.get_mut(&seqno.get()) {
            *committed = true;
        }
        while let Some((&s, &committed)) = self.live.first_key_value() {
            if !committed {
                break;
            }
            self.live.remove(&s);
            self.committed_floor = s;
        }
        GlobalSeqno::new(self.committed_floor)
    }

    /// Drops index entries belonging to write-sets with seqno `<= upto`.
    pub fn purge_upto(&mut self, upto: GlobalSeqno) {
        let up = upto.get();
        let keep = self.trx_keys.split_off(&(up + 1));
        for (_, fingerprints) in std::mem::replace(&mut self.trx_keys, keep) {
            for fp in fingerprints {
                // A newer writer may have overwritten the entry; only the
                // stale ones go.
                if let Some(&writer) = self.index.get(&fp) {
                    if writer <= up {
                        self.index.remove(&fp);
                    }
                }
            }
        }
        // live entries at or below the cut are committed by definition of
        // the commit cut
        let keep = self.live.split_off(&(up + 1));
        self.live = keep;
        if self.committed_floor < up {
            self.committed_floor = up;
        }
    }

    /// Moves the certified position over an in-order configuration change
    /// (the CC consumes a seqno without being certified).
    pub fn adjust_position(&mut self, view: &View, position: Gtid, trx_proto_ver: i32) {
        let p = position.seqno.get();
        assert!(
            self.position < 0 || p >= self.position,
            "position adjusted backwards: {} -> {p}",
            self.position
        );
        info!(
            view_id = view.view_id,
            position = %position,
            trx_proto_ver,
            "certification position adjusted"
        );
        self.position = p;
        if self.live.is_empty() && self.committed_floor < p {
            self.committed_floor = p;
        }
        if trx_proto_ver >= 0 {
            self.trx_proto_ver = trx_proto_ver;
        }
    }

    /// Hard reset: drops the whole index and repositions (used after SST
    /// and on protocol upgrades).
    pub fn assign_initial_position(&mut self, position: Gtid, trx_proto_ver: i32) {
        info!(position = %position, trx_proto_ver, "certification index reset");
        self.index.clear();
        self.trx_keys.clear();
        self.live.clear();
        self.position = position.seqno.get();
        self.committed_floor = self.position;
        if trx_proto_ver >= 0 {
            self.trx_proto_ver = trx_proto_ver;
        }
    }

    /// Number of installed index entries (diagnostics).
    pub fn index_len(&self) -> usize {
        self.index.len()
    }
}

// ============================================================================
// Pending certification queue
// ============================================================================

/// Write-sets BF-aborted before they could be appended, keyed by local
/// seqno. Drained into the index in local order so every node certifies
/// the same sequence.
#[derive(Debug)]
pub struct PendingCertQueue<T> {
    queue: Mutex<BTreeMap<i64, T>>,
}

impl<T> Default for PendingCertQueue<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> PendingCertQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, local_seqno: LocalSeqno, item: T) {
        let prev = self.queue.lock().insert(local_seqno.get(), item);
        debug_assert!(prev.is_none(), "duplicate pending cert entry");
    }

    /// Pops the frontmost entry whose local seqno precedes `before`.
    pub fn pop_next_before(&self, before: LocalSeqno) -> Option<T> {
        let mut queue = self.queue.lock();
        let (&front, _) = queue.first_key_value()?;
        if front < before.get() {
            queue.remove(&front)
        } else {
            None
        }
    }

    /// Drops all queued entries (index reset).
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(s: i64) -> GlobalSeqno {
        GlobalSeqno::new(s)
    }

    fn req<'a>(g: i64, last_seen: i64, keys: &'a [&'a [u8]]) -> CertRequest<'a> {
        CertRequest {
            global_seqno: seq(g),
            last_seen: seq(last_seen),
            pa_unsafe: false,
            isolation: false,
            bypass: false,
            keys,
        }
    }

    #[test]
    fn first_append_seeds_position() {
        let mut cert = Certification::new(1);
        assert_eq!(cert.position(), GlobalSeqno::UNDEFINED);

        let out = cert.append(&req(1, 0, &[b"k1"]));
        assert_eq!(out.verdict, Verdict::Ok);
        assert_eq!(out.depends, GlobalSeqno::UNDEFINED);
        assert_eq!(cert.position(), seq(1));
    }

    #[test]
    fn depends_is_newest_predecessor() {
        let mut cert = Certification::new(1);
        cert.append(&req(1, 0, &[b"a"]));
        cert.append(&req(2, 1, &[b"b"]));
        let out = cert.append(&req(3, 2, &[b"a", b"c"]));

        assert_eq!(out.verdict, Verdict::Ok);
        assert_eq!(out.depends, seq(1));
    }

    #[test]
    fn conflict_outside_snapshot_fails() {
        let mut cert = Certification::new(1);
        for g in 1..=12 {
            cert.append(&req(g, g - 1, &[b"k1"]));
        }
        // snapshot at 10, but k1 was last written at 12
        let out = cert.append(&req(13, 10, &[b"k1"]));
        assert_eq!(out.verdict, Verdict::Failed);
        assert_eq!(out.depends, GlobalSeqno::UNDEFINED);
        // position still advances so the next delivery certifies in order
        assert_eq!(cert.position(), seq(13));
    }

    #[test]
    fn failed_append_installs_nothing() {
        let mut cert = Certification::new(1);
        cert.append(&req(1, 0, &[b"k1"]));
        let installed = cert.index_len();
        cert.append(&req(2, 0, &[b"k1"]));
        assert_eq!(cert.index_len(), installed);
    }

    #[test]
    fn pa_unsafe_serializes_fully() {
        let mut cert = Certification::new(1);
        cert.append(&req(1, 0, &[b"a"]));
        let out = cert.append(&CertRequest {
            pa_unsafe: true,
            ..req(2, 1, &[b"zzz"])
        });
        assert_eq!(out.depends, seq(1));
    }

    #[test]
    fn bypass_always_passes() {
        let mut cert = Certification::new(1);
        for g in 1..=3 {
            cert.append(&req(g, g - 1, &[b"k"]));
        }
        let out = cert.append(&CertRequest {
            bypass: true,
            ..req(4, 0, &[b"k"])
        });
        assert_eq!(out.verdict, Verdict::Ok);
    }

    #[test]
    fn committed_floor_tracks_in_order_commits() {
        let mut cert = Certification::new(1);
        for g in 1..=3 {
            cert.append(&req(g, g - 1, &[b"k"]));
        }
        assert_eq!(cert.set_committed(seq(2)), seq(0));
        assert_eq!(cert.set_committed(seq(1)), seq(2));
        assert_eq!(cert.set_committed(seq(3)), seq(3));
        // repeated reports are idempotent
        assert_eq!(cert.set_committed(seq(3)), seq(3));
    }

    #[test]
    fn purge_drops_only_stale_entries() {
        let mut cert = Certification::new(1);
        cert.append(&req(1, 0, &[b"a"]));
        cert.append(&req(2, 1, &[b"a", b"b"]));
        cert.append(&req(3, 2, &[b"c"]));

        cert.purge_upto(seq(1));
        // "a" now owned by seqno 2, must have survived
        let out = cert.append(&req(4, 1, &[b"a"]));
        assert_eq!(out.verdict, Verdict::Failed);

        cert.purge_upto(seq(4));
        let out = cert.append(&req(5, 0, &[b"a"]));
        assert_eq!(out.verdict, Verdict::Ok);
    }

    #[test]
    fn reset_clears_everything() {
        let mut cert = Certification::new(1);
        cert.append(&req(1, 0, &[b"a"]));
        cert.assign_initial_position(Gtid::UNDEFINED, 2);

        assert_eq!(cert.position(), GlobalSeqno::UNDEFINED);
        assert_eq!(cert.index_len(), 0);
        assert_eq!(cert.trx_proto_ver(), 2);

        // re-seed mid-history, as IST preload does
        let out = cert.append(&req(80, 0, &[b"a"]));
        assert_eq!(out.verdict, Verdict::Ok);
        assert_eq!(cert.position(), seq(80));
    }

    #[test]
    fn lowest_live_seqno_is_preload_start() {
        let mut cert = Certification::new(1);
        assert_eq!(cert.lowest_live_seqno(), None);
        cert.append(&req(1, 0, &[b"a"]));
        cert.append(&req(2, 1, &[b"b"]));
        assert_eq!(cert.lowest_live_seqno(), Some(seq(1)));
        cert.purge_upto(seq(1));
        assert_eq!(cert.lowest_live_seqno(), Some(seq(2)));
    }

    /// Two engines fed the same request sequence return identical verdicts
    /// and depends seqnos (certification agreement across nodes).
    #[test]
    fn lockstep_agreement() {
        let mut a = Certification::new(1);
        let mut b = Certification::new(1);

        let keys: Vec<Vec<u8>> = (0..8).map(|i| vec![b'k', i]).collect();
        for g in 1..=200i64 {
            let k1 = keys[(g % 8) as usize].as_slice();
            let k2 = keys[((g * 7) % 8) as usize].as_slice();
            let ks = [k1, k2];
            let r = req(g, (g - 1 - (g % 5)).max(0), &ks);
            let oa = a.append(&r);
            let r = req(g, (g - 1 - (g % 5)).max(0), &ks);
            let ob = b.append(&r);
            assert_eq!(oa, ob, "diverged at seqno {g}");
        }
    }

    #[test]
    fn pending_queue_orders_by_local_seqno() {
        let q: PendingCertQueue<&'static str> = PendingCertQueue::new();
        q.push(LocalSeqno::new(5), "five");
        q.push(LocalSeqno::new(3), "three");

        assert_eq!(q.pop_next_before(LocalSeqno::new(3)), None);
        assert_eq!(q.pop_next_before(LocalSeqno::new(6)), Some("three"));
        assert_eq!(q.pop_next_before(LocalSeqno::new(6)), Some("five"));
        assert_eq!(q.pop_next_before(LocalSeqno::new(6)), None);

        q.push(LocalSeqno::new(9), "nine");
        q.clear();
        assert!(q.is_empty());
    }
}
