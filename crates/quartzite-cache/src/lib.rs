//! # quartzite-cache: Write-set buffer cache
//!
//! The cache hands off write-set buffers between the receive path, the
//! certification/apply pipeline and IST senders. A buffer enters the cache
//! as raw bytes ([`WriteSetCache::store`]) and is later associated with its
//! global seqno once ordering is known ([`WriteSetCache::seqno_assign`]).
//! Seqno-assigned buffers stay resident until purged by a commit cut, and
//! IST senders pin a suffix of the seqno range with a [`SeqnoLock`] so the
//! buffers they are streaming cannot be trimmed underneath them.
//!
//! Buffers are reference counted; a buffer that was never seqno-assigned is
//! freed when its last [`BufferRef`] drops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use quartzite_types::{GlobalSeqno, Gtid};

// ============================================================================
// Errors
// ============================================================================

/// Cache errors.
#[derive(Error, Debug)]
pub enum Error {
    /// No buffer assigned to the seqno (never assigned, or already purged).
    #[error("no buffer for seqno {0}")]
    NotFound(GlobalSeqno),

    /// Seqno assignment went backwards.
    #[error("seqno {seqno} assigned out of order, highest is {highest}")]
    OutOfOrder {
        seqno: GlobalSeqno,
        highest: GlobalSeqno,
    },

    /// Seqno already has a buffer assigned.
    #[error("seqno {0} already assigned")]
    AlreadyAssigned(GlobalSeqno),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Buffers
// ============================================================================

/// What kind of ordered action a cached buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufKind {
    /// A replicated write-set.
    WriteSet,
    /// A configuration change.
    ConfChange,
}

/// Reference-counted handle to a cached buffer.
#[derive(Clone)]
pub struct BufferRef {
    data: Bytes,
    id: u64,
}

impl BufferRef {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Identity comparison: two refs to the same stored buffer.
    pub fn same_buffer(&self, other: &BufferRef) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A seqno-assigned buffer as returned to IST senders.
#[derive(Debug, Clone)]
pub struct SeqnoBuffer {
    pub seqno: GlobalSeqno,
    pub kind: BufKind,
    /// Placeholder for an action that must not be applied.
    pub skip: bool,
    pub buf: BufferRef,
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug)]
struct Entry {
    buf: BufferRef,
    kind: BufKind,
    skip: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Seqno-ordered resident buffers.
    map: BTreeMap<i64, Entry>,
    /// Highest seqno ever assigned.
    highest: i64,
    /// Position installed by the last reset.
    position: Gtid,
    /// Active trim fences: lock id -> lowest pinned seqno.
    locks: BTreeMap<u64, i64>,
    next_buffer_id: u64,
    next_lock_id: u64,
}

/// The write-set buffer cache. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct WriteSetCache {
    inner: Arc<Mutex<Inner>>,
}

impl WriteSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of raw action bytes, returning a buffer handle.
    pub fn store(&self, data: Bytes) -> BufferRef {
        let mut inner = self.inner.lock();
        let id = inner.next_buffer_id;
        inner.next_buffer_id += 1;
        BufferRef { data, id }
    }

    /// Associates a buffer with its global seqno.
    ///
    /// Assignments must be made in seqno order; this keeps the resident
    /// range contiguous so IST senders can stream it without gaps.
    pub fn seqno_assign(
        &self,
        buf: &BufferRef,
        seqno: GlobalSeqno,
        kind: BufKind,
        skip: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let s = seqno.get();
        if s <= inner.highest && inner.highest >= 0 {
            if inner.map.contains_key(&s) {
                return Err(Error::AlreadyAssigned(seqno));
            }
            return Err(Error::OutOfOrder {
                seqno,
                highest: GlobalSeqno::new(inner.highest),
            });
        }
        inner.highest = s;
        inner.map.insert(
            s,
            Entry {
                buf: buf.clone(),
                kind,
                skip,
            },
        );
        Ok(())
    }

    /// Marks an assigned seqno as a skip placeholder (e.g. after the group
    /// voted the write-set inconsistent on this node).
    pub fn seqno_skip(&self, seqno: GlobalSeqno) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.map.get_mut(&seqno.get()) {
            Some(entry) => {
                entry.skip = true;
                Ok(())
            }
            None => Err(Error::NotFound(seqno)),
        }
    }

    /// Looks up the buffer assigned to `seqno`.
    pub fn seqno_buffer(&self, seqno: GlobalSeqno) -> Result<SeqnoBuffer> {
        let inner = self.inner.lock();
        inner
            .map
            .get(&seqno.get())
            .map(|e| SeqnoBuffer {
                seqno,
                kind: e.kind,
                skip: e.skip,
                buf: e.buf.clone(),
            })
            .ok_or(Error::NotFound(seqno))
    }

    /// Returns up to `max` consecutive buffers starting at `first`.
    ///
    /// Stops at the first missing seqno; an empty result means `first` is
    /// not resident.
    pub fn buffers_from(&self, first: GlobalSeqno, max: usize) -> Vec<SeqnoBuffer> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut s = first.get();
        while out.len() < max {
            match inner.map.get(&s) {
                Some(e) => out.push(SeqnoBuffer {
                    seqno: GlobalSeqno::new(s),
                    kind: e.kind,
                    skip: e.skip,
                    buf: e.buf.clone(),
                }),
                None => break,
            }
            s += 1;
        }
        out
    }

    /// Pins every seqno `>= first` against purging until the returned lock
    /// is dropped.
    pub fn seqno_lock(&self, first: GlobalSeqno) -> SeqnoLock {
        let mut inner = self.inner.lock();
        let id = inner.next_lock_id;
        inner.next_lock_id += 1;
        inner.locks.insert(id, first.get());
        SeqnoLock {
            cache: self.inner.clone(),
            id,
        }
    }

    /// Drops all buffers with seqno `<= upto`, honoring active seqno locks.
    pub fn purge_upto(&self, upto: GlobalSeqno) {
        let mut inner = self.inner.lock();
        let fence = inner.locks.values().copied().min();
        let limit = match fence {
            Some(f) => upto.get().min(f - 1),
            None => upto.get(),
        };
        let keep = inner.map.split_off(&(limit + 1));
        let dropped = inner.map.len();
        inner.map = keep;
        if dropped > 0 {
            debug!(upto = %upto, dropped, "cache purged");
        }
    }

    /// Lowest resident seqno, if any.
    pub fn seqno_min(&self) -> Option<GlobalSeqno> {
        let inner = self.inner.lock();
        inner.map.keys().next().map(|s| GlobalSeqno::new(*s))
    }

    /// Highest assigned seqno, [`GlobalSeqno::UNDEFINED`] if none yet.
    pub fn seqno_max(&self) -> GlobalSeqno {
        GlobalSeqno::new(self.inner.lock().highest)
    }

    /// Hard reset of the seqno index (state snapshot installed, history
    /// restarts around `position`).
    ///
    /// The next assignment re-seeds the monotonicity check: a joiner's
    /// index preload starts below the snapshot position.
    pub fn reset(&self, position: Gtid) {
        let mut inner = self.inner.lock();
        if !inner.locks.is_empty() {
            warn!(locks = inner.locks.len(), "cache reset with active seqno locks");
        }
        inner.map.clear();
        inner.highest = GlobalSeqno::UNDEFINED.get();
        inner.position = position;
        debug!(position = %position, "cache seqno index reset");
    }

    /// Position installed by the last [`WriteSetCache::reset`].
    pub fn position(&self) -> Gtid {
        self.inner.lock().position
    }
}

impl fmt::Debug for WriteSetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WriteSetCache")
            .field("resident", &inner.map.len())
            .field("highest", &inner.highest)
            .field("locks", &inner.locks.len())
            .finish()
    }
}

/// Trim fence handle returned by [`WriteSetCache::seqno_lock`].
pub struct SeqnoLock {
    cache: Arc<Mutex<Inner>>,
    id: u64,
}

impl Drop for SeqnoLock {
    fn drop(&mut self) {
        self.cache.lock().locks.remove(&self.id);
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

    #[test]
    fn assign_and_lookup() {
        let cache = WriteSetCache::new();
        let buf = cache.store(Bytes::from_static(b"ws-1"));
        cache.seqno_assign(&buf, seq(1), BufKind::WriteSet, false).unwrap();

        let got = cache.seqno_buffer(seq(1)).unwrap();
        assert_eq!(got.buf.data().as_ref(), b"ws-1");
        assert!(!got.skip);
        assert!(got.buf.same_buffer(&buf));
        assert!(cache.seqno_buffer(seq(2)).is_err());
    }

    #[test]
    fn out_of_order_assignment_rejected() {
        let cache = WriteSetCache::new();
        let a = cache.store(Bytes::from_static(b"a"));
        let b = cache.store(Bytes::from_static(b"b"));
        cache.seqno_assign(&a, seq(5), BufKind::WriteSet, false).unwrap();

        assert!(matches!(
            cache.seqno_assign(&b, seq(4), BufKind::WriteSet, false),
            Err(Error::OutOfOrder { .. })
        ));
        assert!(matches!(
            cache.seqno_assign(&b, seq(5), BufKind::WriteSet, false),
            Err(Error::AlreadyAssigned(_))
        ));
    }

    #[test]
    fn batched_range_reads_stop_at_gap() {
        let cache = WriteSetCache::new();
        for s in 1..=5 {
            let buf = cache.store(Bytes::from(format!("ws-{s}")));
            cache.seqno_assign(&buf, seq(s), BufKind::WriteSet, false).unwrap();
        }
        cache.purge_upto(seq(2));

        assert!(cache.buffers_from(seq(1), 10).is_empty());
        let got = cache.buffers_from(seq(3), 10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].seqno, seq(3));
        assert_eq!(got[2].seqno, seq(5));

        let capped = cache.buffers_from(seq(3), 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn seqno_lock_fences_purge() {
        let cache = WriteSetCache::new();
        for s in 1..=4 {
            let buf = cache.store(Bytes::from_static(b"x"));
            cache.seqno_assign(&buf, seq(s), BufKind::WriteSet, false).unwrap();
        }

        let lock = cache.seqno_lock(seq(3));
        cache.purge_upto(seq(4));
        // 1..2 purged, 3..4 pinned
        assert_eq!(cache.seqno_min(), Some(seq(3)));

        drop(lock);
        cache.purge_upto(seq(4));
        assert_eq!(cache.seqno_min(), None);
    }

    #[test]
    fn skip_marking() {
        let cache = WriteSetCache::new();
        let buf = cache.store(Bytes::from_static(b"x"));
        cache.seqno_assign(&buf, seq(1), BufKind::WriteSet, false).unwrap();
        cache.seqno_skip(seq(1)).unwrap();
        assert!(cache.seqno_buffer(seq(1)).unwrap().skip);
    }

    #[test]
    fn reset_installs_new_position() {
        let cache = WriteSetCache::new();
        let buf = cache.store(Bytes::from_static(b"x"));
        cache.seqno_assign(&buf, seq(7), BufKind::WriteSet, false).unwrap();

        let pos = Gtid::new(quartzite_types::GroupId::random(), seq(100));
        cache.reset(pos);
        assert_eq!(cache.seqno_min(), None);
        assert_eq!(cache.position(), pos);

        // the monotonicity check re-seeds: index preload may start below
        // the installed position
        let buf = cache.store(Bytes::from_static(b"y"));
        cache.seqno_assign(&buf, seq(80), BufKind::WriteSet, false).unwrap();
        let buf = cache.store(Bytes::from_static(b"z"));
        assert!(cache.seqno_assign(&buf, seq(80), BufKind::WriteSet, false).is_err());
        cache.seqno_assign(&buf, seq(81), BufKind::WriteSet, false).unwrap();
    }
}
