//! # quartzite-monitor: Ordered-gate monitors
//!
//! A [`SeqnoMonitor`] admits holders of monotonically increasing sequence
//! numbers through a critical stage. Admission is delegated to an [`Order`]
//! key, which lets one implementation serve all three pipeline stages:
//!
//! - the local monitor admits strictly by local seqno (one delivery at a
//!   time, keeping certification identical across nodes),
//! - the apply monitor admits a write-set as soon as everything it depends
//!   on has left (parallel applying),
//! - the commit monitor serializes commits in global seqno order.
//!
//! `enter` may block and is cancellable through `interrupt`, which is how a
//! higher-priority remote transaction preempts a local one waiting in the
//! pipeline. An interrupt is edge-triggered: it is consumed by the next
//! `enter` of that seqno and has no effect once the seqno has entered.
//!
//! The monitor tracks `last_left`: the highest seqno `n` such that every
//! seqno `<= n` has left (or was cancelled). `drain(upto)` blocks until
//! `last_left >= upto`, which is the fence used by configuration changes and
//! state transfer.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

// ============================================================================
// Errors
// ============================================================================

/// Monitor wait outcomes that are not plain success.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The waiter was preempted via [`SeqnoMonitor::interrupt`].
    #[error("monitor wait interrupted")]
    Interrupted,

    /// A deadline-bounded wait ran out of time.
    #[error("monitor wait timed out")]
    Timeout,
}

/// Result type for monitor operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Order keys
// ============================================================================

/// Admission key for a monitor.
///
/// `seqno` must be unique per monitor and dense: every seqno is eventually
/// entered, self-cancelled or interrupted, otherwise `last_left` stalls.
pub trait Order {
    fn seqno(&self) -> i64;

    /// Whether this key may enter when everything up to `last_left` has
    /// left the monitor.
    fn can_enter(&self, last_left: i64) -> bool {
        self.seqno() == last_left + 1
    }
}

/// Strict successor ordering; the default admission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalOrder(pub i64);

impl Order for TotalOrder {
    fn seqno(&self) -> i64 {
        self.0
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Blocked in `enter`.
    Waiting,
    /// Inside the monitor.
    Entered,
    /// Left (or cancelled); waiting for `last_left` to sweep over it.
    Left,
    /// Interrupt pending; consumed by the next `enter` of this seqno.
    Interrupted,
}

#[derive(Debug)]
struct Inner {
    last_left: i64,
    last_entered: i64,
    slots: BTreeMap<i64, Slot>,
}

impl Inner {
    /// Sweeps `last_left` forward over contiguous `Left` slots.
    fn advance(&mut self) -> bool {
        let mut advanced = false;
        while let Some(Slot::Left) = self.slots.get(&(self.last_left + 1)) {
            self.slots.remove(&(self.last_left + 1));
            self.last_left += 1;
            advanced = true;
        }
        advanced
    }
}

/// An ordered gate keyed by sequence number. See the crate docs.
#[derive(Debug)]
pub struct SeqnoMonitor {
    name: &'static str,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl SeqnoMonitor {
    /// Creates a monitor positioned at seqno 0 (the first admissible strict
    /// key is 1).
    pub fn new(name: &'static str) -> Self {
        Self::with_position(name, 0)
    }

    pub fn with_position(name: &'static str, position: i64) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                last_left: position,
                last_entered: position,
                slots: BTreeMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until `order` is admissible, then enters.
    ///
    /// Returns [`Error::Interrupted`] if the slot was interrupted before or
    /// during the wait; the interrupt mark is consumed either way.
    pub fn enter<O: Order>(&self, order: &O) -> Result<()> {
        let seqno = order.seqno();
        let mut inner = self.inner.lock();

        assert!(
            seqno > inner.last_left,
            "{}: enter({seqno}) behind position {}",
            self.name,
            inner.last_left
        );

        loop {
            match inner.slots.get(&seqno) {
                Some(Slot::Interrupted) => {
                    inner.slots.remove(&seqno);
                    trace!(monitor = self.name, seqno, "enter interrupted");
                    return Err(Error::Interrupted);
                }
                Some(Slot::Entered | Slot::Left) => {
                    panic!("{}: seqno {seqno} entered twice", self.name);
                }
                Some(Slot::Waiting) | None => {}
            }

            if order.can_enter(inner.last_left) {
                inner.slots.insert(seqno, Slot::Entered);
                if seqno > inner.last_entered {
                    inner.last_entered = seqno;
                }
                trace!(monitor = self.name, seqno, "entered");
                return Ok(());
            }

            inner.slots.insert(seqno, Slot::Waiting);
            self.cond.wait(&mut inner);
        }
    }

    /// Releases `order` and wakes successors and drain waiters.
    pub fn leave<O: Order>(&self, order: &O) {
        let seqno = order.seqno();
        let mut inner = self.inner.lock();
        match inner.slots.get(&seqno) {
            Some(Slot::Entered) => {
                inner.slots.insert(seqno, Slot::Left);
            }
            other => panic!(
                "{}: leave({seqno}) without enter (slot {other:?}, position {})",
                self.name, inner.last_left
            ),
        }
        inner.advance();
        trace!(monitor = self.name, seqno, last_left = inner.last_left, "left");
        self.cond.notify_all();
    }

    /// Marks `order` as never entering; successors observe it as left.
    ///
    /// Any pending interrupt for the slot is discarded.
    pub fn self_cancel<O: Order>(&self, order: &O) {
        let seqno = order.seqno();
        let mut inner = self.inner.lock();
        assert!(
            seqno > inner.last_left,
            "{}: self_cancel({seqno}) behind position {}",
            self.name,
            inner.last_left
        );
        match inner.slots.get(&seqno) {
            None | Some(Slot::Interrupted) => {
                inner.slots.insert(seqno, Slot::Left);
            }
            Some(slot) => panic!("{}: self_cancel({seqno}) on active slot {slot:?}", self.name),
        }
        inner.advance();
        self.cond.notify_all();
    }

    /// Interrupts the waiter for `seqno`.
    ///
    /// Effective if the waiter is currently blocked in `enter` or has not
    /// arrived yet; a seqno that has already entered is not disturbed.
    /// Returns whether the interrupt took effect.
    pub fn interrupt<O: Order>(&self, order: &O) -> bool {
        let seqno = order.seqno();
        let mut inner = self.inner.lock();
        if seqno <= inner.last_left {
            return false;
        }
        match inner.slots.get(&seqno) {
            Some(Slot::Entered | Slot::Left) => false,
            Some(Slot::Interrupted) => true,
            Some(Slot::Waiting) | None => {
                inner.slots.insert(seqno, Slot::Interrupted);
                self.cond.notify_all();
                true
            }
        }
    }

    /// Blocks until every seqno `<= upto` has left.
    pub fn drain(&self, upto: i64) {
        let mut inner = self.inner.lock();
        while inner.last_left < upto {
            self.cond.wait(&mut inner);
        }
    }

    /// [`SeqnoMonitor::drain`] with a deadline.
    pub fn drain_until(&self, upto: i64, deadline: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.last_left < upto {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Highest seqno below which everything has left.
    pub fn last_left(&self) -> i64 {
        self.inner.lock().last_left
    }

    /// Highest seqno that has entered.
    pub fn last_entered(&self) -> i64 {
        self.inner.lock().last_entered
    }

    /// Whether `order` is currently inside the monitor.
    pub fn entered<O: Order>(&self, order: &O) -> bool {
        matches!(
            self.inner.lock().slots.get(&order.seqno()),
            Some(Slot::Entered)
        )
    }

    /// Repositions an idle monitor (state transfer, first view).
    ///
    /// Must not be called with active or waiting holders.
    pub fn set_position(&self, position: i64) {
        let mut inner = self.inner.lock();
        assert!(
            inner
                .slots
                .values()
                .all(|s| matches!(s, Slot::Left | Slot::Interrupted)),
            "{}: repositioning with active holders",
            self.name
        );
        inner.slots.clear();
        inner.last_left = position;
        inner.last_entered = position;
        self.cond.notify_all();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Depends-based admission as used by the apply stage.
    struct DependsOrder {
        seqno: i64,
        depends: i64,
    }

    impl Order for DependsOrder {
        fn seqno(&self) -> i64 {
            self.seqno
        }

        fn can_enter(&self, last_left: i64) -> bool {
            self.depends <= last_left
        }
    }

    #[test]
    fn enter_leave_advances_position() {
        let m = SeqnoMonitor::new("test");
        m.enter(&TotalOrder(1)).unwrap();
        assert!(m.entered(&TotalOrder(1)));
        m.leave(&TotalOrder(1));
        assert_eq!(m.last_left(), 1);
        assert!(!m.entered(&TotalOrder(1)));
    }

    #[test]
    fn self_cancel_is_equivalent_to_enter_leave_for_successors() {
        let m = SeqnoMonitor::new("test");
        m.self_cancel(&TotalOrder(1));
        assert_eq!(m.last_left(), 1);
        // successor admissible immediately
        m.enter(&TotalOrder(2)).unwrap();
        m.leave(&TotalOrder(2));
        assert_eq!(m.last_left(), 2);
    }

    #[test]
    fn strict_order_blocks_until_predecessor_leaves() {
        let m = Arc::new(SeqnoMonitor::new("test"));
        m.enter(&TotalOrder(1)).unwrap();

        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || {
            m2.enter(&TotalOrder(2)).unwrap();
            let pos = m2.last_left();
            m2.leave(&TotalOrder(2));
            pos
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(m.last_left(), 0);
        m.leave(&TotalOrder(1));

        // seqno 2 observed 1 having left before entering
        assert_eq!(t.join().unwrap(), 1);
        m.drain(2);
    }

    #[test]
    fn interrupt_wakes_blocked_waiter() {
        let m = Arc::new(SeqnoMonitor::new("test"));
        m.enter(&TotalOrder(1)).unwrap();

        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || m2.enter(&TotalOrder(2)));

        thread::sleep(Duration::from_millis(50));
        assert!(m.interrupt(&TotalOrder(2)));
        assert_eq!(t.join().unwrap(), Err(Error::Interrupted));

        // the interrupted slot must be cancelled for the gate to move on
        m.self_cancel(&TotalOrder(2));
        m.leave(&TotalOrder(1));
        assert_eq!(m.last_left(), 2);
    }

    #[test]
    fn interrupt_before_arrival_is_sticky_and_consumed_once() {
        let m = SeqnoMonitor::new("test");
        assert!(m.interrupt(&TotalOrder(1)));

        assert_eq!(m.enter(&TotalOrder(1)), Err(Error::Interrupted));
        // consumed: the retry may enter normally
        m.enter(&TotalOrder(1)).unwrap();
        m.leave(&TotalOrder(1));
    }

    #[test]
    fn interrupt_has_no_effect_after_entry() {
        let m = SeqnoMonitor::new("test");
        m.enter(&TotalOrder(1)).unwrap();
        assert!(!m.interrupt(&TotalOrder(1)));
        m.leave(&TotalOrder(1));
        assert!(!m.interrupt(&TotalOrder(1)));
    }

    #[test]
    fn depends_admission_allows_parallel_entry() {
        let m = Arc::new(SeqnoMonitor::new("apply"));

        // seqno 1 enters and stays; seqno 3 depends only on 0 so it may
        // enter alongside.
        m.enter(&DependsOrder { seqno: 1, depends: 0 }).unwrap();
        m.enter(&DependsOrder { seqno: 3, depends: 0 }).unwrap();
        assert_eq!(m.last_entered(), 3);

        // seqno 2 depends on 1: blocked until 1 leaves.
        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || {
            m2.enter(&DependsOrder { seqno: 2, depends: 1 }).unwrap();
            m2.leave(&TotalOrder(2));
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(m.last_left(), 0);

        m.leave(&TotalOrder(1));
        t.join().unwrap();
        m.leave(&TotalOrder(3));
        assert_eq!(m.last_left(), 3);
    }

    #[test]
    fn drain_blocks_until_all_left() {
        let m = Arc::new(SeqnoMonitor::new("test"));
        let done = Arc::new(AtomicI64::new(0));

        let handles: Vec<_> = (1..=8)
            .map(|s| {
                let m = Arc::clone(&m);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    m.enter(&TotalOrder(s)).unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                    m.leave(&TotalOrder(s));
                })
            })
            .collect();

        m.drain(8);
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(m.last_left(), 8);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn drain_until_times_out() {
        let m = SeqnoMonitor::new("test");
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(m.drain_until(5, deadline), Err(Error::Timeout));

        m.self_cancel(&TotalOrder(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(m.drain_until(1, deadline), Ok(()));
    }

    #[test]
    fn total_order_of_leaves_under_contention() {
        let m = Arc::new(SeqnoMonitor::new("commit"));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for s in 1..=32 {
            let m = Arc::clone(&m);
            let log = Arc::clone(&log);
            handles.push(thread::spawn(move || {
                m.enter(&TotalOrder(s)).unwrap();
                log.lock().push(s);
                m.leave(&TotalOrder(s));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let log = log.lock();
        assert_eq!(*log, (1..=32).collect::<Vec<_>>());
    }

    #[test]
    fn set_position_repositions_idle_monitor() {
        let m = SeqnoMonitor::new("test");
        m.set_position(99);
        assert_eq!(m.last_left(), 99);
        m.enter(&TotalOrder(100)).unwrap();
        m.leave(&TotalOrder(100));
        assert_eq!(m.last_left(), 100);
    }
}
