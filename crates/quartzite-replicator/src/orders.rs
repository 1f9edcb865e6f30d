//! Admission keys for the three pipeline monitors.
//!
//! The local monitor serializes strictly by local seqno, which keeps
//! certification identical across nodes. The apply monitor admits a
//! write-set once everything it depends on has left (parallel applying).
//! The commit monitor serializes by global seqno, relaxed according to the
//! configured commit-order mode.

use quartzite_monitor::Order;
use quartzite_types::{GlobalSeqno, LocalSeqno};

use crate::trx::TrxSlave;

/// Commit ordering policy (`repl.commit_order`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrderMode {
    /// No commit monitor at all.
    Bypass = 0,
    /// Out-of-order committing allowed for all transactions.
    Oooc = 1,
    /// Out-of-order committing allowed for local transactions only.
    LocalOooc = 2,
    /// Strict total order (default).
    NoOooc = 3,
}

impl CommitOrderMode {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(CommitOrderMode::Bypass),
            1 => Some(CommitOrderMode::Oooc),
            2 => Some(CommitOrderMode::LocalOooc),
            3 => Some(CommitOrderMode::NoOooc),
            _ => None,
        }
    }

    pub fn uses_monitor(self) -> bool {
        self != CommitOrderMode::Bypass
    }
}

/// Local monitor key: strict local-seqno succession.
#[derive(Debug, Clone, Copy)]
pub struct LocalOrder(pub LocalSeqno);

impl LocalOrder {
    pub fn for_ts(ts: &TrxSlave) -> Self {
        Self(ts.local_seqno())
    }
}

impl Order for LocalOrder {
    fn seqno(&self) -> i64 {
        self.0.get()
    }
}

/// Apply monitor key: admitted once the dependency has left.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOrder {
    pub global: GlobalSeqno,
    pub depends: GlobalSeqno,
}

impl ApplyOrder {
    pub fn for_ts(ts: &TrxSlave) -> Self {
        Self {
            global: ts.global_seqno(),
            depends: ts.depends(),
        }
    }

    /// Key for a seqno that never applies (configuration changes).
    pub fn cancel_only(global: GlobalSeqno) -> Self {
        Self {
            global,
            depends: global.prev(),
        }
    }
}

impl Order for ApplyOrder {
    fn seqno(&self) -> i64 {
        self.global.get()
    }

    fn can_enter(&self, last_left: i64) -> bool {
        self.depends.get() <= last_left
    }
}

/// Commit monitor key: strict global order, relaxed per mode.
#[derive(Debug, Clone, Copy)]
pub struct CommitOrder {
    pub global: GlobalSeqno,
    pub local: bool,
    pub mode: CommitOrderMode,
}

impl CommitOrder {
    pub fn for_ts(ts: &TrxSlave, mode: CommitOrderMode) -> Self {
        Self {
            global: ts.global_seqno(),
            local: ts.is_local(),
            mode,
        }
    }

    pub fn cancel_only(global: GlobalSeqno, mode: CommitOrderMode) -> Self {
        Self {
            global,
            local: false,
            mode,
        }
    }
}

impl Order for CommitOrder {
    fn seqno(&self) -> i64 {
        self.global.get()
    }

    fn can_enter(&self, last_left: i64) -> bool {
        match self.mode {
            CommitOrderMode::Bypass | CommitOrderMode::Oooc => true,
            CommitOrderMode::LocalOooc => self.local || self.global.get() == last_left + 1,
            CommitOrderMode::NoOooc => self.global.get() == last_left + 1,
        }
    }
}
