//! # quartzite-gcs: Group communication adapter
//!
//! The replication core consumes an ordered stream of [`Action`]s from a
//! group communication service and feeds write-sets, votes and last-applied
//! reports back into it. This crate defines that contract and ships two
//! in-process backends behind the closed [`Gcs`] dispatch enum:
//!
//! - [`DummyGcs`]: a single-member group for standalone nodes and tests,
//! - [`GcsHub`]/[`HubGcs`]: an N-endpoint total-order sequencer with views,
//!   used to exercise multi-node certification and ordering.
//!
//! The wire-level group communication service itself (atomic broadcast,
//! membership agreement) is an external collaborator; only its delivery
//! contract is modeled here.

pub mod action;
pub mod dummy;
pub mod error;
pub mod hub;

pub use action::{Action, ConfChange, ConfMember, Payload};
pub use dummy::DummyGcs;
pub use error::{Error, Result};
pub use hub::{GcsHub, HubGcs};

use std::time::Instant;

use bytes::Bytes;

use quartzite_cache::BufferRef;
use quartzite_types::{GlobalSeqno, Gtid, LocalSeqno};

/// Largest replicable action payload.
pub const MAX_ACTION_SIZE: usize = 0x7fff_ffff;

/// A sender's reserved place in the outbound FIFO; cancel with
/// [`Gcs::interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(pub i64);

/// Result of replicating a write-set: the assigned seqnos and the cached
/// copy of the action bytes.
#[derive(Debug, Clone)]
pub struct Replicated {
    pub seqno_g: GlobalSeqno,
    pub seqno_l: LocalSeqno,
    pub buf: BufferRef,
}

/// Group communication backends. Closed set by design: virtual dispatch
/// collapses to a tagged union.
pub enum Gcs {
    Dummy(DummyGcs),
    Hub(HubGcs),
}

impl Gcs {
    /// Backend-specific access for test orchestration.
    pub fn as_dummy(&self) -> Option<&DummyGcs> {
        match self {
            Gcs::Dummy(g) => Some(g),
            Gcs::Hub(_) => None,
        }
    }

    pub fn as_hub(&self) -> Option<&HubGcs> {
        match self {
            Gcs::Hub(g) => Some(g),
            Gcs::Dummy(_) => None,
        }
    }

    pub fn node_id(&self) -> quartzite_types::NodeId {
        match self {
            Gcs::Dummy(g) => g.node_id(),
            Gcs::Hub(g) => g.node_id(),
        }
    }

    pub fn set_initial_position(&self, gtid: Gtid) -> Result<()> {
        match self {
            Gcs::Dummy(g) => g.set_initial_position(gtid),
            Gcs::Hub(g) => g.set_initial_position(gtid),
        }
    }

    pub fn connect(&self, cluster_name: &str, cluster_url: &str, bootstrap: bool) -> Result<()> {
        match self {
            Gcs::Dummy(g) => g.connect(cluster_name, cluster_url, bootstrap),
            Gcs::Hub(g) => g.connect(cluster_name, cluster_url, bootstrap),
        }
    }

    pub fn close(&self) {
        match self {
            Gcs::Dummy(g) => g.close(),
            Gcs::Hub(g) => g.close(),
        }
    }

    /// Blocks for the next ordered action.
    pub fn recv(&self) -> Result<Action> {
        match self {
            Gcs::Dummy(g) => g.recv(),
            Gcs::Hub(g) => g.recv(),
        }
    }

    /// Replicates a write-set, blocking until it is ordered.
    pub fn repl(&self, payload: Bytes, handle: Option<ScheduleHandle>) -> Result<Replicated> {
        match self {
            Gcs::Dummy(g) => g.repl(payload, handle),
            Gcs::Hub(g) => g.repl(payload, handle),
        }
    }

    /// Grab-mode replication for rollback fragments: bypasses flow control
    /// so the sender cannot deadlock while holding commit resources.
    pub fn repl_grab(&self, payload: Bytes) -> Result<Replicated> {
        match self {
            Gcs::Dummy(g) => g.repl(payload, None),
            Gcs::Hub(g) => g.repl_grab(payload),
        }
    }

    pub fn schedule(&self) -> Result<ScheduleHandle> {
        match self {
            Gcs::Dummy(g) => g.schedule(),
            Gcs::Hub(g) => g.schedule(),
        }
    }

    /// Cancels a scheduled sender; it unblocks with [`Error::Interrupted`].
    pub fn interrupt(&self, handle: ScheduleHandle) -> Result<()> {
        match self {
            Gcs::Dummy(g) => g.interrupt(handle),
            Gcs::Hub(g) => g.interrupt(handle),
        }
    }

    pub fn pause_recv(&self) {
        match self {
            Gcs::Dummy(g) => g.pause_recv(),
            Gcs::Hub(g) => g.pause_recv(),
        }
    }

    pub fn resume_recv(&self) -> Result<()> {
        match self {
            Gcs::Dummy(g) => g.resume_recv(),
            Gcs::Hub(g) => g.resume_recv(),
        }
    }

    pub fn request_state_transfer(
        &self,
        req: Bytes,
        donor: &str,
        ist_gtid: Gtid,
    ) -> Result<GlobalSeqno> {
        match self {
            Gcs::Dummy(g) => g.request_state_transfer(req, donor, ist_gtid),
            Gcs::Hub(g) => g.request_state_transfer(req, donor, ist_gtid),
        }
    }

    pub fn desync(&self) -> Result<LocalSeqno> {
        match self {
            Gcs::Dummy(g) => g.desync(),
            Gcs::Hub(g) => g.desync(),
        }
    }

    pub fn join(&self, gtid: Gtid, code: i64) -> Result<()> {
        match self {
            Gcs::Dummy(g) => g.join(gtid, code),
            Gcs::Hub(g) => g.join(gtid, code),
        }
    }

    pub fn local_sequence(&self) -> LocalSeqno {
        match self {
            Gcs::Dummy(g) => g.local_sequence(),
            Gcs::Hub(g) => g.local_sequence(),
        }
    }

    /// Reports the last locally committed position; the backend coalesces
    /// repeated reports into group commit cuts.
    pub fn set_last_applied(&self, gtid: Gtid) -> Result<()> {
        match self {
            Gcs::Dummy(g) => g.set_last_applied(gtid),
            Gcs::Hub(g) => g.set_last_applied(gtid),
        }
    }

    /// Votes on the outcome of the action at `gtid`. Returns 0 when the
    /// group agrees with this node's verdict, 1 when it disagrees.
    pub fn vote(&self, gtid: Gtid, code: i64, data: &[u8]) -> Result<i64> {
        match self {
            Gcs::Dummy(g) => g.vote(gtid, code, data),
            Gcs::Hub(g) => g.vote(gtid, code, data),
        }
    }

    /// Last globally stable position for causal read barriers.
    pub fn caused(&self, deadline: Instant) -> Result<Gtid> {
        match self {
            Gcs::Dummy(g) => g.caused(deadline),
            Gcs::Hub(g) => g.caused(deadline),
        }
    }

    pub fn max_action_size(&self) -> usize {
        match self {
            Gcs::Dummy(g) => g.max_action_size(),
            Gcs::Hub(g) => g.max_action_size(),
        }
    }
}
