//! # quartzite-replicator: The synchronous multi-master replication core
//!
//! Turns a totally ordered group-communication stream into a serializable,
//! conflict-resolved sequence of committed write-sets:
//!
//! - optimistic execution with certification-based conflict detection
//!   against a sliding window of applied write-sets,
//! - strict commit ordering through three monitors
//!   (certification → apply → commit),
//! - cooperative BF-abort semantics: a higher-priority remote transaction
//!   may preempt a local one anywhere in the pipeline,
//! - online recovery of lagging members through state snapshots plus
//!   incremental write-set replay.
//!
//! Entry point: [`Replicator`]. The embedding database engine supplies
//! [`ApplicationCallbacks`] and drives local transactions through
//! `replicate` → `certify` → `commit_order_enter_local` →
//! `commit_order_leave` → `release_commit`, while applier threads run
//! [`Replicator::async_recv`].

pub mod callbacks;
pub mod error;
pub mod orders;
pub mod params;
pub mod replicator;
pub mod state_file;
pub mod state_machine;
pub mod trx;
pub mod writeset;

pub use callbacks::{ApplicationCallbacks, ApplyError, ApplyEvent, CbResult};
pub use error::{Error, Result, Status};
pub use orders::CommitOrderMode;
pub use params::keys;
pub use replicator::{Replicator, Stats};
pub use state_file::{SavedState, STATE_FILE_NAME};
pub use state_machine::NodeState;
pub use trx::{TrxMaster, TrxMasterPtr, TrxSlave, TrxSlavePtr, TrxState};
pub use writeset::{WriteSet, WsKey};

#[cfg(test)]
mod tests;
