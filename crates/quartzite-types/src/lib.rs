//! # quartzite-types: Core types for Quartzite
//!
//! This crate contains the shared vocabulary of the replication engine:
//! - Sequence numbers ([`GlobalSeqno`], [`LocalSeqno`])
//! - Group identity ([`GroupId`], [`NodeId`], [`Gtid`])
//! - Cluster views ([`View`], [`Member`], [`MemberState`], [`ViewStatus`])
//! - Provider capabilities ([`Capabilities`])
//! - Write-set flags ([`WsFlags`])
//!
//! A global seqno is assigned by group communication in total order across
//! the cluster; a local seqno is monotonic per delivering node. Both reserve
//! `-1` as the undefined value.

use std::fmt::{self, Display};
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Sequence numbers
// ============================================================================

/// Cluster-wide monotonic sequence number assigned in total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalSeqno(i64);

impl GlobalSeqno {
    /// Reserved "no seqno" value.
    pub const UNDEFINED: GlobalSeqno = GlobalSeqno(-1);

    pub const fn new(s: i64) -> Self {
        Self(s)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_undefined(self) -> bool {
        self.0 < 0
    }

    /// The next seqno in total order.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The preceding seqno, saturating at [`GlobalSeqno::UNDEFINED`].
    pub const fn prev(self) -> Self {
        if self.0 <= 0 { Self::UNDEFINED } else { Self(self.0 - 1) }
    }
}

impl Display for GlobalSeqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GlobalSeqno {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<GlobalSeqno> for i64 {
    fn from(s: GlobalSeqno) -> Self {
        s.0
    }
}

impl Add<i64> for GlobalSeqno {
    type Output = GlobalSeqno;

    fn add(self, rhs: i64) -> GlobalSeqno {
        GlobalSeqno(self.0 + rhs)
    }
}

impl Sub<i64> for GlobalSeqno {
    type Output = GlobalSeqno;

    fn sub(self, rhs: i64) -> GlobalSeqno {
        GlobalSeqno(self.0 - rhs)
    }
}

/// Per-node monotonic delivery sequence number.
///
/// Every action received from group communication carries a unique local
/// seqno, including actions with no global ordering (state requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalSeqno(i64);

impl LocalSeqno {
    /// Reserved "no seqno" value.
    pub const UNDEFINED: LocalSeqno = LocalSeqno(-1);

    pub const fn new(s: i64) -> Self {
        Self(s)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_undefined(self) -> bool {
        self.0 < 0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for LocalSeqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LocalSeqno {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<LocalSeqno> for i64 {
    fn from(s: LocalSeqno) -> Self {
        s.0
    }
}

// ============================================================================
// Group identity
// ============================================================================

/// Identifier of the current cluster incarnation.
///
/// Changes on non-primary/primary transitions; two nodes share history iff
/// their group ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct GroupId(Uuid);

impl GroupId {
    /// The nil group id, used before the first primary view.
    pub const NIL: GroupId = GroupId(Uuid::nil());

    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a fresh random group id (new cluster incarnation).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    pub const fn uuid(self) -> Uuid {
        self.0
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cluster member node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const NIL: NodeId = NodeId(Uuid::nil());

    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn is_nil(self) -> bool {
        self.0.is_nil()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group transaction id: a position in a particular cluster history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub group: GroupId,
    pub seqno: GlobalSeqno,
}

impl Gtid {
    /// Undefined position: nil group, undefined seqno.
    pub const UNDEFINED: Gtid = Gtid {
        group: GroupId::NIL,
        seqno: GlobalSeqno::UNDEFINED,
    };

    pub const fn new(group: GroupId, seqno: GlobalSeqno) -> Self {
        Self { group, seqno }
    }

    pub const fn is_undefined(&self) -> bool {
        self.group.is_nil() && self.seqno.is_undefined()
    }

    /// True if `other` belongs to the same cluster history.
    pub fn same_history(&self, other: &Gtid) -> bool {
        self.group == other.group
    }
}

impl Default for Gtid {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.seqno)
    }
}

// ============================================================================
// Transaction identity
// ============================================================================

/// Client-assigned transaction id, unique within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrxId(u64);

impl TrxId {
    pub const UNDEFINED: TrxId = TrxId(u64::MAX);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_undefined(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Print as signed for readability of the undefined value.
        write!(f, "{}", self.0 as i64)
    }
}

/// Client connection id on the source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(u64);

impl ConnId {
    pub const UNDEFINED: ConnId = ConnId(u64::MAX);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 as i64)
    }
}

// ============================================================================
// Views
// ============================================================================

/// Group-level state of one member as advertised in a configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberState {
    /// Not part of a primary component.
    NonPrimary,
    /// In primary component, state transfer undecided.
    Primary,
    /// Receiving a state transfer.
    Joiner,
    /// State transfer complete, catching up.
    Joined,
    /// Fully caught up with the group.
    Synced,
    /// Serving a state transfer to a joiner.
    Donor,
}

impl Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::NonPrimary => "non-primary",
            MemberState::Primary => "primary",
            MemberState::Joiner => "joiner",
            MemberState::Joined => "joined",
            MemberState::Synced => "synced",
            MemberState::Donor => "donor",
        };
        f.write_str(s)
    }
}

/// One row of a view's membership list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
    /// Client-facing address advertised by the node.
    pub incoming: String,
    pub state: MemberState,
}

/// Whether a view represents a primary component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewStatus {
    Primary,
    NonPrimary,
}

/// Provider capability bits advertised to the application with each view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const MULTI_MASTER: u32 = 1 << 0;
    pub const CERTIFICATION: u32 = 1 << 1;
    pub const PARALLEL_APPLYING: u32 = 1 << 2;
    pub const TRX_REPLAY: u32 = 1 << 3;
    pub const ISOLATION: u32 = 1 << 4;
    pub const PAUSE: u32 = 1 << 5;
    pub const CAUSAL_READS: u32 = 1 << 6;
    pub const INCREMENTAL_WRITESET: u32 = 1 << 7;
    pub const NBO: u32 = 1 << 8;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// A primary (or non-primary) component of the cluster at a moment in time.
///
/// `view_id` is monotone while the component stays primary; `state_id` is the
/// group position at which the view was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Configuration id; negative for non-primary views.
    pub view_id: i64,
    pub status: ViewStatus,
    pub capabilities: Capabilities,
    pub members: Vec<Member>,
    /// This node's index in `members`, if present.
    pub my_index: Option<usize>,
    /// Group position at view delivery.
    pub state_id: Gtid,
    /// Replication protocol version negotiated for this view.
    pub proto_ver: i32,
}

impl View {
    /// An empty non-primary "zero view" surfaced on fatal exit paths.
    pub fn zero(group: GroupId) -> Self {
        Self {
            view_id: -1,
            status: ViewStatus::NonPrimary,
            capabilities: Capabilities::default(),
            members: Vec::new(),
            my_index: None,
            state_id: Gtid::new(group, GlobalSeqno::UNDEFINED),
            proto_ver: -1,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.status == ViewStatus::Primary
    }

    /// Self-leave: negative conf id with an empty membership.
    pub fn is_self_leave(&self) -> bool {
        self.view_id < 0 && self.members.is_empty()
    }
}

// ============================================================================
// Write-set flags
// ============================================================================

/// Flags carried by a replicated write-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WsFlags(u32);

impl WsFlags {
    /// First fragment of a transaction.
    pub const BEGIN: u32 = 1 << 0;
    /// Final fragment; commit on successful certification.
    pub const COMMIT: u32 = 1 << 1;
    /// Explicit rollback fragment of a streaming transaction.
    pub const ROLLBACK: u32 = 1 << 2;
    /// Total-order isolated action.
    pub const ISOLATION: u32 = 1 << 3;
    /// Must not be applied in parallel with any predecessor.
    pub const PA_UNSAFE: u32 = 1 << 4;
    /// Externally ordered write-set injected through the preordered path.
    pub const PREORDERED: u32 = 1 << 5;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub const fn is_commit(self) -> bool {
        self.has(Self::COMMIT)
    }

    pub const fn is_rollback(self) -> bool {
        self.has(Self::ROLLBACK)
    }

    pub const fn is_pa_unsafe(self) -> bool {
        self.has(Self::PA_UNSAFE)
    }

    pub const fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }
}

impl Display for WsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_undefined_and_next() {
        assert!(GlobalSeqno::UNDEFINED.is_undefined());
        assert_eq!(GlobalSeqno::UNDEFINED.next(), GlobalSeqno::new(0));
        assert_eq!(GlobalSeqno::new(41).next(), GlobalSeqno::new(42));
        assert_eq!(GlobalSeqno::new(0).prev(), GlobalSeqno::UNDEFINED);
        assert_eq!(GlobalSeqno::new(2).prev(), GlobalSeqno::new(1));
    }

    #[test]
    fn seqno_ordering() {
        assert!(GlobalSeqno::UNDEFINED < GlobalSeqno::new(0));
        assert!(GlobalSeqno::new(5) < GlobalSeqno::new(6));
        assert!(LocalSeqno::new(1) < LocalSeqno::new(2));
    }

    #[test]
    fn gtid_same_history() {
        let g = GroupId::random();
        let a = Gtid::new(g, GlobalSeqno::new(1));
        let b = Gtid::new(g, GlobalSeqno::new(7));
        let c = Gtid::new(GroupId::random(), GlobalSeqno::new(7));

        assert!(a.same_history(&b));
        assert!(!a.same_history(&c));
        assert!(Gtid::UNDEFINED.is_undefined());
        assert!(!a.is_undefined());
    }

    #[test]
    fn flags_accessors() {
        let f = WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT);
        assert!(f.has(WsFlags::BEGIN));
        assert!(f.is_commit());
        assert!(!f.is_rollback());
        assert!(f.with(WsFlags::PA_UNSAFE).is_pa_unsafe());
    }

    #[test]
    fn zero_view_is_self_leave_shape() {
        let v = View::zero(GroupId::NIL);
        assert!(!v.is_primary());
        assert!(v.is_self_leave());
        assert_eq!(v.my_index, None);
    }

    #[test]
    fn capabilities_bits() {
        let caps = Capabilities::new(
            Capabilities::MULTI_MASTER | Capabilities::CERTIFICATION | Capabilities::TRX_REPLAY,
        );
        assert!(caps.has(Capabilities::CERTIFICATION));
        assert!(!caps.has(Capabilities::NBO));
    }
}
