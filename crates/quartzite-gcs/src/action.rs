//! Ordered actions delivered by group communication.
//!
//! Every received action carries a unique local seqno; totally ordered
//! actions (write-sets, ordered configuration changes) additionally carry a
//! global seqno. Write-set and configuration-change payloads live in the
//! node's write-set cache so they can be replayed over IST later.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use quartzite_cache::BufferRef;
use quartzite_types::{
    Capabilities, GlobalSeqno, GroupId, Gtid, LocalSeqno, Member, MemberState, View, ViewStatus,
};

use crate::error::{Error, Result};

// ============================================================================
// Configuration change payload
// ============================================================================

/// One member row of a configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfMember {
    pub id: quartzite_types::NodeId,
    pub name: String,
    pub incoming: String,
    pub state: MemberState,
}

/// A configuration change as agreed by the group.
///
/// `conf_id < 0` denotes a non-primary configuration. `seqno` is the group
/// position at the change. Whether the change itself consumed that seqno
/// (an *ordered* change) is carried by the delivering action's global
/// seqno, not by this payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub conf_id: i64,
    pub seqno: GlobalSeqno,
    pub group: GroupId,
    pub members: Vec<ConfMember>,
    pub repl_proto_ver: i32,
    pub appl_proto_ver: i32,
}

impl ConfChange {
    pub fn is_primary(&self) -> bool {
        self.conf_id >= 0
    }

    /// Self-leave: negative conf id with an empty membership.
    pub fn is_self_leave(&self) -> bool {
        self.conf_id < 0 && self.members.is_empty()
    }

    /// Canonical byte encoding, stable across nodes.
    pub fn encode(&self) -> Bytes {
        Bytes::from(postcard::to_allocvec(self).expect("conf change serialization cannot fail"))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| Error::Malformed(e.to_string()))
    }

    /// Builds the application-facing view for the node at `my_index`.
    pub fn to_view(&self, my_index: Option<usize>, capabilities: Capabilities) -> View {
        View {
            view_id: self.conf_id,
            status: if self.is_primary() {
                ViewStatus::Primary
            } else {
                ViewStatus::NonPrimary
            },
            capabilities,
            members: self
                .members
                .iter()
                .map(|m| Member {
                    id: m.id,
                    name: m.name.clone(),
                    incoming: m.incoming.clone(),
                    state: m.state,
                })
                .collect(),
            my_index,
            state_id: Gtid::new(self.group, self.seqno),
            proto_ver: self.repl_proto_ver,
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Typed payload of a delivered action.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A replicated write-set; bytes live in the cache.
    WriteSet(BufferRef),
    /// Group-wide commit cut: everything at or below is committed
    /// everywhere.
    CommitCut(GlobalSeqno),
    /// Configuration change. The raw buffer is kept so ordered changes can
    /// be assigned into the cache at their seqno.
    ConfChange {
        conf: ConfChange,
        my_index: Option<usize>,
        buf: BufferRef,
    },
    /// A joiner's state transfer request routed to this node (donor).
    StateRequest(Bytes),
    /// Join status: negative code means the state transfer failed.
    Join(i64),
    /// The node has caught up with the group.
    Sync,
    /// Consensus vote on the outcome of an action.
    Vote { gtid: Gtid, code: i64 },
    /// The backend detected local inconsistency; fatal.
    Inconsistency,
}

/// One ordered delivery from group communication.
#[derive(Debug, Clone)]
pub struct Action {
    pub seqno_g: GlobalSeqno,
    pub seqno_l: LocalSeqno,
    pub payload: Payload,
}

impl Action {
    pub fn kind_name(&self) -> &'static str {
        match self.payload {
            Payload::WriteSet(_) => "WRITESET",
            Payload::CommitCut(_) => "COMMIT_CUT",
            Payload::ConfChange { .. } => "CONF_CHANGE",
            Payload::StateRequest(_) => "STATE_REQUEST",
            Payload::Join(_) => "JOIN",
            Payload::Sync => "SYNC",
            Payload::Vote { .. } => "VOTE",
            Payload::Inconsistency => "INCONSISTENCY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartzite_types::NodeId;

    #[test]
    fn conf_change_round_trip() {
        let cc = ConfChange {
            conf_id: 3,
            seqno: GlobalSeqno::new(42),
            group: GroupId::random(),
            members: vec![ConfMember {
                id: NodeId::random(),
                name: "node-1".to_string(),
                incoming: "10.0.0.1:3306".to_string(),
                state: MemberState::Synced,
            }],
            repl_proto_ver: 10,
            appl_proto_ver: 1,
        };

        let decoded = ConfChange::decode(&cc.encode()).unwrap();
        assert_eq!(decoded, cc);
        assert!(decoded.is_primary());
    }

    #[test]
    fn view_projection() {
        let cc = ConfChange {
            conf_id: -1,
            seqno: GlobalSeqno::UNDEFINED,
            group: GroupId::NIL,
            members: Vec::new(),
            repl_proto_ver: 9,
            appl_proto_ver: 1,
        };
        let view = cc.to_view(None, Capabilities::default());
        assert!(!view.is_primary());
        assert!(view.is_self_leave());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ConfChange::decode(b"\xff\xff\xff").is_err());
    }
}
