//! Node lifecycle state machine.
//!
//! ```text
//! CLOSED -> CONNECTED -> JOINING -> JOINED -> SYNCED
//!              |            ^________/  ^       |
//!              |                        |       v
//!              +----------------------- + <-- DONOR
//! ```
//!
//! Any state may fall back to CONNECTED on a non-primary view and to CLOSED
//! on self-leave. DONOR -> JOINED marks the end of a snapshot donation.

use std::fmt;

use parking_lot::Mutex;
use tracing::info;

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Destroyed,
    Closed,
    Connected,
    Joining,
    Joined,
    Synced,
    Donor,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Destroyed => "DESTROYED",
            NodeState::Closed => "CLOSED",
            NodeState::Connected => "CONNECTED",
            NodeState::Joining => "JOINING",
            NodeState::Joined => "JOINED",
            NodeState::Synced => "SYNCED",
            NodeState::Donor => "DONOR",
        };
        f.write_str(s)
    }
}

fn edge_allowed(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Closed, Destroyed)
            | (Closed, Connected)
            | (Connected, Closed)
            | (Connected, Connected)
            | (Connected, Joining)
            // trivial state transfer
            | (Connected, Joined)
            | (Connected, Donor)
            | (Joining, Closed)
            | (Joining, Connected)
            | (Joining, Joined)
            | (Joined, Closed)
            | (Joined, Connected)
            | (Joined, Synced)
            | (Synced, Closed)
            | (Synced, Connected)
            | (Synced, Joined)
            | (Synced, Donor)
            | (Donor, Closed)
            | (Donor, Connected)
            // end of snapshot donation
            | (Donor, Joined)
    )
}

/// Guarded state holder; invalid transitions are programming errors and
/// abort the node.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<NodeState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState::Closed),
        }
    }

    pub fn get(&self) -> NodeState {
        *self.state.lock()
    }

    /// Shifts to `next`; panics on an illegal edge. Same-state shifts are
    /// no-ops.
    pub fn shift_to(&self, next: NodeState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        assert!(
            edge_allowed(*state, next),
            "illegal node state transition {} -> {next}",
            *state,
        );
        info!(from = %*state, to = %next, "node state");
        *state = next;
    }

    /// Shifts only if the edge is legal; returns whether it happened.
    pub fn try_shift_to(&self, next: NodeState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return true;
        }
        if !edge_allowed(*state, next) {
            return false;
        }
        info!(from = %*state, to = %next, "node state");
        *state = next;
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(NodeState::Closed, NodeState::Connected, true)]
    #[test_case(NodeState::Connected, NodeState::Joining, true)]
    #[test_case(NodeState::Joining, NodeState::Joined, true)]
    #[test_case(NodeState::Joined, NodeState::Synced, true)]
    #[test_case(NodeState::Synced, NodeState::Donor, true)]
    #[test_case(NodeState::Donor, NodeState::Joined, true; "end of donation")]
    #[test_case(NodeState::Joining, NodeState::Synced, false; "joining cannot sync directly")]
    #[test_case(NodeState::Closed, NodeState::Synced, false)]
    #[test_case(NodeState::Destroyed, NodeState::Closed, false)]
    fn edges(from: NodeState, to: NodeState, allowed: bool) {
        assert_eq!(edge_allowed(from, to), allowed);
    }

    #[test]
    fn lifecycle_walk() {
        let sm = StateMachine::new();
        assert_eq!(sm.get(), NodeState::Closed);
        sm.shift_to(NodeState::Connected);
        sm.shift_to(NodeState::Joining);
        sm.shift_to(NodeState::Joined);
        sm.shift_to(NodeState::Synced);
        sm.shift_to(NodeState::Donor);
        sm.shift_to(NodeState::Joined);
        sm.shift_to(NodeState::Connected);
        sm.shift_to(NodeState::Closed);
    }

    #[test]
    #[should_panic(expected = "illegal node state transition")]
    fn illegal_edge_panics() {
        let sm = StateMachine::new();
        sm.shift_to(NodeState::Synced);
    }
}
