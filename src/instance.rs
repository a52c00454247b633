//! Per-instance protocol state.

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::message::{Deps, InstanceId, SeqNum};
use crate::utils::TickingTimer;

/// Protocol status of an instance. Statuses only ever advance:
/// `Null -> PreAccepted -> {Accepted, Committed}`, `Accepted -> Committed`,
/// `Committed -> Executed`.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub enum Status {
    Null = 0,
    PreAccepted = 1,
    Accepted = 2,
    Committed = 3,
    Executed = 4,
}

/// The durable tuple of an instance: everything that must survive a restart.
/// In-memory bookkeeping (reply counts, timers) is deliberately not part of
/// this record.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    /// Identity of the instance slot.
    pub instance_id: InstanceId,

    /// Command under consensus; `None` until the slot first learns it.
    pub command: Option<Command>,

    /// Sequence number for SCC tie-breaking.
    pub seq_num: SeqNum,

    /// Instances this one must be ordered after.
    pub deps: Deps,

    /// Protocol status.
    pub status: Status,
}

impl InstanceState {
    /// Creates the empty state for a freshly referenced slot.
    pub fn new(instance_id: InstanceId) -> Self {
        InstanceState {
            instance_id,
            command: None,
            seq_num: 0,
            deps: Deps::new(),
            status: Status::Null,
        }
    }
}

/// In-memory instance: the durable tuple plus command-leader bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Instance {
    /// Durable instance tuple.
    pub(crate) state: InstanceState,

    /// Number of PreAccept replies (OK or not) received as command leader.
    pub(crate) pre_accept_replies: usize,

    /// Whether any PreAccept reply diverged from the original proposal,
    /// which permanently forfeits the fast path.
    pub(crate) different_replies: bool,

    /// Number of AcceptOk replies received as command leader.
    pub(crate) accept_replies: usize,

    /// One-shot logical timer delaying the slow path while the fast-path
    /// quorum may still complete.
    pub(crate) slow_path_timer: TickingTimer,
}

impl Instance {
    /// Creates an empty instance for the given slot.
    pub(crate) fn new(
        instance_id: InstanceId,
        slow_path_timeout: u32,
    ) -> Self {
        Instance {
            state: InstanceState::new(instance_id),
            pre_accept_replies: 0,
            different_replies: false,
            accept_replies: 0,
            slow_path_timer: TickingTimer::new(slow_path_timeout),
        }
    }

    /// Rebuilds an instance from a persisted state record. Leader
    /// bookkeeping does not survive restarts; an in-flight PreAccept or
    /// Accept round is simply abandoned.
    pub(crate) fn from_state(
        state: InstanceState,
        slow_path_timeout: u32,
    ) -> Self {
        Instance {
            state,
            pre_accept_replies: 0,
            different_replies: false,
            accept_replies: 0,
            slow_path_timer: TickingTimer::new(slow_path_timeout),
        }
    }

    /// Returns whether the instance is currently in one of the given
    /// statuses.
    pub(crate) fn in_status(&self, statuses: &[Status]) -> bool {
        statuses.contains(&self.state.status)
    }
}
