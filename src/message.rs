//! Peer-peer protocol messages and the identifiers they carry.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::utils::EpoxideError;

/// Replica ID in the cluster.
pub type ReplicaId = u64;

/// Number of an instance slot within a replica's command space. Dense and
/// monotonically increasing, starting at 1; a replica allocates numbers only
/// in its own space.
pub type InstanceNum = u64;

/// Sequence number of an instance, used to break ties when executing
/// strongly connected command components. Essentially a Lamport logical
/// clock.
pub type SeqNum = u64;

/// Globally unique identifier of a protocol instance slot.
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
pub struct InstanceId {
    /// Replica that owns the instance's command space.
    pub replica_id: ReplicaId,

    /// Slot number within that space.
    pub instance_num: InstanceNum,
}

impl InstanceId {
    /// Creates an instance ID from its parts.
    pub fn new(replica_id: ReplicaId, instance_num: InstanceNum) -> Self {
        InstanceId {
            replica_id,
            instance_num,
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.replica_id, self.instance_num)
    }
}

/// Dependency set of an instance: the instances it must be ordered after.
/// Kept sorted so that wire encoding and iteration are deterministic.
pub type Deps = BTreeSet<InstanceId>;

/// Tagged union of peer-peer message bodies. `Accept` omits the command
/// (peers already saw it in `PreAccept`) and the OK variants carry nothing.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    /// PreAccept from command leader to all other replicas.
    PreAccept {
        command: Command,
        seq_num: SeqNum,
        deps: Deps,
    },

    /// PreAccept reply agreeing with the leader's proposal as-is.
    PreAcceptOk,

    /// PreAccept reply carrying updated information the leader lacked.
    PreAcceptReply {
        updated_seq_num: SeqNum,
        updated_deps: Deps,
    },

    /// Slow-path Accept from command leader to all other replicas.
    Accept { seq_num: SeqNum, deps: Deps },

    /// Accept confirmation from replica to command leader.
    AcceptOk,

    /// Commit notification from command leader to all other replicas.
    Commit {
        command: Command,
        seq_num: SeqNum,
        deps: Deps,
    },
}

impl PeerMsg {
    /// Returns whether this body is a reply flowing back to the command
    /// leader (as opposed to a leader-originated broadcast).
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            PeerMsg::PreAcceptOk
                | PeerMsg::PreAcceptReply { .. }
                | PeerMsg::AcceptOk
        )
    }
}

impl fmt::Display for PeerMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerMsg::PreAccept { .. } => write!(f, "PreAccept"),
            PeerMsg::PreAcceptOk => write!(f, "PreAcceptOk"),
            PeerMsg::PreAcceptReply { .. } => write!(f, "PreAcceptReply"),
            PeerMsg::Accept { .. } => write!(f, "Accept"),
            PeerMsg::AcceptOk => write!(f, "AcceptOk"),
            PeerMsg::Commit { .. } => write!(f, "Commit"),
        }
    }
}

/// Envelope shared by all peer-peer messages.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Destination replica.
    pub to: ReplicaId,

    /// Instance slot this message is about.
    pub instance_id: InstanceId,

    /// Message body.
    pub body: PeerMsg,
}

impl Message {
    /// Serializes the message for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, EpoxideError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserializes a message from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Message, EpoxideError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
