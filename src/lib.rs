//! epoxide: a deterministic, leaderless Egalitarian-Paxos replication core.
//!
//! The heart of the crate is [`Replica`], a single-owner state machine with
//! four inputs (`tick`, `propose`, `step`, `drain`) and no I/O of its own:
//! any replica can lead the commands it receives, non-interfering commands
//! commit in a single wide-area round trip, and committed commands execute
//! in an order every replica derives identically. [`Node`] wraps a replica
//! behind channels for use from async code, persisting durable deltas into
//! a [`Storage`] before handing out messages.
//!
//! Reference: <https://www.cs.cmu.edu/~dga/papers/epaxos-sosp2013.pdf>

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod command;
mod dependency;
mod execute;
mod instance;
mod message;
mod messages;
mod node;
mod rangegroup;
mod replica;
mod request;
mod statemach;
mod storage;

#[cfg(test)]
mod testutil;

pub use command::{Command, CommandId, Key, Span};
pub use instance::{InstanceState, Status};
pub use message::{
    Deps, InstanceId, InstanceNum, Message, PeerMsg, ReplicaId, SeqNum,
};
pub use node::{Node, NodeTuning};
pub use replica::{Config, Ready, Replica};
pub use statemach::StateMachine;
pub use storage::{HardState, MemoryStorage, Storage};
pub use utils::{EpoxideError, TickingTimer};
