//! Durable-state interface and the in-memory reference implementation.
//!
//! The replica core never touches storage itself: it emits deltas through
//! `Ready` and the driver pushes them into a `Storage` implementation
//! before transmitting any messages (a peer may act on a message assuming
//! the sender's state survives a crash).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instance::InstanceState;
use crate::message::{InstanceNum, ReplicaId, SeqNum};
use crate::utils::EpoxideError;

/// The opaque always-persisted portion of replica state: truncation marks.
/// Everything else durable is per-instance records.
#[derive(Debug, PartialEq, Eq, Default, Clone, Serialize, Deserialize)]
pub struct HardState {
    /// Largest truncated instance number per replica space.
    pub max_truncated_instance_nums: BTreeMap<ReplicaId, InstanceNum>,

    /// Largest sequence number ever truncated.
    pub max_truncated_seq_num: SeqNum,
}

/// Persistence of EPaxos state for durability. Instance records are stored
/// under the composite key `(ReplicaID, InstanceNum)`; persisting a record
/// overwrites any previous one for the same slot.
pub trait Storage: Send {
    /// Loads the hard state, or `None` if never persisted.
    fn hard_state(&self) -> Result<Option<HardState>, EpoxideError>;

    /// Durably replaces the hard state.
    fn persist_hard_state(&mut self, hs: &HardState)
        -> Result<(), EpoxideError>;

    /// Loads all persisted instance records, ordered by composite key.
    fn instances(&self) -> Result<Vec<InstanceState>, EpoxideError>;

    /// Durably inserts or replaces one instance record.
    fn persist_instance(
        &mut self,
        state: &InstanceState,
    ) -> Result<(), EpoxideError>;
}

/// `Storage` implementation backed by in-memory ordered maps. Useful as the
/// reference implementation and for tests; provides no actual durability.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    hard_state: Option<HardState>,
    instances: BTreeMap<ReplicaId, BTreeMap<InstanceNum, InstanceState>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory storage.
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn hard_state(&self) -> Result<Option<HardState>, EpoxideError> {
        Ok(self.hard_state.clone())
    }

    fn persist_hard_state(
        &mut self,
        hs: &HardState,
    ) -> Result<(), EpoxideError> {
        self.hard_state = Some(hs.clone());
        Ok(())
    }

    fn instances(&self) -> Result<Vec<InstanceState>, EpoxideError> {
        Ok(self
            .instances
            .values()
            .flat_map(|tree| tree.values().cloned())
            .collect())
    }

    fn persist_instance(
        &mut self,
        state: &InstanceState,
    ) -> Result<(), EpoxideError> {
        let iid = state.instance_id;
        self.instances
            .entry(iid.replica_id)
            .or_default()
            .insert(iid.instance_num, state.clone());
        Ok(())
    }
}
