//! The single-owner EPaxos replica state machine.
//!
//! A `Replica` is a pure state machine driven by exactly one caller: it
//! consumes ticks, client proposals, and inbound protocol messages, and it
//! buffers outbound messages, executed commands, and durable-state deltas
//! until the caller drains them. It performs no I/O and never blocks, which
//! makes a whole cluster of replicas simulatable in a single thread.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::command::{Command, CommandId};
use crate::instance::{Instance, InstanceState, Status};
use crate::message::{
    InstanceId, InstanceNum, Message, PeerMsg, ReplicaId, SeqNum,
};
use crate::rangegroup::RangeGroup;
use crate::storage::HardState;
use crate::utils::EpoxideError;

/// Configuration parameters for a replica.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of the local replica.
    pub id: ReplicaId,

    /// The set of all replicas in the cluster, including the local one.
    /// Fixed at startup and identical on every replica.
    pub nodes: Vec<ReplicaId>,

    /// Ticks to wait for a fast-path quorum to complete before forcing the
    /// slow path on a majority-but-not-fast-quorum instance.
    pub slow_path_timeout: u32,

    /// Seed for the replica-local pseudo-random source, to allow for fully
    /// deterministic execution. 0 means seed from OS entropy.
    pub rand_seed: u64,
}

impl Config {
    /// Creates a config with default tuning for the given membership.
    pub fn new(id: ReplicaId, nodes: Vec<ReplicaId>) -> Self {
        Config {
            id,
            nodes,
            slow_path_timeout: 2,
            rand_seed: 0,
        }
    }

    /// Checks the config for internal consistency.
    pub(crate) fn validate(&self) -> Result<(), EpoxideError> {
        if self.nodes.is_empty() {
            return logged_err!("config has empty nodes list");
        }
        if !self.nodes.contains(&self.id) {
            return logged_err!("id {} not in nodes list", self.id);
        }
        let uniques: BTreeSet<ReplicaId> =
            self.nodes.iter().copied().collect();
        if uniques.len() != self.nodes.len() {
            return logged_err!("duplicate replica in nodes list");
        }
        if self.slow_path_timeout == 0 {
            return logged_err!(
                "invalid config.slow_path_timeout '{}'",
                self.slow_path_timeout
            );
        }
        Ok(())
    }
}

/// Point-in-time outputs of the state machine, drained by the driver after
/// each quiescent point.
///
/// The driver must persist `updated_instances` and `hard_state` before
/// transmitting `messages`; a message may acknowledge state that has to
/// survive a crash of this replica.
#[derive(Debug, Default, Clone)]
pub struct Ready {
    /// Outbound messages to be sent to peers.
    pub messages: Vec<Message>,

    /// Commands ready to be applied to the application state machine, in
    /// execution order.
    pub executed_commands: Vec<Command>,

    /// Durable instance records mutated since the last drain, in mutation
    /// order (later records supersede earlier ones for the same slot).
    pub updated_instances: Vec<InstanceState>,

    /// New truncation marks, present iff truncation advanced.
    pub hard_state: Option<HardState>,
}

impl Ready {
    /// Returns whether anything needs to be acted upon.
    pub fn contains_updates(&self) -> bool {
        !self.messages.is_empty()
            || !self.executed_commands.is_empty()
            || !self.updated_instances.is_empty()
            || self.hard_state.is_some()
    }
}

/// EPaxos replica state machine.
///
/// Not internally synchronized; exactly one owner may drive it at a time.
pub struct Replica {
    /// Unique identifier of this replica.
    pub(crate) id: ReplicaId,

    /// The set of all replicas in the cluster.
    pub(crate) nodes: Vec<ReplicaId>,

    /// Per-replica command spaces: for each replica, an ordered tree of
    /// instances indexed by instance number.
    pub(crate) commands:
        BTreeMap<ReplicaId, BTreeMap<InstanceNum, Instance>>,

    /// Largest instance number truncated from each replica's tree.
    pub(crate) max_truncated_instance_num: BTreeMap<ReplicaId, InstanceNum>,

    /// Largest sequence number ever truncated.
    pub(crate) max_truncated_seq_num: SeqNum,

    /// Scratch range group used by dependency computation.
    pub(crate) range_group: RangeGroup,

    /// Committed-but-not-yet-executed instances awaiting the execution
    /// engine (its working set of vertices).
    pub(crate) exec_queue: BTreeSet<InstanceId>,

    /// Own-space instances whose slow-path timer is currently armed.
    pub(crate) armed_timers: BTreeSet<InstanceNum>,

    /// Slow-path timer timeout in ticks.
    pub(crate) slow_path_timeout: u32,

    /// Outbox of protocol messages to be delivered to peers.
    pub(crate) msgs: Vec<Message>,

    /// Outbox of commands that are ready to be executed, in order.
    pub(crate) executed_cmds: Vec<Command>,

    /// Durable instance records mutated since the last drain.
    pub(crate) updated_insts: Vec<InstanceState>,

    /// Whether truncation marks changed since the last drain.
    pub(crate) hard_state_dirty: bool,

    /// Replica-local pseudo-random source.
    rng: StdRng,
}

impl Replica {
    /// Creates a fresh replica from the given config.
    pub fn new(config: Config) -> Result<Self, EpoxideError> {
        config.validate()?;

        let mut commands = BTreeMap::new();
        let mut max_truncated_instance_num = BTreeMap::new();
        for &r in &config.nodes {
            commands.insert(r, BTreeMap::new());
            max_truncated_instance_num.insert(r, 0);
        }

        let rng = if config.rand_seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(config.rand_seed)
        };

        Ok(Replica {
            id: config.id,
            nodes: config.nodes,
            commands,
            max_truncated_instance_num,
            max_truncated_seq_num: 0,
            range_group: RangeGroup::new(),
            exec_queue: BTreeSet::new(),
            armed_timers: BTreeSet::new(),
            slow_path_timeout: config.slow_path_timeout,
            msgs: Vec::new(),
            executed_cmds: Vec::new(),
            updated_insts: Vec::new(),
            hard_state_dirty: false,
            rng,
        })
    }

    /// Recreates a replica from persisted state. Records below a replica's
    /// truncation mark are skipped; committed-but-unexecuted instances are
    /// re-enqueued for execution.
    pub fn restore(
        config: Config,
        hard_state: Option<HardState>,
        instances: Vec<InstanceState>,
    ) -> Result<Self, EpoxideError> {
        let mut replica = Self::new(config)?;

        if let Some(hs) = hard_state {
            replica.max_truncated_seq_num = hs.max_truncated_seq_num;
            for (r, num) in hs.max_truncated_instance_nums {
                if replica.known_replica(r) {
                    replica.max_truncated_instance_num.insert(r, num);
                }
            }
        }

        let timeout = replica.slow_path_timeout;
        for state in instances {
            let iid = state.instance_id;
            if !replica.known_replica(iid.replica_id) {
                pf_warn!(
                    "dropping persisted instance {} of unknown replica",
                    iid
                );
                continue;
            }
            if replica.has_truncated(iid.replica_id, iid.instance_num) {
                continue;
            }
            if state.status == Status::Committed {
                replica.exec_queue.insert(iid);
            }
            let tree = replica.commands.get_mut(&iid.replica_id).unwrap();
            tree.insert(
                iid.instance_num,
                Instance::from_state(state, timeout),
            );
        }

        // resume execution of anything committed but unexecuted at crash
        replica.run_execution();
        replica.truncate_commands();

        Ok(replica)
    }

    /// Advances the logical clock by one tick, expiring any slow-path timer
    /// that reaches its timeout.
    pub fn tick(&mut self) {
        let own = self.id;
        let mut fired = Vec::new();
        let tree = self.commands.get_mut(&own).unwrap();
        for &num in &self.armed_timers {
            if let Some(inst) = tree.get_mut(&num) {
                if inst.slow_path_timer.tick() {
                    fired.push(num);
                }
            }
        }

        for num in fired {
            self.armed_timers.remove(&num);
            let iid = InstanceId::new(own, num);
            pf_debug!("slow-path timer expired for instance {}", iid);
            self.transition_to(iid, Status::Accepted);
        }
    }

    /// Submits a client command for replication with this replica acting as
    /// its command leader. Returns the instance slot chosen for it.
    pub fn propose(&mut self, cmd: Command) -> InstanceId {
        self.on_request(cmd)
    }

    /// Advances the state machine with an inbound protocol message.
    pub fn step(&mut self, msg: Message) {
        if !self.validate_message(&msg) {
            pf_warn!(
                "ignoring invalid {} message to {} about instance {}",
                msg.body,
                msg.to,
                msg.instance_id
            );
            return;
        }

        let iid = msg.instance_id;
        if self.get_instance(iid).is_none() {
            if self.has_truncated(iid.replica_id, iid.instance_num) {
                // the instance was executed and garbage-collected, which
                // means it was already committed everywhere it matters
                pf_debug!(
                    "ignoring {} message to truncated instance {}",
                    msg.body,
                    iid
                );
                return;
            }
            if iid.replica_id == self.id {
                // we must always know about our own instances
                panic!("unknown local instance number {}", iid);
            }
            let timeout = self.slow_path_timeout;
            self.commands
                .get_mut(&iid.replica_id)
                .unwrap()
                .insert(iid.instance_num, Instance::new(iid, timeout));
        }

        match msg.body {
            PeerMsg::PreAccept {
                command,
                seq_num,
                deps,
            } => self.on_pre_accept(iid, command, seq_num, deps),
            PeerMsg::PreAcceptOk => self.on_pre_accept_ok(iid),
            PeerMsg::PreAcceptReply {
                updated_seq_num,
                updated_deps,
            } => self.on_pre_accept_reply(iid, updated_seq_num, updated_deps),
            PeerMsg::Accept { seq_num, deps } => {
                self.on_accept(iid, seq_num, deps)
            }
            PeerMsg::AcceptOk => self.on_accept_ok(iid),
            PeerMsg::Commit {
                command,
                seq_num,
                deps,
            } => self.on_commit(iid, command, seq_num, deps),
        }
    }

    /// Returns whether any outputs are waiting to be drained.
    pub fn has_updates(&self) -> bool {
        !self.msgs.is_empty()
            || !self.executed_cmds.is_empty()
            || !self.updated_insts.is_empty()
            || self.hard_state_dirty
    }

    /// Returns and clears the accumulated outputs. The caller is
    /// responsible for persisting the durable deltas before sending the
    /// messages.
    pub fn drain(&mut self) -> Ready {
        let hard_state = if self.hard_state_dirty {
            self.hard_state_dirty = false;
            Some(self.hard_state())
        } else {
            None
        };
        Ready {
            messages: mem::take(&mut self.msgs),
            executed_commands: mem::take(&mut self.executed_cmds),
            updated_instances: mem::take(&mut self.updated_insts),
            hard_state,
        }
    }

    /// Snapshots the current truncation marks.
    pub fn hard_state(&self) -> HardState {
        HardState {
            max_truncated_instance_nums: self
                .max_truncated_instance_num
                .clone(),
            max_truncated_seq_num: self.max_truncated_seq_num,
        }
    }

    /// Draws a fresh command identifier from the replica-local random
    /// source.
    pub fn gen_command_id(&mut self) -> CommandId {
        self.rng.gen()
    }

    //
    // Membership and quorum helpers
    //

    pub(crate) fn known_replica(&self, r: ReplicaId) -> bool {
        self.nodes.contains(&r)
    }

    /// Returns whether the count forms a strict majority.
    pub(crate) fn quorum(&self, count: usize) -> bool {
        count > self.nodes.len() / 2
    }

    /// Returns whether the count forms a fast-path quorum. This follows the
    /// conservative `N - 1` size rather than the optimized EPaxos fast
    /// quorum, trading one extra reply for a simpler Accept phase.
    pub(crate) fn fast_quorum(&self, count: usize) -> bool {
        count >= self.nodes.len().saturating_sub(1)
    }

    //
    // Command space accessors
    //

    pub(crate) fn get_instance(&self, iid: InstanceId) -> Option<&Instance> {
        self.commands
            .get(&iid.replica_id)
            .and_then(|tree| tree.get(&iid.instance_num))
    }

    pub(crate) fn get_instance_mut(
        &mut self,
        iid: InstanceId,
    ) -> Option<&mut Instance> {
        self.commands
            .get_mut(&iid.replica_id)
            .and_then(|tree| tree.get_mut(&iid.instance_num))
    }

    /// Largest instance number known for a replica's space, falling back to
    /// its truncation mark for an empty tree.
    pub(crate) fn max_instance_num(&self, r: ReplicaId) -> InstanceNum {
        if let Some((&num, _)) = self.commands[&r].iter().next_back() {
            return num;
        }
        self.max_truncated_instance_num[&r]
    }

    /// Sequence number of the newest instance in a replica's space, falling
    /// back to the global truncated maximum for an empty tree.
    #[cfg(test)]
    pub(crate) fn max_seq_num(&self, r: ReplicaId) -> SeqNum {
        if let Some((_, inst)) = self.commands[&r].iter().next_back() {
            return inst.state.seq_num;
        }
        self.max_truncated_seq_num
    }

    /// Returns whether the instance has been truncated from its tree.
    pub(crate) fn has_truncated(&self, r: ReplicaId, i: InstanceNum) -> bool {
        i <= self.max_truncated_instance_num[&r]
    }

    /// Returns whether the instance has been executed (a truncated instance
    /// is by definition executed).
    pub(crate) fn has_executed(&self, r: ReplicaId, i: InstanceNum) -> bool {
        if self.has_truncated(r, i) {
            return true;
        }
        self.get_instance(InstanceId::new(r, i))
            .is_some_and(|inst| inst.state.status == Status::Executed)
    }

    //
    // Outbox helpers
    //

    /// Buffers a message to a peer for the next drain.
    pub(crate) fn send_to(
        &mut self,
        body: PeerMsg,
        to: ReplicaId,
        instance_id: InstanceId,
    ) {
        if !self.known_replica(to) {
            panic!("unknown destination replica {} in outbound message", to);
        }
        self.msgs.push(Message {
            to,
            instance_id,
            body,
        });
    }

    /// Buffers a message to every peer (all replicas except self).
    pub(crate) fn broadcast(
        &mut self,
        body: PeerMsg,
        instance_id: InstanceId,
    ) {
        let nodes = self.nodes.clone();
        for to in nodes {
            if to != self.id {
                self.send_to(body.clone(), to, instance_id);
            }
        }
    }

    /// Buffers a reply to the command leader owning the instance.
    pub(crate) fn reply(&mut self, body: PeerMsg, instance_id: InstanceId) {
        self.send_to(body, instance_id.replica_id, instance_id);
    }

    /// Records the instance's durable tuple into the delta outbox.
    pub(crate) fn mark_dirty(&mut self, iid: InstanceId) {
        let state = self
            .get_instance(iid)
            .unwrap_or_else(|| panic!("marking unknown instance {}", iid))
            .state
            .clone();
        self.updated_insts.push(state);
    }

    //
    // State transitions
    //

    /// Advances an instance's status, performing the actions attached to
    /// the transition. Transitions not in the protocol's lifecycle graph
    /// are logic errors and abort the replica.
    pub(crate) fn transition_to(&mut self, iid: InstanceId, to: Status) {
        let from = match self.get_instance(iid) {
            Some(inst) => inst.state.status,
            None => panic!("transition on unknown instance {}", iid),
        };

        match (from, to) {
            (Status::Null, Status::PreAccepted) => {
                self.set_status(iid, to);
                let body = self.instance_data(iid);
                self.broadcast(body, iid);
            }
            (Status::PreAccepted, Status::Accepted) => {
                self.set_status(iid, to);
                let body = self.instance_data(iid);
                self.broadcast(body, iid);
            }
            (Status::PreAccepted, Status::Committed)
            | (Status::Accepted, Status::Committed) => {
                self.set_status(iid, to);
                let body = self.instance_data(iid);
                self.broadcast(body, iid);
                self.prepare_to_execute(iid);
            }
            (Status::Committed, Status::Executed) => {
                self.set_status(iid, to);
                let cmd = self
                    .get_instance(iid)
                    .unwrap()
                    .state
                    .command
                    .clone()
                    .unwrap_or_else(|| {
                        panic!("executing instance {} without command", iid)
                    });
                self.executed_cmds.push(cmd);
            }
            (from, to) => {
                panic!(
                    "unexpected state transition {{{:?} -> {:?}}} on {}",
                    from, to, iid
                );
            }
        }

        self.mark_dirty(iid);
    }

    fn set_status(&mut self, iid: InstanceId, status: Status) {
        self.get_instance_mut(iid).unwrap().state.status = status;
    }

    /// Builds the broadcast body for the instance's current status:
    /// PreAccept and Commit carry the command, Accept omits it (the peers
    /// already saw it in PreAccept).
    fn instance_data(&self, iid: InstanceId) -> PeerMsg {
        let state = &self.get_instance(iid).unwrap().state;
        match state.status {
            Status::PreAccepted => PeerMsg::PreAccept {
                command: state.command.clone().unwrap_or_else(|| {
                    panic!("pre-accepting instance {} without command", iid)
                }),
                seq_num: state.seq_num,
                deps: state.deps.clone(),
            },
            Status::Accepted => PeerMsg::Accept {
                seq_num: state.seq_num,
                deps: state.deps.clone(),
            },
            Status::Committed => PeerMsg::Commit {
                command: state.command.clone().unwrap_or_else(|| {
                    panic!("committing instance {} without command", iid)
                }),
                seq_num: state.seq_num,
                deps: state.deps.clone(),
            },
            status => panic!(
                "no broadcast body for instance {} in status {:?}",
                iid, status
            ),
        }
    }

    //
    // Message validity
    //

    /// Checks the message acceptance filter: the message must be addressed
    /// to us; replies must reference our own command space; non-replies
    /// must reference a known remote replica's space.
    fn validate_message(&self, msg: &Message) -> bool {
        if msg.to != self.id {
            return false;
        }

        if msg.body.is_reply() {
            if msg.instance_id.replica_id != self.id {
                return false;
            }
        } else {
            if msg.instance_id.replica_id == self.id {
                return false;
            }
            if !self.known_replica(msg.instance_id.replica_id) {
                return false;
            }
        }

        true
    }
}
