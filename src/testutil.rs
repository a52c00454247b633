//! Shared helpers for protocol tests: command builders, a pre-populated
//! replica, and an in-process cluster simulation network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::command::{Command, Span};
use crate::instance::{Instance, Status};
use crate::message::{Deps, InstanceId, Message, ReplicaId, SeqNum};
use crate::replica::{Config, Replica};
use crate::statemach::StateMachine;

static NEXT_CMD_ID: AtomicU64 = AtomicU64::new(1);

/// Creates a writing command over `[start, end)` with a fresh unique ID. An
/// empty `end` makes it a single-key command.
pub(crate) fn test_write_cmd(start: &str, end: &str) -> Command {
    Command {
        id: NEXT_CMD_ID.fetch_add(1, Ordering::Relaxed),
        span: if end.is_empty() {
            Span::point(start)
        } else {
            Span::range(start, end)
        },
        writing: true,
        data: vec![],
    }
}

/// Creates a reading command over `[start, end)` with a fresh unique ID.
pub(crate) fn test_read_cmd(start: &str, end: &str) -> Command {
    let mut cmd = test_write_cmd(start, end);
    cmd.writing = false;
    cmd
}

impl Replica {
    /// Inserts a fully specified instance into the command space, bypassing
    /// the protocol.
    pub(crate) fn seed_instance(
        &mut self,
        iid: InstanceId,
        cmd: Command,
        seq_num: SeqNum,
        deps: Deps,
        status: Status,
    ) {
        let mut inst = Instance::new(iid, self.slow_path_timeout);
        inst.state.command = Some(cmd);
        inst.state.seq_num = seq_num;
        inst.state.deps = deps;
        inst.state.status = status;
        self.commands
            .get_mut(&iid.replica_id)
            .unwrap()
            .insert(iid.instance_num, inst);
    }

    /// Changes the replica's identity so one state machine can play the
    /// role of several replicas in a test.
    pub(crate) fn change_id(&mut self, id: ReplicaId) {
        assert!(self.known_replica(id), "unknown replica {}", id);
        self.id = id;
    }
}

/// Creates a replica (id 0 of {0, 1, 2}) with the pre-populated instance
/// space:
///
/// ```text
/// 0: [1: {[a-z) w, seq 1}, 2: {[a-m) w, seq 4}]
/// 1: [1: {[a-z) w, seq 2}, 2: {[n-z) w, seq 5}]
/// 2: [1: {[a-b) w, seq 3}]
/// ```
pub(crate) fn seeded_replica() -> Replica {
    let mut config = Config::new(0, vec![0, 1, 2]);
    config.rand_seed = 7;
    let mut p = Replica::new(config).unwrap();

    let dep = InstanceId::new;
    p.seed_instance(
        dep(0, 1),
        test_write_cmd("a", "z"),
        1,
        Deps::new(),
        Status::PreAccepted,
    );
    p.seed_instance(
        dep(1, 1),
        test_write_cmd("a", "z"),
        2,
        [dep(0, 1)].into_iter().collect(),
        Status::PreAccepted,
    );
    p.seed_instance(
        dep(2, 1),
        test_write_cmd("a", "b"),
        3,
        [dep(0, 1), dep(1, 1)].into_iter().collect(),
        Status::PreAccepted,
    );
    p.seed_instance(
        dep(0, 2),
        test_write_cmd("a", "m"),
        4,
        [dep(0, 1), dep(1, 1), dep(2, 1)].into_iter().collect(),
        Status::PreAccepted,
    );
    p.seed_instance(
        dep(1, 2),
        test_write_cmd("n", "z"),
        5,
        [dep(0, 1), dep(1, 1)].into_iter().collect(),
        Status::PreAccepted,
    );

    p
}

/// In-process cluster of replicas with synchronous message routing, crash
/// injection, and an outbound-message interceptor.
pub(crate) struct Network {
    peers: BTreeMap<ReplicaId, Replica>,
    failures: BTreeSet<ReplicaId>,
    histories: BTreeMap<ReplicaId, Vec<Command>>,
    interceptor: Option<Box<dyn FnMut(ReplicaId, &Message)>>,
}

impl Network {
    /// Creates a network of `count` replicas with deterministic seeds.
    pub(crate) fn new(count: u64) -> Self {
        let nodes: Vec<ReplicaId> = (0..count).collect();
        let mut peers = BTreeMap::new();
        let mut histories = BTreeMap::new();
        for &r in &nodes {
            let mut config = Config::new(r, nodes.clone());
            config.rand_seed = r + 1;
            peers.insert(r, Replica::new(config).unwrap());
            histories.insert(r, Vec::new());
        }
        Network {
            peers,
            failures: BTreeSet::new(),
            histories,
            interceptor: None,
        }
    }

    /// Installs a callback observing every message leaving a live replica.
    pub(crate) fn set_interceptor(
        &mut self,
        f: impl FnMut(ReplicaId, &Message) + 'static,
    ) {
        self.interceptor = Some(Box::new(f));
    }

    /// Marks a replica as crashed: it stops ticking, sending, and
    /// receiving.
    pub(crate) fn crash(&mut self, r: ReplicaId) {
        self.failures.insert(r);
    }

    /// Crashes the `count` lowest-numbered replicas.
    pub(crate) fn crash_n(&mut self, count: usize) {
        let ids: Vec<ReplicaId> =
            self.peers.keys().copied().take(count).collect();
        for r in ids {
            self.crash(r);
        }
    }

    pub(crate) fn alive(&self, r: ReplicaId) -> bool {
        !self.failures.contains(&r)
    }

    /// Number of crash failures the cluster is meant to tolerate.
    pub(crate) fn max_faults(&self) -> usize {
        self.peers.len() / 2
    }

    pub(crate) fn peer(&self, r: ReplicaId) -> &Replica {
        &self.peers[&r]
    }

    /// Commands executed by a replica so far, in execution order.
    pub(crate) fn history(&self, r: ReplicaId) -> &[Command] {
        &self.histories[&r]
    }

    /// Applies a replica's executed-command history to a fresh state
    /// machine.
    pub(crate) fn apply_history(&self, r: ReplicaId) -> StateMachine {
        let mut sm = StateMachine::new();
        for cmd in self.history(r) {
            sm.apply(cmd);
        }
        sm
    }

    /// Proposes a command on the given replica.
    pub(crate) fn propose(
        &mut self,
        r: ReplicaId,
        cmd: Command,
    ) -> InstanceId {
        self.peers.get_mut(&r).unwrap().propose(cmd)
    }

    /// Ticks every live replica once.
    pub(crate) fn tick_all(&mut self) {
        for (&r, peer) in self.peers.iter_mut() {
            if !self.failures.contains(&r) {
                peer.tick();
            }
        }
    }

    /// Drains every live replica and delivers the messages addressed to
    /// live destinations. Executed commands are appended to the sender's
    /// history.
    pub(crate) fn deliver_all_messages(&mut self) {
        let mut msgs = Vec::new();
        let live: Vec<ReplicaId> = self
            .peers
            .keys()
            .copied()
            .filter(|r| self.alive(*r))
            .collect();

        for &r in &live {
            let ready = self.peers.get_mut(&r).unwrap().drain();
            self.histories
                .get_mut(&r)
                .unwrap()
                .extend(ready.executed_commands);
            for msg in ready.messages {
                if let Some(interceptor) = self.interceptor.as_mut() {
                    interceptor(r, &msg);
                }
                msgs.push(msg);
            }
        }

        for msg in msgs {
            if self.alive(msg.to) {
                self.peers.get_mut(&msg.to).unwrap().step(msg);
            }
        }
    }

    /// Ticks and delivers until the given instance has executed on a
    /// quorum (`quorum == true`) or on every replica, up to a bounded
    /// number of rounds. Returns whether the goal was reached.
    pub(crate) fn wait_execute(
        &mut self,
        iid: InstanceId,
        quorum: bool,
    ) -> bool {
        const MAX_TICKS_PER_EXECUTION: usize = 10;

        for _ in 0..MAX_TICKS_PER_EXECUTION {
            self.tick_all();
            self.deliver_all_messages();

            let count = self
                .peers
                .values()
                .filter(|p| {
                    p.has_executed(iid.replica_id, iid.instance_num)
                })
                .count();
            let reached = if quorum {
                count > self.peers.len() / 2
            } else {
                count == self.peers.len()
            };
            if reached {
                return true;
            }
        }
        false
    }
}
