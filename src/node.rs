//! Channel-serialized driver around the replica core.
//!
//! The core is not safe to share across tasks, so the node owns it on a
//! spawned task and funnels every input kind through its own channel. The
//! task multiplexes ticks, proposals, inbound messages, and Ready delivery
//! with `tokio::select!`; consumers receive a `Ready` only after its
//! durable deltas have been pushed into the `Storage` collaborator.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::message::{Message, ReplicaId};
use crate::replica::{Config, Ready, Replica};
use crate::storage::Storage;
use crate::utils::EpoxideError;

/// Capacity of the tick channel; ticks buffer up while the node is busy
/// processing messages and are replayed when it becomes idle.
const TICK_CHAN_CAP: usize = 128;

/// Capacity of the proposal and message channels.
const INPUT_CHAN_CAP: usize = 64;

/// Per-node tuning knobs overlayable from a TOML string.
#[derive(Debug, PartialEq, Eq, Clone, serde::Deserialize)]
pub struct NodeTuning {
    /// Ticks before a majority-but-not-fast-quorum instance takes the slow
    /// path.
    pub slow_path_timeout: u32,

    /// Seed for deterministic execution; 0 seeds from OS entropy.
    pub rand_seed: u64,
}

impl Default for NodeTuning {
    fn default() -> Self {
        NodeTuning {
            slow_path_timeout: 2,
            rand_seed: 0,
        }
    }
}

/// Thread-safe handle around a replica running on its own task.
pub struct Node {
    tx_prop: mpsc::Sender<Command>,
    tx_msg: mpsc::Sender<Message>,
    tx_tick: mpsc::Sender<()>,
    rx_ready: mpsc::Receiver<Ready>,
    tx_stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Node {
    /// Starts a node for a fresh or restarting replica. State previously
    /// persisted into `storage` is restored before the event loop begins;
    /// an optional TOML string overlays the tuning defaults, e.g.
    /// `"slow_path_timeout = 3"`. Must be called within a tokio runtime.
    pub fn start(
        id: ReplicaId,
        nodes: Vec<ReplicaId>,
        storage: Box<dyn Storage>,
        tuning_str: Option<&str>,
    ) -> Result<Node, EpoxideError> {
        let tuning = parsed_config!(tuning_str => NodeTuning;
                                    slow_path_timeout, rand_seed)?;
        let mut config = Config::new(id, nodes);
        config.slow_path_timeout = tuning.slow_path_timeout;
        config.rand_seed = tuning.rand_seed;

        let hard_state = storage.hard_state()?;
        let instances = storage.instances()?;
        let replica = Replica::restore(config, hard_state, instances)?;

        let (tx_prop, rx_prop) = mpsc::channel(INPUT_CHAN_CAP);
        let (tx_msg, rx_msg) = mpsc::channel(INPUT_CHAN_CAP);
        let (tx_tick, rx_tick) = mpsc::channel(TICK_CHAN_CAP);
        let (tx_ready, rx_ready) = mpsc::channel(1);
        let (tx_stop, rx_stop) = watch::channel(false);

        let handle = tokio::spawn(Self::run(
            replica, storage, rx_prop, rx_msg, rx_tick, tx_ready, rx_stop,
        ));

        Ok(Node {
            tx_prop,
            tx_msg,
            tx_tick,
            rx_ready,
            tx_stop,
            handle,
        })
    }

    /// The node's event loop, owning the replica and its storage.
    async fn run(
        mut replica: Replica,
        mut storage: Box<dyn Storage>,
        mut rx_prop: mpsc::Receiver<Command>,
        mut rx_msg: mpsc::Receiver<Message>,
        mut rx_tick: mpsc::Receiver<()>,
        tx_ready: mpsc::Sender<Ready>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        loop {
            let has_updates = replica.has_updates();

            tokio::select! {
                // logical clock tick
                Some(()) = rx_tick.recv() => {
                    replica.tick();
                },

                // client proposal with us as command leader
                Some(cmd) = rx_prop.recv() => {
                    replica.propose(cmd);
                },

                // inbound protocol message from a peer
                Some(msg) = rx_msg.recv() => {
                    replica.step(msg);
                },

                // hand accumulated outputs to the consumer, persisting the
                // durable deltas first
                permit = tx_ready.reserve(), if has_updates => {
                    match permit {
                        Ok(permit) => {
                            let ready = replica.drain();
                            if let Err(e) =
                                Self::persist_ready(storage.as_mut(), &ready)
                            {
                                pf_error!("error persisting ready: {}", e);
                                break;
                            }
                            permit.send(ready);
                        }
                        Err(_) => break,
                    }
                },

                // termination signal (or handle dropped)
                _ = rx_stop.changed() => {
                    break;
                },
            }
        }
    }

    /// Pushes a Ready's durable deltas into storage. Must complete before
    /// the Ready's messages reach the transport.
    fn persist_ready(
        storage: &mut dyn Storage,
        ready: &Ready,
    ) -> Result<(), EpoxideError> {
        for state in &ready.updated_instances {
            storage.persist_instance(state)?;
        }
        if let Some(hs) = &ready.hard_state {
            storage.persist_hard_state(hs)?;
        }
        Ok(())
    }

    /// Advances the node's logical clock by one tick. Never blocks; a tick
    /// is dropped with a warning if the node has fallen far behind.
    pub fn tick(&self) {
        if let Err(mpsc::error::TrySendError::Full(())) =
            self.tx_tick.try_send(())
        {
            pf_warn!("a tick missed to fire, node blocking for too long");
        }
    }

    /// Proposes a command for replication through this node.
    pub async fn propose(&self, cmd: Command) -> Result<(), EpoxideError> {
        self.tx_prop
            .send(cmd)
            .await
            .map_err(|_| EpoxideError::msg("node stopped"))
    }

    /// Delivers an inbound protocol message to the replica.
    pub async fn step(&self, msg: Message) -> Result<(), EpoxideError> {
        self.tx_msg
            .send(msg)
            .await
            .map_err(|_| EpoxideError::msg("node stopped"))
    }

    /// Waits for the next batch of outputs. Durable deltas inside have
    /// already been persisted; the caller applies executed commands and
    /// transmits the messages.
    pub async fn ready(&mut self) -> Option<Ready> {
        self.rx_ready.recv().await
    }

    /// Stops the node and waits for its task to wind down.
    pub async fn stop(self) {
        let _ = self.tx_stop.send(true);
        let _ = self.handle.await;
    }
}
