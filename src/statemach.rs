//! Minimal deterministic application state machine.
//!
//! The replication core treats command payloads as opaque bytes; this KV
//! map is the reference interpretation used by the driver tests and demos.
//! A writing command stores its payload under the span's start key; a
//! reading command returns the value stored there, if any.

use std::collections::BTreeMap;

use crate::command::{Command, Key};

/// In-memory key-value state machine applying commands deterministically in
/// the order they are fed.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: BTreeMap<Key, Vec<u8>>,
}

impl StateMachine {
    /// Creates an empty state machine.
    pub fn new() -> Self {
        StateMachine::default()
    }

    /// Applies one executed command. Returns the read value for reading
    /// commands and `None` for writes.
    pub fn apply(&mut self, cmd: &Command) -> Option<Vec<u8>> {
        if cmd.writing {
            self.state.insert(cmd.span.key.clone(), cmd.data.clone());
            None
        } else {
            self.state.get(&cmd.span.key).cloned()
        }
    }

    /// Reads a value without going through a command.
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.state.get(key)
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Returns whether no key has been written yet.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}
