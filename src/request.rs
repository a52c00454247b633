//! Client request entrance: the command-leader path.

use crate::command::Command;
use crate::instance::{Instance, Status};
use crate::message::InstanceId;
use crate::replica::Replica;

impl Replica {
    /// Starts ordering a client command with this replica as its command
    /// leader: allocates the next instance number in our own space, computes
    /// the initial sequence number and dependencies, and broadcasts the
    /// PreAccept round.
    pub(crate) fn on_request(&mut self, cmd: Command) -> InstanceId {
        // the smallest unused instance number in our own space
        let num = self.max_instance_num(self.id) + 1;
        let iid = InstanceId::new(self.id, num);

        let (max_local_seq, deps) = self.seq_and_deps_for_command(&cmd, None);

        let mut inst = Instance::new(iid, self.slow_path_timeout);
        inst.state.seq_num = max_local_seq + 1;
        inst.state.deps = deps;
        inst.state.command = Some(cmd);
        pf_debug!(
            "proposing instance {} seq {} with {} dep(s)",
            iid,
            inst.state.seq_num,
            inst.state.deps.len()
        );

        self.commands
            .get_mut(&self.id)
            .unwrap()
            .insert(num, inst);

        self.transition_to(iid, Status::PreAccepted);
        iid
    }
}
