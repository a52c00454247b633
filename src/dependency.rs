//! Interference-aware dependency and sequence-number computation.

use std::mem;

use crate::command::Command;
use crate::message::{Deps, InstanceId, SeqNum};
use crate::replica::Replica;

impl Replica {
    /// Determines the locally known maximum interfering sequence number and
    /// the minimal dependency set for a command.
    ///
    /// Every per-replica tree is scanned in descending instance order while
    /// a range group accumulates the write spans of recorded dependencies.
    /// A writing instance becomes a dependency only if its span grows the
    /// group: coverage already in the group means some recorded dependency
    /// transitively orders us after it. Once a single group interval
    /// encloses the command's span, the rest of the tree is implied and the
    /// scan of that tree stops. A reading instance becomes a dependency
    /// only if no recorded write span overlaps it. This mirrors a command
    /// queue and avoids materializing and topologically sorting the full
    /// dependency graph; it relies on interference over a key range being
    /// transitive, and on causality between instances of one replica space.
    ///
    /// When re-computing for an already-known instance (a remote
    /// PreAccept), `ignore` excludes that instance from its own
    /// dependencies.
    pub(crate) fn seq_and_deps_for_command(
        &mut self,
        cmd: &Command,
        ignore: Option<InstanceId>,
    ) -> (SeqNum, Deps) {
        let mut max_seq = self.max_truncated_seq_num;
        let mut deps = Deps::new();
        let cmd_range = cmd.span.as_range();

        // the scratch group is owned by the replica; detach it for the scan
        let mut range_group = mem::take(&mut self.range_group);
        for (&r, tree) in &self.commands {
            for (&i, inst) in tree.iter().rev() {
                let iid = InstanceId::new(r, i);
                if ignore == Some(iid) {
                    continue;
                }
                let other = match &inst.state.command {
                    Some(other) => other,
                    None => continue,
                };
                if !other.interferes(cmd) {
                    continue;
                }

                max_seq = max_seq.max(inst.state.seq_num);

                let other_range = other.span.as_range();
                if other.writing {
                    if range_group.add(other_range) {
                        deps.insert(iid);
                        if range_group.len() == 1
                            && range_group.encloses(&cmd_range)
                        {
                            // all older writes in this tree are transitive
                            // dependencies of the ones recorded already
                            break;
                        }
                    }
                } else if !range_group.overlaps(&other_range) {
                    // reads don't depend on reads, so the group can only
                    // cover this span if a recorded write fully covers it
                    deps.insert(iid);
                }
            }
            range_group.clear();
        }
        self.range_group = range_group;

        (max_seq, deps)
    }
}
