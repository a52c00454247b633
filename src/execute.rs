//! Execution of committed instances.
//!
//! Committed instances form a directed (possibly cyclic) dependency graph.
//! Tarjan's algorithm condenses it into strongly connected components and
//! conveniently emits them in reverse topological order, so by the time a
//! component comes up, everything it depends on outside itself has already
//! had its chance to execute. Inside a component, instances execute in
//! `(SeqNum, ReplicaID)` order, which every replica computes identically.

use std::collections::BTreeSet;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

use crate::instance::Status;
use crate::message::InstanceId;
use crate::replica::Replica;

impl Replica {
    /// Hands a freshly committed instance to the execution engine, attempts
    /// an execution pass, and garbage-collects executed prefixes.
    pub(crate) fn prepare_to_execute(&mut self, iid: InstanceId) {
        debug_assert_eq!(
            self.get_instance(iid).unwrap().state.status,
            Status::Committed
        );
        self.exec_queue.insert(iid);
        self.run_execution();
        self.truncate_commands();
    }

    /// Runs one execution pass over the working set of committed-but-not-
    /// executed instances, executing every component whose dependencies are
    /// satisfied.
    pub(crate) fn run_execution(&mut self) {
        if self.exec_queue.is_empty() {
            return;
        }

        // materialize the dependency graph restricted to the working set;
        // edges to instances outside it are checked against execution state
        // per component below
        let mut dep_graph = DiGraphMap::<InstanceId, ()>::new();
        for &v in &self.exec_queue {
            dep_graph.add_node(v);
        }
        for &v in &self.exec_queue {
            let inst = self
                .get_instance(v)
                .unwrap_or_else(|| panic!("missing enqueued instance {}", v));
            for &d in &inst.state.deps {
                if d != v && self.exec_queue.contains(&d) {
                    dep_graph.add_edge(v, d, ());
                }
            }
        }
        let dep_graph = dep_graph.into_graph::<usize>();

        // components come out in reverse topological order
        let scc_list = tarjan_scc(&dep_graph);
        pf_trace!(
            "execution pass over {} vertices in {} components",
            dep_graph.node_count(),
            scc_list.len()
        );
        for scc in scc_list {
            let members: BTreeSet<InstanceId> =
                scc.iter().map(|&n| dep_graph[n]).collect();

            // every dependency must be inside this component or already
            // executed (an unexecuted one blocks the whole component and,
            // transitively, everything ordered after it)
            let mut runnable = true;
            'check: for &v in &members {
                for &d in &self.get_instance(v).unwrap().state.deps {
                    if members.contains(&d) {
                        continue;
                    }
                    if !self.has_executed(d.replica_id, d.instance_num) {
                        pf_trace!(
                            "component of {} blocked on dependency {}",
                            v,
                            d
                        );
                        runnable = false;
                        break 'check;
                    }
                }
            }
            if !runnable {
                continue;
            }

            // sequence numbers break ties inside the cycle; commands in the
            // same component always come from different replicas, so the
            // (seq, replica) pair is a total order
            let mut order: Vec<InstanceId> = members.into_iter().collect();
            order.sort_by_key(|&v| {
                (self.get_instance(v).unwrap().state.seq_num, v.replica_id)
            });

            for v in order {
                self.exec_queue.remove(&v);
                pf_debug!("executing instance {}", v);
                self.transition_to(v, Status::Executed);
            }
        }
    }

    /// Removes the contiguous executed prefix of every replica's tree,
    /// advancing the truncation marks. Dependencies pointing below a mark
    /// are treated as executed.
    pub(crate) fn truncate_commands(&mut self) {
        for (&r, tree) in self.commands.iter_mut() {
            let prefix: Vec<_> = tree
                .iter()
                .take_while(|(_, inst)| {
                    inst.state.status == Status::Executed
                })
                .map(|(&num, _)| num)
                .collect();
            if prefix.is_empty() {
                continue;
            }

            let mut cur_max = self.max_truncated_instance_num[&r];
            for num in prefix {
                let inst = tree.remove(&num).unwrap();
                self.max_truncated_seq_num =
                    self.max_truncated_seq_num.max(inst.state.seq_num);
                cur_max = cur_max.max(num);
            }
            self.max_truncated_instance_num.insert(r, cur_max);
            self.hard_state_dirty = true;
        }
    }
}

#[cfg(test)]
mod execute_tests {
    use super::*;
    use crate::command::Command;
    use crate::message::{Deps, InstanceNum, ReplicaId};
    use crate::testutil::{seeded_replica, test_write_cmd};

    fn dep(r: ReplicaId, i: InstanceNum) -> InstanceId {
        InstanceId::new(r, i)
    }

    /// Commits a chain/graph of instances described as
    /// `(replica, num, seq, deps)` tuples onto a fresh replica and runs one
    /// execution pass.
    fn run_graph(
        p: &mut crate::replica::Replica,
        graph: &[(ReplicaId, InstanceNum, u64, &[InstanceId])],
    ) {
        for &(r, i, seq, deps) in graph {
            let mut cmd = test_write_cmd("a", "z");
            // encode the slot into the command id for easy assertions
            cmd.id = r * 100 + i;
            p.seed_instance(
                dep(r, i),
                cmd,
                seq,
                deps.iter().copied().collect::<Deps>(),
                Status::Committed,
            );
            p.exec_queue.insert(dep(r, i));
        }
        p.run_execution();
        p.truncate_commands();
    }

    fn executed_ids(cmds: &[Command]) -> Vec<u64> {
        cmds.iter().map(|cmd| cmd.id).collect()
    }

    #[test]
    fn cycle_executes_in_seq_then_replica_order() {
        let mut p = seeded_replica_empty();

        // three-instance cycle with seqs 7, 7, 5 on replicas 2, 0, 1: the
        // seq-5 instance goes first, then the seq-7 tie breaks by replica
        run_graph(
            &mut p,
            &[
                (2, 1, 7, &[dep(0, 1)]),
                (0, 1, 7, &[dep(1, 1)]),
                (1, 1, 5, &[dep(2, 1)]),
            ],
        );

        let rd = p.drain();
        assert_eq!(executed_ids(&rd.executed_commands), vec![101, 1, 201]);

        // the whole cycle was truncated away
        let hs = rd.hard_state.unwrap();
        for r in 0..3 {
            assert_eq!(hs.max_truncated_instance_nums[&r], 1);
        }
        assert_eq!(hs.max_truncated_seq_num, 7);
    }

    #[test]
    fn chain_executes_in_reverse_topological_order() {
        let mut p = seeded_replica_empty();

        // 0.1 <- 0.2 <- 0.3 (each depends on the previous)
        run_graph(
            &mut p,
            &[
                (0, 1, 1, &[]),
                (0, 2, 2, &[dep(0, 1)]),
                (0, 3, 3, &[dep(0, 2)]),
            ],
        );

        let rd = p.drain();
        assert_eq!(executed_ids(&rd.executed_commands), vec![1, 2, 3]);
    }

    #[test]
    fn component_blocks_on_uncommitted_dependency() {
        let mut p = seeded_replica_empty();

        // 1.1 depends on 2.1 which is nowhere to be seen yet
        run_graph(&mut p, &[(1, 1, 1, &[dep(2, 1)])]);
        assert!(p.drain().executed_commands.is_empty());
        assert_eq!(
            p.get_instance(dep(1, 1)).unwrap().state.status,
            Status::Committed
        );

        // once the dependency commits, both execute
        run_graph(&mut p, &[(2, 1, 1, &[])]);
        let rd = p.drain();
        assert_eq!(executed_ids(&rd.executed_commands), vec![201, 101]);
    }

    #[test]
    fn blocked_component_stalls_its_dependents() {
        let mut p = seeded_replica_empty();

        // a cycle between 0.1 and 1.1 blocked on missing 2.5, plus 2.1
        // depending on the cycle: nothing may execute
        run_graph(
            &mut p,
            &[
                (0, 1, 1, &[dep(1, 1), dep(2, 5)]),
                (1, 1, 2, &[dep(0, 1)]),
                (2, 1, 3, &[dep(0, 1)]),
            ],
        );
        assert!(p.drain().executed_commands.is_empty());

        // committing 2.5 unblocks everything
        run_graph(&mut p, &[(2, 5, 9, &[])]);
        let rd = p.drain();
        assert_eq!(
            executed_ids(&rd.executed_commands),
            vec![205, 1, 101, 201]
        );
    }

    #[test]
    fn truncation_stops_at_first_gap() {
        let mut p = seeded_replica_empty();

        // 0.3 exists but is not committed; 0.4 commits and executes
        run_graph(&mut p, &[(0, 1, 1, &[]), (0, 2, 2, &[dep(0, 1)])]);
        p.seed_instance(
            dep(0, 3),
            test_write_cmd("a", "z"),
            3,
            Deps::new(),
            Status::PreAccepted,
        );
        run_graph(&mut p, &[(0, 4, 4, &[])]);

        // only the contiguous executed prefix is garbage-collected
        let hs = p.drain().hard_state.unwrap();
        assert_eq!(hs.max_truncated_instance_nums[&0], 2);
        assert!(p.get_instance(dep(0, 1)).is_none());
        assert!(p.get_instance(dep(0, 2)).is_none());
        assert!(p.get_instance(dep(0, 3)).is_some());
        assert_eq!(
            p.get_instance(dep(0, 4)).unwrap().state.status,
            Status::Executed
        );

        // dependencies below the mark count as executed
        assert!(p.has_executed(0, 1));
        assert!(p.has_executed(0, 2));
        assert!(!p.has_executed(0, 3));
    }

    #[test]
    fn multi_component_graph_executes_dependencies_first() {
        let mut p = seeded_replica_empty();

        // cycle {0.1, 1.1, 2.1} plus a tail 0.2 -> 0.1 and 1.2 -> {1.1}
        run_graph(
            &mut p,
            &[
                (0, 1, 3, &[dep(1, 1)]),
                (1, 1, 3, &[dep(2, 1)]),
                (2, 1, 3, &[dep(0, 1)]),
                (0, 2, 4, &[dep(0, 1)]),
                (1, 2, 5, &[dep(1, 1), dep(0, 2)]),
            ],
        );

        let rd = p.drain();
        // the cycle in replica order first, then the dependents in
        // topological order
        assert_eq!(
            executed_ids(&rd.executed_commands),
            vec![1, 101, 201, 2, 102]
        );
    }

    fn seeded_replica_empty() -> crate::replica::Replica {
        let mut config = crate::replica::Config::new(0, vec![0, 1, 2]);
        config.rand_seed = 7;
        crate::replica::Replica::new(config).unwrap()
    }

    #[test]
    fn seeded_space_blocks_until_deps_commit() {
        let mut p = seeded_replica();

        // commit the newest instance of replica 0's space; its deps are
        // merely pre-accepted, so it must wait
        let iid = dep(0, 2);
        {
            let inst = p.get_instance_mut(iid).unwrap();
            inst.state.status = Status::Committed;
        }
        p.prepare_to_execute(iid);
        assert!(p.drain().executed_commands.is_empty());
    }
}
