//! Inbound protocol message handlers.

use crate::command::Command;
use crate::instance::Status;
use crate::message::{Deps, InstanceId, PeerMsg, SeqNum};
use crate::replica::Replica;

impl Replica {
    /// Handler of PreAccept from a command leader about an instance in its
    /// space.
    pub(crate) fn on_pre_accept(
        &mut self,
        iid: InstanceId,
        command: Command,
        seq_num: SeqNum,
        deps: Deps,
    ) {
        {
            let inst = self.get_instance(iid).unwrap();
            if !inst.in_status(&[Status::Null, Status::PreAccepted]) {
                pf_debug!(
                    "ignoring PreAccept for instance {} in status {:?}",
                    iid,
                    inst.state.status
                );
                return;
            }
        }

        // determine the local sequence number and deps for this command,
        // excluding the instance from its own dependencies
        let (max_local_seq, local_deps) =
            self.seq_and_deps_for_command(&command, Some(iid));

        let (reply, new_seq, merged_len) = {
            let inst = self.get_instance_mut(iid).unwrap();
            inst.state.command = Some(command);

            // the updated sequence number is the max of the local maximum
            // plus one and the leader's proposal
            inst.state.seq_num = seq_num.max(max_local_seq + 1);

            // union of the local dependencies and the leader's
            let mut merged = local_deps;
            merged.extend(deps.iter().copied());
            let no_new_info = inst.state.seq_num == seq_num
                && merged.len() == deps.len();
            inst.state.deps = merged;
            inst.state.status = Status::PreAccepted;

            let reply = if no_new_info {
                PeerMsg::PreAcceptOk
            } else {
                PeerMsg::PreAcceptReply {
                    updated_seq_num: inst.state.seq_num,
                    updated_deps: inst.state.deps.clone(),
                }
            };
            (reply, inst.state.seq_num, inst.state.deps.len())
        };

        pf_trace!(
            "pre-accepted instance {} seq {} with {} dep(s)",
            iid,
            new_seq,
            merged_len
        );
        self.reply(reply, iid);
        self.mark_dirty(iid);
    }

    /// Handler of a PreAcceptOk reply agreeing with our proposal.
    pub(crate) fn on_pre_accept_ok(&mut self, iid: InstanceId) {
        {
            let inst = self.get_instance_mut(iid).unwrap();
            if !inst.in_status(&[Status::PreAccepted]) {
                pf_debug!(
                    "ignoring PreAcceptOk for instance {} in status {:?}",
                    iid,
                    inst.state.status
                );
                return;
            }
            inst.pre_accept_replies += 1;
        }
        self.on_either_pre_accept_reply(iid);
    }

    /// Handler of a PreAcceptReply carrying information we lacked.
    pub(crate) fn on_pre_accept_reply(
        &mut self,
        iid: InstanceId,
        updated_seq_num: SeqNum,
        updated_deps: Deps,
    ) {
        {
            let inst = self.get_instance_mut(iid).unwrap();
            if !inst.in_status(&[Status::PreAccepted]) {
                pf_debug!(
                    "ignoring PreAcceptReply for instance {} in status {:?}",
                    iid,
                    inst.state.status
                );
                return;
            }

            // a larger sequence number or a grown dependency union means
            // the replies were not identical and the fast path is lost
            if updated_seq_num > inst.state.seq_num {
                inst.state.seq_num = updated_seq_num;
                inst.different_replies = true;
            }
            let old_deps_len = inst.state.deps.len();
            inst.state.deps.extend(updated_deps);
            if inst.state.deps.len() != old_deps_len {
                inst.different_replies = true;
            }

            inst.pre_accept_replies += 1;
        }
        self.on_either_pre_accept_reply(iid);
    }

    /// Common continuation after either kind of PreAccept reply: decide
    /// between the fast path, the slow path, and waiting.
    fn on_either_pre_accept_reply(&mut self, iid: InstanceId) {
        let (replies, different, timer_set) = {
            let inst = self.get_instance(iid).unwrap();
            (
                inst.pre_accept_replies + 1, // +1 for the leader itself
                inst.different_replies,
                inst.slow_path_timer.is_set(),
            )
        };

        let take_fast_path = !different && self.fast_quorum(replies);
        let take_slow_path = self.quorum(replies);
        if take_fast_path {
            // identical fast-path quorum: commit in one round trip
            self.cancel_slow_path_timer(iid);
            pf_debug!("committed instance {} via fast path", iid);
            self.transition_to(iid, Status::Committed);
        } else if take_slow_path {
            if different {
                // the fast path can never be reached anymore; run the
                // Paxos-Accept phase right away
                self.cancel_slow_path_timer(iid);
                pf_debug!("entering Accept phase for instance {}", iid);
                self.transition_to(iid, Status::Accepted);
            } else if !timer_set {
                // delay the slow path for a few ticks in case the
                // remaining replies complete the fast quorum
                let inst = self.get_instance_mut(iid).unwrap();
                inst.slow_path_timer.reset();
                self.armed_timers.insert(iid.instance_num);
                pf_trace!("armed slow-path timer for instance {}", iid);
            }
            // otherwise the timer is already running and this reply simply
            // brought us closer to the fast quorum
        }
    }

    /// Handler of a slow-path Accept from the command leader.
    pub(crate) fn on_accept(
        &mut self,
        iid: InstanceId,
        seq_num: SeqNum,
        deps: Deps,
    ) {
        {
            let inst = self.get_instance_mut(iid).unwrap();
            if !inst.in_status(&[
                Status::Null,
                Status::PreAccepted,
                Status::Accepted,
            ]) {
                pf_debug!(
                    "ignoring Accept for instance {} in status {:?}",
                    iid,
                    inst.state.status
                );
                return;
            }

            inst.state.seq_num = seq_num;
            inst.state.deps = deps;
            inst.state.status = Status::Accepted;
        }

        pf_trace!("accepted instance {} seq {}", iid, seq_num);
        self.reply(PeerMsg::AcceptOk, iid);
        self.mark_dirty(iid);
    }

    /// Handler of an AcceptOk reply from a peer.
    pub(crate) fn on_accept_ok(&mut self, iid: InstanceId) {
        let replies = {
            let inst = self.get_instance_mut(iid).unwrap();
            if !inst.in_status(&[Status::Accepted]) {
                pf_debug!(
                    "ignoring AcceptOk for instance {} in status {:?}",
                    iid,
                    inst.state.status
                );
                return;
            }
            inst.accept_replies += 1;
            inst.accept_replies + 1 // +1 for the leader itself
        };

        if self.quorum(replies) {
            pf_debug!("committed instance {} via slow path", iid);
            self.transition_to(iid, Status::Committed);
        }
    }

    /// Handler of a Commit notification from the command leader. Accepted
    /// in any non-Executed status; the leader's chosen tuple overwrites
    /// whatever we had.
    pub(crate) fn on_commit(
        &mut self,
        iid: InstanceId,
        command: Command,
        seq_num: SeqNum,
        deps: Deps,
    ) {
        {
            let inst = self.get_instance_mut(iid).unwrap();
            if inst.in_status(&[Status::Executed]) {
                pf_debug!("ignoring Commit for executed instance {}", iid);
                return;
            }

            inst.state.command = Some(command);
            inst.state.seq_num = seq_num;
            inst.state.deps = deps;
            inst.state.status = Status::Committed;
        }

        pf_debug!("committed instance {} from leader notice", iid);
        self.mark_dirty(iid);
        self.prepare_to_execute(iid);
    }

    /// Disarms the slow-path timer of one of our own instances.
    fn cancel_slow_path_timer(&mut self, iid: InstanceId) {
        if let Some(inst) = self.get_instance_mut(iid) {
            inst.slow_path_timer.stop();
        }
        self.armed_timers.remove(&iid.instance_num);
    }
}
