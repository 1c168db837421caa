use crate::event::{RequestVoteArgs, RequestVoteReply};
use crate::local::hsm::{CandidateRole, LocalHsm, Role};
use crate::local::timer::ElectionTimerHandle;
use crate::persist::ServerAddress;
use crate::quorum::joint_granted;
use std::collections::HashSet;

impl LocalHsm {
    /// Election timeout in Follower or Candidate: open a new term, vote for
    /// ourselves, and campaign across every active config half.
    pub(crate) fn start_election(&mut self) {
        let local = self.shared.local_addr().clone();
        let new_term = self.current_term().next();
        self.set_term_with_notify(new_term);
        self.shared.set_voted_for(Some(local.clone()));
        self.set_leader_with_notify(None);

        let conf = match self.active_config() {
            Ok(conf) => conf,
            Err(err) => {
                self.enter_persist_error(err);
                return;
            }
        };
        if !conf.contains(&local) {
            // Removed from the cluster; nothing to campaign for.
            slog::debug!(self.logger, "not in the active config, staying follower");
            self.role = Role::Follower(self.new_follower_role());
            return;
        }

        slog::info!(self.logger, "starting election"; "term" => %new_term);
        let mut votes = HashSet::new();
        votes.insert(local.clone());
        self.role = Role::Candidate(CandidateRole {
            timer: ElectionTimerHandle::spawn(
                self.options.election_timeout,
                self.options.max_timeout_jitter,
                self.normal.clone(),
            ),
            votes: votes.clone(),
        });

        if joint_granted(&conf, &votes) {
            // Majority of one: a single-node cluster elects itself.
            self.become_leader();
            return;
        }

        let (last_log_index, last_log_term) =
            match (self.log.last_index(), self.log.last_term()) {
                (Ok(index), Ok(term)) => (index, term),
                (Err(err), _) | (_, Err(err)) => {
                    self.enter_persist_error(err);
                    return;
                }
            };
        self.peers.reconfigure(&conf.all_servers());
        self.peers.request_vote_all(RequestVoteArgs {
            term: new_term,
            candidate: local,
            last_log_index,
            last_log_term,
        });
    }

    pub(crate) fn handle_vote_reply(&mut self, peer: ServerAddress, reply: RequestVoteReply) {
        let current = self.current_term();
        if reply.term > current {
            self.step_down(reply.term, None);
            return;
        }
        if !reply.granted || reply.term < current {
            return;
        }

        let votes = if let Role::Candidate(candidate) = &mut self.role {
            candidate.votes.insert(peer);
            candidate.votes.clone()
        } else {
            return;
        };

        let conf = match self.active_config() {
            Ok(conf) => conf,
            Err(err) => {
                self.enter_persist_error(err);
                return;
            }
        };
        if joint_granted(&conf, &votes) {
            self.become_leader();
        }
    }
}
