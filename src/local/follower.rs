use crate::error::StoreError;
use crate::event::{
    AppendEntriesArgs, AppendEntriesReply, ConflictHint, InstallSnapshotArgs, InstallSnapshotReply,
    Notify, RequestVoteArgs, RequestVoteReply, Responder,
};
use crate::local::hsm::{LocalHsm, Role, SnapshotRecovery};
use crate::local::{classify_member_change, MemberChangeStatus};
use crate::persist::{Config, EntryKind, Index, Term};
use tokio::time::Instant;

impl LocalHsm {
    pub(crate) fn handle_request_vote(
        &mut self,
        args: RequestVoteArgs,
        responder: Responder<RequestVoteReply>,
    ) {
        let current = self.current_term();
        if args.term < current {
            responder.send(RequestVoteReply {
                term: current,
                granted: false,
            });
            return;
        }
        if matches!(self.role, Role::PersistError) {
            return;
        }

        let active = match self.active_config() {
            Ok(conf) => conf,
            Err(err) => {
                self.enter_persist_error(err);
                return;
            }
        };
        if !active.contains(&args.candidate) {
            responder.send(RequestVoteReply {
                term: current,
                granted: false,
            });
            return;
        }

        // A follower in recent contact with a live leader refuses to vote, so
        // a briefly partitioned node cannot depose a healthy leader with an
        // inflated term.
        if let Role::Follower(follower) = &self.role {
            if let Some(contact) = follower.last_leader_contact {
                let threshold = self
                    .options
                    .election_timeout
                    .mul_f64(self.options.election_timeout_threshold);
                if self.shared.leader().is_some() && contact.elapsed() < threshold {
                    slog::debug!(self.logger, "refusing vote, leader is alive";
                        "candidate" => %args.candidate);
                    responder.send(RequestVoteReply {
                        term: current,
                        granted: false,
                    });
                    return;
                }
            }
        }

        if args.term > current {
            self.step_down(args.term, None);
        }
        let current = self.current_term();

        let up_to_date = match self.candidate_up_to_date(&args) {
            Ok(up_to_date) => up_to_date,
            Err(err) => {
                self.enter_persist_error(err);
                return;
            }
        };
        let voted_for = self.shared.voted_for();
        let can_vote = voted_for.is_none() || voted_for.as_ref() == Some(&args.candidate);
        let granted = can_vote && up_to_date;
        if granted {
            self.shared.set_voted_for(Some(args.candidate.clone()));
            if let Role::Follower(follower) = &self.role {
                follower.timer.reset();
            }
        }
        slog::debug!(self.logger, "vote decided";
            "candidate" => %args.candidate, "term" => %current, "granted" => granted);
        responder.send(RequestVoteReply {
            term: current,
            granted,
        });
    }

    fn candidate_up_to_date(&self, args: &RequestVoteArgs) -> Result<bool, StoreError> {
        let my_last_term = self.log.last_term()?;
        let my_last_index = self.log.last_index()?;
        Ok(args.last_log_term > my_last_term
            || (args.last_log_term == my_last_term && args.last_log_index >= my_last_index))
    }

    pub(crate) fn handle_append_entries(
        &mut self,
        args: AppendEntriesArgs,
        responder: Responder<AppendEntriesReply>,
    ) {
        let current = self.current_term();
        if args.term < current {
            responder.send(AppendEntriesReply {
                term: current,
                success: false,
                match_index: Index::new(0),
                conflict: None,
            });
            return;
        }
        if matches!(self.role, Role::PersistError) {
            return;
        }
        if matches!(self.role, Role::Leader(_)) && args.term == current {
            // Two leaders in one term would break election safety.
            slog::error!(self.logger, "append from a same-term leader";
                "from" => %args.leader, "term" => %args.term);
            responder.send(AppendEntriesReply {
                term: current,
                success: false,
                match_index: Index::new(0),
                conflict: None,
            });
            return;
        }
        if args.term > current || !matches!(self.role, Role::Follower(_)) {
            self.step_down(args.term, Some(args.leader.clone()));
        }

        if let Role::Follower(follower) = &mut self.role {
            follower.last_leader_contact = Some(Instant::now());
            follower.timer.reset();
        }
        self.set_leader_with_notify(Some(args.leader.clone()));

        match self.follower_try_append(args) {
            Ok(reply) => responder.send(reply),
            Err(err) => self.enter_persist_error(err),
        }
    }

    fn follower_try_append(
        &mut self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, StoreError> {
        let current = self.current_term();

        if !args.prev_log_index.is_zero() {
            match self.log.term_at(args.prev_log_index)? {
                None => {
                    // Shorter than the probe: tell the leader where we end.
                    return Ok(AppendEntriesReply {
                        term: current,
                        success: false,
                        match_index: Index::new(0),
                        conflict: Some(ConflictHint {
                            term: Term::new(0),
                            first_index: self.log.last_index()?.plus(1),
                        }),
                    });
                }
                Some(term) if term != args.prev_log_term => {
                    let first_index = self.first_index_of_term(args.prev_log_index, term)?;
                    return Ok(AppendEntriesReply {
                        term: current,
                        success: false,
                        match_index: Index::new(0),
                        conflict: Some(ConflictHint { term, first_index }),
                    });
                }
                Some(_) => {}
            }
        }

        let entry_count = args.entries.len() as u64;
        let mut to_store = Vec::with_capacity(args.entries.len());
        let mut truncated = false;
        for entry in args.entries {
            if truncated || !to_store.is_empty() {
                to_store.push(entry);
                continue;
            }
            match self.log.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Divergent suffix: drop ours and everything after it.
                    self.log.truncate_after(entry.index.prev())?;
                    self.config_manager.truncate_after(entry.index.prev())?;
                    truncated = true;
                    to_store.push(entry);
                }
                None => to_store.push(entry),
            }
        }
        if truncated {
            self.refresh_status_after_truncate()?;
        }

        let mut seen_configs = Vec::new();
        for entry in &to_store {
            if entry.kind == EntryKind::Config {
                seen_configs.push((entry.index, Config::decode(&entry.data)?));
            }
        }
        self.log.store_entries(to_store)?;
        for (index, conf) in seen_configs {
            self.config_manager.push_config(index, conf.clone())?;
            self.follower_config_seen(&conf);
        }

        let last_from_leader = args.prev_log_index.plus(entry_count);
        let committed = self.log.committed_index()?;
        if args.leader_commit > committed {
            let commit_to = args
                .leader_commit
                .min(last_from_leader)
                .min(self.log.last_index()?);
            if commit_to > committed {
                self.commit_logs_up_to(commit_to)?;
                self.refresh_member_change_on_commit()?;
            }
        }

        Ok(AppendEntriesReply {
            term: current,
            success: true,
            match_index: last_from_leader,
            conflict: None,
        })
    }

    /// First index of the contiguous run of `term` ending at `from`.
    fn first_index_of_term(&self, from: Index, term: Term) -> Result<Index, StoreError> {
        let first = self.log.first_index()?;
        let mut index = from;
        while index > first {
            match self.log.term_at(index.prev())? {
                Some(t) if t == term => index = index.prev(),
                _ => break,
            }
        }
        Ok(index)
    }

    /// A config entry took effect the moment it was appended.
    fn follower_config_seen(&mut self, conf: &Config) {
        if conf.is_old_new() {
            self.set_member_change_status(MemberChangeStatus::OldNewConfigSeen);
            self.notifier.notify(Notify::MemberChange {
                servers: conf.servers.clone(),
                new_servers: conf.new_servers.clone(),
            });
        } else if self.shared.member_change_status() == MemberChangeStatus::OldNewConfigCommitted {
            self.set_member_change_status(MemberChangeStatus::NewConfigSeen);
            self.notifier.notify(Notify::MemberChange {
                servers: conf.servers.clone(),
                new_servers: Vec::new(),
            });
        }
    }

    /// Truncation can remove uncommitted config entries, rolling an abandoned
    /// membership change back.
    fn refresh_status_after_truncate(&mut self) -> Result<(), StoreError> {
        let committed = self.log.committed_index()?;
        let metas = self.config_manager.list_after(committed)?;
        let status = classify_member_change(&metas)?;
        self.set_member_change_status(status);
        Ok(())
    }

    pub(crate) fn handle_install_snapshot(
        &mut self,
        args: InstallSnapshotArgs,
        responder: Responder<InstallSnapshotReply>,
    ) {
        let current = self.current_term();
        if args.term < current {
            responder.send(InstallSnapshotReply {
                term: current,
                next_offset: 0,
            });
            return;
        }
        if matches!(self.role, Role::PersistError) {
            return;
        }
        if args.term > current || !matches!(self.role, Role::Follower(_)) {
            self.step_down(args.term, Some(args.leader.clone()));
        }

        if let Role::Follower(follower) = &mut self.role {
            follower.last_leader_contact = Some(Instant::now());
            follower.timer.reset();
        }
        self.set_leader_with_notify(Some(args.leader.clone()));

        match self.follower_receive_snapshot(args) {
            Ok(reply) => responder.send(reply),
            Err(err) => self.enter_persist_error(err),
        }
    }

    fn follower_receive_snapshot(
        &mut self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, StoreError> {
        let current = self.current_term();
        let follower = match &mut self.role {
            Role::Follower(follower) => follower,
            _ => {
                return Ok(InstallSnapshotReply {
                    term: current,
                    next_offset: 0,
                })
            }
        };

        let meta_matches = follower
            .snapshot_recovery
            .as_ref()
            .map(|r| {
                r.last_included_index == args.last_included_index
                    && r.last_included_term == args.last_included_term
            })
            .unwrap_or(false);
        if !meta_matches {
            if args.offset != 0 {
                // Mid-stream of a snapshot we never started; make the leader
                // start over.
                follower.snapshot_recovery = None;
                return Ok(InstallSnapshotReply {
                    term: current,
                    next_offset: 0,
                });
            }
            let writer = self.snapshots.create(
                args.last_included_index,
                args.last_included_term,
                args.servers.clone(),
            )?;
            follower.snapshot_recovery = Some(SnapshotRecovery {
                writer,
                last_included_index: args.last_included_index,
                last_included_term: args.last_included_term,
                servers: args.servers.clone(),
                next_offset: 0,
            });
        }

        let recovery = follower
            .snapshot_recovery
            .as_mut()
            .expect("snapshot recovery just ensured");
        if args.offset != recovery.next_offset {
            follower.snapshot_recovery = None;
            return Ok(InstallSnapshotReply {
                term: current,
                next_offset: 0,
            });
        }
        recovery.writer.write_chunk(args.offset, &args.data)?;
        recovery.next_offset += args.data.len() as u64;
        let next_offset = recovery.next_offset;

        if args.done {
            let recovery = follower
                .snapshot_recovery
                .take()
                .expect("snapshot recovery active");
            recovery.writer.commit()?;
            self.log
                .reset(recovery.last_included_index, recovery.last_included_term)?;
            self.config_manager
                .truncate_after(recovery.last_included_index)?;
            let conf = Config::normal(recovery.servers.clone());
            if self.config_manager.last_config()? != conf {
                self.config_manager
                    .push_config(recovery.last_included_index, conf)?;
            }
            if let Some(applier) = &self.applier {
                applier.snapshot_restored(recovery.last_included_index);
            }
            self.set_member_change_status(MemberChangeStatus::NotInMemberChange);
            self.notifier.notify(Notify::Commit {
                index: recovery.last_included_index,
            });
            slog::info!(self.logger, "snapshot installed";
                "last_included_index" => %recovery.last_included_index);
        }

        Ok(InstallSnapshotReply {
            term: current,
            next_offset,
        })
    }
}
