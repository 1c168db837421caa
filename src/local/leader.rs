use crate::applier::InflightApply;
use crate::error::StoreError;
use crate::event::{
    AppendEntriesReply, ClientOp, ClientRequest, ClientResponse, Notify, Responder,
};
use crate::local::hsm::{ChangePhase, InflightCommand, LeaderRole, LocalHsm, MemberChange, Role};
use crate::local::MemberChangeStatus;
use crate::persist::{Config, EntryKind, Index, LogEntry, ServerAddress};
use crate::quorum::joint_committed_index;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

impl LocalHsm {
    /// Won the election: open the term with a noop entry and start
    /// replicating. The leader stays Unsync (bouncing client traffic) until
    /// that noop commits, which proves it holds every committed entry.
    pub(crate) fn become_leader(&mut self) {
        if !matches!(self.role, Role::Candidate(_)) {
            return;
        }
        slog::info!(self.logger, "won election"; "term" => %self.current_term());
        if let Err(err) = self.try_become_leader() {
            self.enter_persist_error(err);
        }
    }

    fn try_become_leader(&mut self) -> Result<(), StoreError> {
        let local = self.shared.local_addr().clone();
        let current = self.current_term();
        self.set_leader_with_notify(Some(local.clone()));

        let conf = self.active_config()?;
        let noop_index = self.log.last_index()?.plus(1);
        self.log.store_entries(vec![LogEntry {
            index: noop_index,
            term: current,
            kind: EntryKind::Noop,
            data: Bytes::new(),
        }])?;

        let mut match_index = HashMap::new();
        match_index.insert(local, noop_index);
        let member_change = self.resume_member_change()?;
        self.role = Role::Leader(LeaderRole {
            sync: false,
            noop_index,
            match_index,
            inflights: BTreeMap::new(),
            member_change,
        });

        self.peers.reconfigure(&conf.all_servers());
        self.peers.activate_all(current, noop_index);
        // A majority of one commits immediately.
        self.leader_advance_commit()
    }

    /// A membership change left behind by a previous leader continues under
    /// this one, without a client to answer.
    fn resume_member_change(&self) -> Result<Option<MemberChange>, StoreError> {
        let committed = self.log.committed_index()?;
        let metas = self.config_manager.list_after(committed)?;
        match self.shared.member_change_status() {
            MemberChangeStatus::OldNewConfigSeen | MemberChangeStatus::OldNewConfigCommitted => {
                let meta = metas
                    .iter()
                    .find(|m| m.conf.is_old_new())
                    .ok_or_else(|| {
                        StoreError::Corrupted(
                            "member change status names a missing joint config".to_string(),
                        )
                    })?;
                Ok(Some(MemberChange {
                    phase: ChangePhase::Joint { index: meta.index },
                    new_servers: meta.conf.new_servers.clone(),
                    responder: None,
                }))
            }
            MemberChangeStatus::NewConfigSeen => {
                let meta = metas
                    .iter()
                    .rev()
                    .find(|m| m.conf.is_normal())
                    .ok_or_else(|| {
                        StoreError::Corrupted(
                            "member change status names a missing new config".to_string(),
                        )
                    })?;
                Ok(Some(MemberChange {
                    phase: ChangePhase::New { index: meta.index },
                    new_servers: meta.conf.servers.clone(),
                    responder: None,
                }))
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn leader_handle_client(&mut self, request: ClientRequest) {
        let sync = match &self.role {
            Role::Leader(leader) => leader.sync,
            _ => return,
        };
        if !sync {
            request.responder.send(ClientResponse::LeaderUnsync);
            return;
        }
        match request.op {
            ClientOp::Append(data) | ClientOp::ReadOnly(data) => {
                self.leader_append_command(data, request.responder)
            }
            ClientOp::ChangeConfig(conf) => {
                self.leader_start_member_change(conf, request.responder)
            }
            ClientOp::GetConfig => unreachable!("answered before role dispatch"),
        }
    }

    fn leader_append_command(&mut self, data: Bytes, responder: Responder<ClientResponse>) {
        let local = self.shared.local_addr().clone();
        let current = self.current_term();
        let index = match self.log.last_index() {
            Ok(last) => last.plus(1),
            Err(err) => {
                responder.send(ClientResponse::PersistError);
                self.enter_persist_error(err);
                return;
            }
        };
        if let Err(err) = self.log.store_entries(vec![LogEntry {
            index,
            term: current,
            kind: EntryKind::Command,
            data: data.clone(),
        }]) {
            responder.send(ClientResponse::PersistError);
            self.enter_persist_error(err);
            return;
        }

        if let Role::Leader(leader) = &mut self.role {
            leader
                .inflights
                .insert(index.as_u64(), InflightCommand { data, responder });
            leader.match_index.insert(local, index);
        }
        self.peers.kick_all();
        if let Err(err) = self.leader_advance_commit() {
            self.enter_persist_error(err);
        }
    }

    fn leader_start_member_change(
        &mut self,
        target: Config,
        responder: Responder<ClientResponse>,
    ) {
        let in_change = match &self.role {
            Role::Leader(leader) => leader.member_change.is_some(),
            _ => return,
        };
        if in_change
            || self.shared.member_change_status() != MemberChangeStatus::NotInMemberChange
        {
            responder.send(ClientResponse::InMemberChange);
            return;
        }
        if !target.is_normal() {
            responder.send(ClientResponse::Failure);
            return;
        }

        if let Err(err) = self.leader_append_joint_config(target, responder) {
            self.enter_persist_error(err);
        }
    }

    fn leader_append_joint_config(
        &mut self,
        target: Config,
        responder: Responder<ClientResponse>,
    ) -> Result<(), StoreError> {
        let local = self.shared.local_addr().clone();
        let current = self.current_term();
        let old = self.active_config()?;
        let joint = Config::old_new(old.servers.clone(), target.servers.clone());
        let index = self.log.last_index()?.plus(1);
        self.log.store_entries(vec![LogEntry {
            index,
            term: current,
            kind: EntryKind::Config,
            data: joint.encode()?,
        }])?;
        self.config_manager.push_config(index, joint.clone())?;

        slog::info!(self.logger, "starting membership change";
            "joint_index" => %index);
        self.set_member_change_status(MemberChangeStatus::OldNewConfigSeen);
        self.notifier.notify(Notify::MemberChange {
            servers: joint.servers.clone(),
            new_servers: joint.new_servers.clone(),
        });

        let added = self.peers.reconfigure(&joint.all_servers());
        for addr in added {
            self.peers.activate(&addr, current, index.plus(1));
        }
        if let Role::Leader(leader) = &mut self.role {
            leader.member_change = Some(MemberChange {
                phase: ChangePhase::Joint { index },
                new_servers: target.servers,
                responder: Some(responder),
            });
            leader.match_index.insert(local, index);
        }
        self.peers.kick_all();
        self.leader_advance_commit()
    }

    pub(crate) fn handle_append_reply(&mut self, peer: ServerAddress, reply: AppendEntriesReply) {
        let current = self.current_term();
        if reply.term > current {
            self.step_down(reply.term, None);
            return;
        }
        // Acks from an earlier leadership describe a log we no longer vouch
        // for.
        if reply.term < current || !reply.success {
            return;
        }
        match &mut self.role {
            Role::Leader(leader) => {
                let acked = leader.match_index.entry(peer).or_default();
                *acked = (*acked).max(reply.match_index);
            }
            _ => return,
        }
        if let Err(err) = self.leader_advance_commit() {
            self.enter_persist_error(err);
        }
    }

    /// Re-evaluates the commit index: the highest index stored on a majority
    /// of every active config half, committable only once an entry of the
    /// current term reaches it. Commits walk the applier strictly in order;
    /// entries this leader tracks answer their clients on apply.
    pub(crate) fn leader_advance_commit(&mut self) -> Result<(), StoreError> {
        let local = self.shared.local_addr().clone();
        let current = self.current_term();
        let conf = self.active_config()?;
        let last = self.log.last_index()?;
        let committed = self.log.committed_index()?;

        let leader = match &mut self.role {
            Role::Leader(leader) => leader,
            _ => return Ok(()),
        };
        leader.match_index.insert(local, last);
        let reachable = joint_committed_index(&conf, &leader.match_index);

        if reachable > committed {
            match self.log.term_at(reachable)? {
                Some(term) if term == current => {
                    self.log.store_committed_index(reachable)?;
                    self.notifier.notify(Notify::Commit { index: reachable });
                    for i in committed.as_u64() + 1..=reachable.as_u64() {
                        match leader.inflights.remove(&i) {
                            Some(command) => {
                                if let Some(applier) = &self.applier {
                                    applier.leader_commit(InflightApply {
                                        index: Index::new(i),
                                        data: command.data,
                                        responder: command.responder,
                                    });
                                }
                            }
                            None => {
                                if let Some(applier) = &self.applier {
                                    applier.follower_commit(Index::new(i));
                                }
                            }
                        }
                    }
                    if !leader.sync && leader.noop_index <= reachable {
                        leader.sync = true;
                        slog::info!(self.logger, "term noop committed, accepting requests";
                            "term" => %current);
                    }
                }
                _ => {}
            }
        }

        let committed_now = self.log.committed_index()?;
        let phase = leader.member_change.as_ref().map(|change| change.phase);
        self.refresh_member_change_on_commit()?;
        match phase {
            Some(ChangePhase::Joint { index }) if index <= committed_now => {
                self.leader_begin_phase2()
            }
            Some(ChangePhase::New { index }) if index <= committed_now => {
                self.leader_finish_member_change()
            }
            _ => Ok(()),
        }
    }

    /// The joint config committed under both majorities: append the new
    /// config and replicate it. From this moment the new member set alone
    /// decides elections and commits.
    fn leader_begin_phase2(&mut self) -> Result<(), StoreError> {
        let local = self.shared.local_addr().clone();
        let current = self.current_term();
        let new_servers = match &self.role {
            Role::Leader(leader) => match &leader.member_change {
                Some(change) if matches!(change.phase, ChangePhase::Joint { .. }) => {
                    change.new_servers.clone()
                }
                _ => return Ok(()),
            },
            _ => return Ok(()),
        };

        let conf = Config::normal(new_servers.clone());
        let index = self.log.last_index()?.plus(1);
        self.log.store_entries(vec![LogEntry {
            index,
            term: current,
            kind: EntryKind::Config,
            data: conf.encode()?,
        }])?;
        self.config_manager.push_config(index, conf.clone())?;

        slog::info!(self.logger, "joint config committed, replicating new config";
            "new_index" => %index);
        if let Role::Leader(leader) = &mut self.role {
            if let Some(change) = &mut leader.member_change {
                change.phase = ChangePhase::New { index };
            }
            leader.match_index.insert(local, index);
        }
        self.set_member_change_status(MemberChangeStatus::NewConfigSeen);
        self.notifier.notify(Notify::MemberChange {
            servers: new_servers,
            new_servers: Vec::new(),
        });
        self.peers.reconfigure(&conf.servers);
        self.peers.kick_all();
        self.leader_advance_commit()
    }

    /// The new config committed: answer the caller, and step down if this
    /// leader is not part of the new member set. Status transitions were
    /// already driven by the commit refresh.
    fn leader_finish_member_change(&mut self) -> Result<(), StoreError> {
        let local = self.shared.local_addr().clone();
        let change = match &mut self.role {
            Role::Leader(leader) => match leader.member_change.take() {
                Some(change) => change,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };

        slog::info!(self.logger, "membership change complete");
        if let Some(responder) = change.responder {
            responder.send(ClientResponse::Success { data: Bytes::new() });
        }
        if !change.new_servers.contains(&local) {
            slog::info!(self.logger, "not in the new configuration, stepping down");
            let current = self.current_term();
            self.step_down(current, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::Applier;
    use crate::error::TransportError;
    use crate::event::{event_channel, Notifier};
    use crate::local::hsm::{LocalHsm, SharedState};
    use crate::local::MemberChangeStatus;
    use crate::options::{Options, OptionsValidated};
    use crate::peer::PeerManager;
    use crate::persist::{
        ConfigManager, Log, MemoryConfigManager, MemoryLog, MemorySnapshotStore,
        MemoryStateMachine, Term,
    };
    use crate::transport::{RpcReply, RpcRequest, TransportClient};
    use std::sync::Arc;

    struct NoTransport;

    #[async_trait::async_trait]
    impl TransportClient for NoTransport {
        async fn call(
            &self,
            target: &ServerAddress,
            _request: RpcRequest,
        ) -> Result<RpcReply, TransportError> {
            Err(TransportError::Unreachable(target.clone()))
        }
    }

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn addr(name: &str) -> ServerAddress {
        ServerAddress::new(name)
    }

    /// A loop-less harness: the consensus state without a running dispatch
    /// task, for driving handlers directly.
    fn bare_hsm(servers: &[&str], log: Arc<MemoryLog>) -> LocalHsm {
        let local = addr(servers[0]);
        let members: Vec<ServerAddress> = servers.iter().map(|s| addr(s)).collect();
        let options = OptionsValidated::try_from(Options::default()).unwrap();
        let shared = Arc::new(SharedState::new(
            local.clone(),
            log.last_term().unwrap(),
            MemberChangeStatus::NotInMemberChange,
        ));
        let notifier = Arc::new(Notifier::new());
        let (normal_tx, _normal_rx) = event_channel();
        let (priority_tx, _priority_rx) = event_channel();
        let log: Arc<dyn Log> = log;
        let applier = Applier::spawn(
            discard_logger(),
            Arc::clone(&log),
            Arc::new(MemoryStateMachine::new()),
            Arc::clone(&notifier),
            priority_tx.clone(),
            log.first_index().unwrap().prev(),
        );
        let peers = PeerManager::new(
            discard_logger(),
            local,
            options.clone(),
            Arc::clone(&log),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(NoTransport),
            normal_tx.clone(),
        );
        let config_manager = Arc::new(MemoryConfigManager::new(Config::normal(members)));
        let role = Role::Leader(LeaderRole {
            sync: false,
            noop_index: Index::new(0),
            match_index: HashMap::new(),
            inflights: BTreeMap::new(),
            member_change: None,
        });
        LocalHsm {
            logger: discard_logger(),
            shared,
            options,
            log,
            config_manager,
            snapshots: Arc::new(MemorySnapshotStore::new()),
            notifier,
            applier: Some(applier),
            peers,
            priority: priority_tx,
            normal: normal_tx,
            role,
        }
    }

    fn entry(index: u64, term: u64, kind: EntryKind) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(term),
            kind,
            data: Bytes::from_static(b"d"),
        }
    }

    #[tokio::test]
    async fn stale_term_entries_never_commit_alone() {
        let log = Arc::new(MemoryLog::new());
        // One entry from term 1, then this leader's term-2 noop.
        log.store_entries(vec![
            entry(1, 1, EntryKind::Command),
            entry(2, 2, EntryKind::Noop),
        ])
        .unwrap();
        let mut hsm = bare_hsm(&["a", "b", "c"], Arc::clone(&log));
        hsm.shared.set_current_term(Term::new(2));
        if let Role::Leader(leader) = &mut hsm.role {
            leader.noop_index = Index::new(2);
        }

        // b has stored only the term-1 entry: a majority holds index 1, but
        // committing it alone would violate the commit rule.
        hsm.handle_append_reply(
            addr("b"),
            AppendEntriesReply {
                term: Term::new(2),
                success: true,
                match_index: Index::new(1),
                conflict: None,
            },
        );
        assert_eq!(log.committed_index().unwrap(), Index::new(0));

        // Once the term-2 noop reaches the majority, everything below it
        // commits transitively.
        hsm.handle_append_reply(
            addr("b"),
            AppendEntriesReply {
                term: Term::new(2),
                success: true,
                match_index: Index::new(2),
                conflict: None,
            },
        );
        assert_eq!(log.committed_index().unwrap(), Index::new(2));
        if let Role::Leader(leader) = &hsm.role {
            assert!(leader.sync);
        }
    }

    #[tokio::test]
    async fn joint_consensus_commits_need_both_majorities() {
        let log = Arc::new(MemoryLog::new());
        log.store_entries(vec![entry(1, 2, EntryKind::Noop)]).unwrap();
        let mut hsm = bare_hsm(&["a", "b", "c"], Arc::clone(&log));
        hsm.shared.set_current_term(Term::new(2));
        hsm.config_manager
            .push_config(
                Index::new(1),
                Config::old_new(
                    vec![addr("a"), addr("b"), addr("c")],
                    vec![addr("c"), addr("d"), addr("e")],
                ),
            )
            .unwrap();

        // Majority of the old half only: no commit.
        hsm.handle_append_reply(
            addr("b"),
            AppendEntriesReply {
                term: Term::new(2),
                success: true,
                match_index: Index::new(1),
                conflict: None,
            },
        );
        assert_eq!(log.committed_index().unwrap(), Index::new(0));

        // One ack from the new half completes both majorities.
        hsm.handle_append_reply(
            addr("d"),
            AppendEntriesReply {
                term: Term::new(2),
                success: true,
                match_index: Index::new(1),
                conflict: None,
            },
        );
        assert_eq!(log.committed_index().unwrap(), Index::new(1));
    }
}
