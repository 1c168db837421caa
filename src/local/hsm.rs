use crate::applier::Applier;
use crate::error::StoreError;
use crate::event::{
    ClientOp, ClientRequest, ClientResponse, Event, EventReceiver, EventSender, Notifier, Notify,
    Responder,
};
use crate::local::timer::ElectionTimerHandle;
use crate::local::MemberChangeStatus;
use crate::options::OptionsValidated;
use crate::peer::PeerManager;
use crate::persist::{
    Config, ConfigManager, Index, Log, ServerAddress, SnapshotStore, SnapshotWriter, Term,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;

/// State readable outside the consensus loop: telemetry and client queries
/// load these without going through the event queue. Only the loop writes.
pub(crate) struct SharedState {
    local_addr: ServerAddress,
    current_term: AtomicU64,
    voted_for: RwLock<Option<ServerAddress>>,
    leader: RwLock<Option<ServerAddress>>,
    member_change_status: RwLock<MemberChangeStatus>,
}

impl SharedState {
    pub fn new(local_addr: ServerAddress, term: Term, status: MemberChangeStatus) -> Self {
        SharedState {
            local_addr,
            current_term: AtomicU64::new(term.as_u64()),
            voted_for: RwLock::new(None),
            leader: RwLock::new(None),
            member_change_status: RwLock::new(status),
        }
    }

    pub fn local_addr(&self) -> &ServerAddress {
        &self.local_addr
    }

    pub fn current_term(&self) -> Term {
        Term::new(self.current_term.load(Ordering::Acquire))
    }

    pub fn set_current_term(&self, term: Term) {
        self.current_term.store(term.as_u64(), Ordering::Release);
    }

    pub fn voted_for(&self) -> Option<ServerAddress> {
        self.voted_for.read().expect("voted_for lock poisoned").clone()
    }

    pub fn set_voted_for(&self, vote: Option<ServerAddress>) {
        *self.voted_for.write().expect("voted_for lock poisoned") = vote;
    }

    pub fn leader(&self) -> Option<ServerAddress> {
        self.leader.read().expect("leader lock poisoned").clone()
    }

    pub fn set_leader(&self, leader: Option<ServerAddress>) {
        *self.leader.write().expect("leader lock poisoned") = leader;
    }

    pub fn member_change_status(&self) -> MemberChangeStatus {
        *self
            .member_change_status
            .read()
            .expect("member change status lock poisoned")
    }

    pub fn set_member_change_status(&self, status: MemberChangeStatus) {
        *self
            .member_change_status
            .write()
            .expect("member change status lock poisoned") = status;
    }
}

/// Follower sub-state while receiving a chunked snapshot.
pub(crate) struct SnapshotRecovery {
    pub writer: Box<dyn SnapshotWriter>,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub servers: Vec<ServerAddress>,
    pub next_offset: u64,
}

pub(crate) struct FollowerRole {
    pub timer: ElectionTimerHandle,
    pub last_leader_contact: Option<Instant>,
    pub snapshot_recovery: Option<SnapshotRecovery>,
}

pub(crate) struct CandidateRole {
    pub timer: ElectionTimerHandle,
    pub votes: HashSet<ServerAddress>,
}

/// An appended client command whose commit is still outstanding.
pub(crate) struct InflightCommand {
    pub data: Bytes,
    pub responder: Responder<ClientResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangePhase {
    /// Joint config appended, waiting for it to commit.
    Joint { index: Index },
    /// New config appended, waiting for it to commit.
    New { index: Index },
}

pub(crate) struct MemberChange {
    pub phase: ChangePhase,
    pub new_servers: Vec<ServerAddress>,
    /// Absent when a new leader resumes a change begun by a predecessor.
    pub responder: Option<Responder<ClientResponse>>,
}

pub(crate) struct LeaderRole {
    /// False until the term-opening noop commits; reads and writes are
    /// bounced until then.
    pub sync: bool,
    pub noop_index: Index,
    pub match_index: HashMap<ServerAddress, Index>,
    pub inflights: BTreeMap<u64, InflightCommand>,
    pub member_change: Option<MemberChange>,
}

pub(crate) enum Role {
    Follower(FollowerRole),
    Candidate(CandidateRole),
    Leader(LeaderRole),
    PersistError,
}

/// LocalHsm is the single-threaded consensus loop: all role state, term and
/// vote bookkeeping, and commit decisions live here. Cross-task input arrives
/// only through the two event queues; the priority queue (self-dispatch and
/// escalations) is always drained ahead of normal traffic.
pub(crate) struct LocalHsm {
    pub logger: slog::Logger,
    pub shared: Arc<SharedState>,
    pub options: OptionsValidated,
    pub log: Arc<dyn Log>,
    pub config_manager: Arc<dyn ConfigManager>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub notifier: Arc<Notifier>,
    pub applier: Option<Applier>,
    pub peers: PeerManager,
    pub priority: EventSender<Event>,
    pub normal: EventSender<Event>,
    pub role: Role,
}

impl LocalHsm {
    pub async fn run(
        mut self,
        mut priority_rx: EventReceiver<Event>,
        mut normal_rx: EventReceiver<Event>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        // Recover applied state up to whatever was committed before boot.
        match self.log.committed_index() {
            Ok(committed) => {
                if let Some(applier) = &self.applier {
                    applier.follower_commit(committed);
                }
            }
            Err(err) => self.enter_persist_error(err),
        }
        slog::info!(self.logger, "consensus loop started";
            "term" => %self.shared.current_term());

        loop {
            let event = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                Some(event) = priority_rx.recv() => event,
                Some(event) = normal_rx.recv() => event,
            };
            if matches!(event, Event::Terminate) {
                break;
            }
            self.dispatch(event);
        }

        slog::info!(self.logger, "consensus loop stopping");
        priority_rx.close();
        normal_rx.close();
        self.peers.close().await;
        if let Some(applier) = self.applier.take() {
            applier.close().await;
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Terminate => {}
            Event::PersistError(err) => self.enter_persist_error(err),
            Event::QueryState(responder) => responder.send(self.state_id()),
            Event::ElectionTimeout => self.handle_election_timeout(),
            Event::Client(request) => self.handle_client(request),
            Event::RequestVote(args, responder) => self.handle_request_vote(args, responder),
            Event::AppendEntries(args, responder) => self.handle_append_entries(args, responder),
            Event::InstallSnapshot(args, responder) => {
                self.handle_install_snapshot(args, responder)
            }
            Event::VoteReply { peer, reply } => self.handle_vote_reply(peer, reply),
            Event::AppendReply { peer, reply } => self.handle_append_reply(peer, reply),
        }
    }

    pub fn state_id(&self) -> String {
        match &self.role {
            Role::Follower(follower) => {
                if follower.snapshot_recovery.is_some() {
                    return "follower/snapshot-recovery".to_string();
                }
                match self.shared.member_change_status() {
                    MemberChangeStatus::OldNewConfigSeen => {
                        "follower/member-change/old-new-config-seen".to_string()
                    }
                    MemberChangeStatus::OldNewConfigCommitted => {
                        "follower/member-change/old-new-config-committed".to_string()
                    }
                    MemberChangeStatus::NewConfigSeen => {
                        "follower/member-change/new-config-seen".to_string()
                    }
                    _ => "follower".to_string(),
                }
            }
            Role::Candidate(_) => "candidate".to_string(),
            Role::Leader(leader) => match (&leader.member_change, leader.sync) {
                (Some(change), _) => match change.phase {
                    ChangePhase::Joint { .. } => "leader/member-change/joint".to_string(),
                    ChangePhase::New { .. } => "leader/member-change/new".to_string(),
                },
                (None, false) => "leader/unsync".to_string(),
                (None, true) => "leader/sync".to_string(),
            },
            Role::PersistError => "persist-error".to_string(),
        }
    }

    // ---- term / leader / status bookkeeping ----

    pub fn current_term(&self) -> Term {
        self.shared.current_term()
    }

    pub fn set_term_with_notify(&self, term: Term) {
        let old = self.shared.current_term();
        if term == old {
            return;
        }
        self.shared.set_current_term(term);
        self.shared.set_voted_for(None);
        self.notifier.notify(Notify::TermChange { old, new: term });
    }

    pub fn set_leader_with_notify(&self, leader: Option<ServerAddress>) {
        if self.shared.leader() == leader {
            return;
        }
        self.shared.set_leader(leader.clone());
        self.notifier.notify(Notify::LeaderChange { leader });
    }

    pub fn set_member_change_status(&self, status: MemberChangeStatus) {
        let old = self.shared.member_change_status();
        if old != status {
            slog::debug!(self.logger, "member change status";
                "from" => ?old, "to" => ?status);
            self.shared.set_member_change_status(status);
        }
    }

    pub fn new_follower_role(&self) -> FollowerRole {
        FollowerRole {
            timer: ElectionTimerHandle::spawn(
                self.options.election_timeout,
                self.options.max_timeout_jitter,
                self.normal.clone(),
            ),
            last_leader_contact: None,
            snapshot_recovery: None,
        }
    }

    /// Converts to Follower. Call on any higher-term observation or on
    /// leadership loss. Outstanding leader-side requests answer
    /// `LeaderUnknown` so their clients retry against the new leader.
    pub fn step_down(&mut self, term: Term, leader: Option<ServerAddress>) {
        if term > self.current_term() {
            self.set_term_with_notify(term);
        }
        self.fail_leader_requests(ClientResponse::LeaderUnknown);
        self.set_leader_with_notify(leader);
        self.peers.deactivate_all();
        self.role = Role::Follower(self.new_follower_role());
    }

    fn fail_leader_requests(&mut self, response: ClientResponse) {
        if let Role::Leader(leader) = &mut self.role {
            for (_, inflight) in std::mem::take(&mut leader.inflights) {
                inflight.responder.send(response.clone());
            }
            if let Some(change) = leader.member_change.take() {
                if let Some(responder) = change.responder {
                    responder.send(response.clone());
                }
            }
        }
    }

    // ---- commit plumbing ----

    /// Follower-path commit: persists the committed index and hands the whole
    /// range to the applier.
    pub fn commit_logs_up_to(&mut self, index: Index) -> Result<(), StoreError> {
        let committed = self.log.committed_index()?;
        if index <= committed {
            return Ok(());
        }
        self.log.store_committed_index(index)?;
        self.notifier.notify(Notify::Commit { index });
        if let Some(applier) = &self.applier {
            applier.follower_commit(index);
        }
        Ok(())
    }

    /// Moves the member-change status along once config entries become
    /// committed, from the trailing-config shape alone. Works for leaders and
    /// followers alike.
    pub fn refresh_member_change_on_commit(&mut self) -> Result<(), StoreError> {
        let committed = self.log.committed_index()?;
        let metas = self.config_manager.list_after(committed)?;
        match self.shared.member_change_status() {
            MemberChangeStatus::OldNewConfigSeen => {
                if metas.first().map(|m| m.conf.is_old_new()).unwrap_or(false) {
                    self.set_member_change_status(MemberChangeStatus::OldNewConfigCommitted);
                }
            }
            MemberChangeStatus::NewConfigSeen => {
                if metas.len() == 1 && metas[0].conf.is_normal() {
                    self.set_member_change_status(MemberChangeStatus::NewConfigCommitted);
                    self.set_member_change_status(MemberChangeStatus::NotInMemberChange);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The configuration governing elections and commits right now: the last
    /// *seen* config, committed or not.
    pub fn active_config(&self) -> Result<Config, StoreError> {
        self.config_manager.last_config()
    }

    pub fn last_committed_config(&self) -> Result<Config, StoreError> {
        let committed = self.log.committed_index()?;
        let metas = self.config_manager.list_after(committed)?;
        metas
            .into_iter()
            .next()
            .map(|m| m.conf)
            .ok_or_else(|| StoreError::Corrupted("config history is empty".to_string()))
    }

    // ---- client front door ----

    fn handle_client(&mut self, request: ClientRequest) {
        if matches!(request.op, ClientOp::GetConfig) {
            match self.last_committed_config() {
                Ok(conf) => request.responder.send(ClientResponse::Config(conf)),
                Err(err) => {
                    request.responder.send(ClientResponse::PersistError);
                    self.enter_persist_error(err);
                }
            }
            return;
        }

        match &self.role {
            Role::PersistError => request.responder.send(ClientResponse::PersistError),
            Role::Candidate(_) => request.responder.send(ClientResponse::LeaderUnknown),
            Role::Follower(_) => match self.shared.leader() {
                Some(leader) => request.responder.send(ClientResponse::Redirect { leader }),
                None => request.responder.send(ClientResponse::LeaderUnknown),
            },
            Role::Leader(_) => self.leader_handle_client(request),
        }
    }

    fn handle_election_timeout(&mut self) {
        match &self.role {
            Role::Follower(_) | Role::Candidate(_) => self.start_election(),
            Role::Leader(_) | Role::PersistError => {}
        }
    }

    // ---- fatal persistence failure ----

    pub fn enter_persist_error(&mut self, err: StoreError) {
        if matches!(self.role, Role::PersistError) {
            return;
        }
        slog::error!(self.logger, "halting on persist error"; "error" => %err);
        self.notifier.notify(Notify::Error {
            message: err.to_string(),
        });
        self.fail_leader_requests(ClientResponse::PersistError);
        self.peers.deactivate_all();
        self.set_leader_with_notify(None);
        self.role = Role::PersistError;

        let priority = self.priority.clone();
        let linger = self.options.persist_error_notify_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            priority.send(Event::Terminate);
        });
    }
}
