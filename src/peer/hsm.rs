use crate::error::StoreError;
use crate::event::{
    AppendEntriesArgs, AppendEntriesReply, Event, EventReceiver, EventSender, InstallSnapshotArgs,
    RequestVoteArgs,
};
use crate::options::OptionsValidated;
use crate::persist::{Index, Log, ServerAddress, SnapshotMeta, SnapshotReader, SnapshotStore, Term};
use crate::transport::{RpcReply, RpcRequest, TransportClient};
use std::sync::Arc;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};

/// Commands from the consensus loop to one replication task.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// Start replicating for the given leadership term, probing at
    /// `next_index`.
    Activate { term: Term, next_index: Index },
    /// Stop replicating (leadership lost or peer left the configuration).
    Deactivate,
    /// Issue one RequestVote and forward the reply.
    RequestVote(RequestVoteArgs),
    /// New entries or a commit advance: replicate now instead of waiting for
    /// the heartbeat.
    Kick,
    Shutdown,
}

enum PeerMode {
    Deactivated,
    Replicating(Replication),
}

struct Replication {
    term: Term,
    next_index: Index,
    match_index: Index,
    snapshot: Option<SnapshotTransfer>,
}

struct SnapshotTransfer {
    meta: SnapshotMeta,
    reader: Box<dyn SnapshotReader>,
    offset: u64,
}

/// PeerHsm drives replication to one remote: heartbeats, entry batches with
/// fast backoff, snapshot transfer when the remote trails the retained log,
/// and vote requests while the local node campaigns. Progress and newer terms
/// are reported back to the consensus loop through its event queue.
pub(crate) struct PeerHsm {
    logger: slog::Logger,
    local_addr: ServerAddress,
    peer_addr: ServerAddress,
    options: OptionsValidated,
    log: Arc<dyn Log>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<dyn TransportClient>,
    local: EventSender<Event>,
    mode: PeerMode,
}

impl PeerHsm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: slog::Logger,
        local_addr: ServerAddress,
        peer_addr: ServerAddress,
        options: OptionsValidated,
        log: Arc<dyn Log>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn TransportClient>,
        local: EventSender<Event>,
    ) -> Self {
        PeerHsm {
            logger,
            local_addr,
            peer_addr,
            options,
            log,
            snapshots,
            transport,
            local,
            mode: PeerMode::Deactivated,
        }
    }

    pub async fn run(mut self, mut rx: EventReceiver<PeerCommand>) {
        let mut heartbeat = interval(self.options.heartbeat_timeout);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None | Some(PeerCommand::Shutdown) => return,
                    Some(command) => self.handle_command(command, &mut heartbeat).await,
                },
                _ = heartbeat.tick(), if matches!(self.mode, PeerMode::Replicating(_)) => {
                    self.replicate().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand, heartbeat: &mut Interval) {
        match command {
            PeerCommand::Activate { term, next_index } => {
                slog::debug!(self.logger, "activating replication";
                    "term" => %term, "next_index" => %next_index);
                self.mode = PeerMode::Replicating(Replication {
                    term,
                    next_index,
                    match_index: Index::new(0),
                    snapshot: None,
                });
                heartbeat.reset();
                self.replicate().await;
            }
            PeerCommand::Deactivate => {
                self.mode = PeerMode::Deactivated;
            }
            PeerCommand::RequestVote(args) => self.request_vote(args).await,
            PeerCommand::Kick => {
                if matches!(self.mode, PeerMode::Replicating(_)) {
                    heartbeat.reset();
                    self.replicate().await;
                }
            }
            PeerCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    async fn request_vote(&mut self, args: RequestVoteArgs) {
        let call = self
            .transport
            .call(&self.peer_addr, RpcRequest::RequestVote(args));
        match timeout(self.options.rpc_timeout, call).await {
            Ok(Ok(RpcReply::RequestVote(reply))) => {
                self.local.send(Event::VoteReply {
                    peer: self.peer_addr.clone(),
                    reply,
                });
            }
            Ok(Ok(_)) => {
                slog::warn!(self.logger, "mismatched reply to vote request");
            }
            Ok(Err(err)) => {
                slog::debug!(self.logger, "vote request failed"; "error" => %err);
            }
            Err(_) => {
                slog::debug!(self.logger, "vote request timed out");
            }
        }
    }

    async fn replicate(&mut self) {
        if let Err(err) = self.replicate_inner().await {
            slog::error!(self.logger, "replication halted on store failure"; "error" => %err);
            self.local.send(Event::PersistError(err));
            self.mode = PeerMode::Deactivated;
        }
    }

    async fn replicate_inner(&mut self) -> Result<(), StoreError> {
        loop {
            let repl = match &mut self.mode {
                PeerMode::Replicating(repl) => repl,
                PeerMode::Deactivated => return Ok(()),
            };

            if repl.snapshot.is_some() {
                if !self.transfer_snapshot().await? {
                    return Ok(());
                }
                continue;
            }

            let first = self.log.first_index()?;
            let last = self.log.last_index()?;
            if repl.next_index < first {
                self.begin_snapshot_transfer()?;
                continue;
            }

            let prev = repl.next_index.prev();
            let prev_term = match self.log.term_at(prev)? {
                Some(term) => term,
                None => {
                    // The probe position was compacted away underneath us.
                    self.begin_snapshot_transfer()?;
                    continue;
                }
            };
            let batch_end = last.min(prev.plus(self.options.max_append_entries_size));
            let entries = if repl.next_index > last {
                Vec::new()
            } else {
                self.log.entries(repl.next_index, batch_end)?
            };
            let sent = entries.len() as u64;
            let args = AppendEntriesArgs {
                term: repl.term,
                leader: self.local_addr.clone(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.log.committed_index()?,
            };

            let call = self
                .transport
                .call(&self.peer_addr, RpcRequest::AppendEntries(args));
            let reply = match timeout(self.options.rpc_timeout, call).await {
                Ok(Ok(RpcReply::AppendEntries(reply))) => reply,
                Ok(Ok(_)) => {
                    slog::warn!(self.logger, "mismatched reply to append");
                    return Ok(());
                }
                Ok(Err(err)) => {
                    slog::debug!(self.logger, "append failed"; "error" => %err);
                    return Ok(());
                }
                Err(_) => {
                    slog::debug!(self.logger, "append timed out");
                    return Ok(());
                }
            };

            if reply.term > repl.term {
                self.report_progress(reply);
                return Ok(());
            }

            if reply.success {
                repl.match_index = repl.match_index.max(prev.plus(sent));
                repl.next_index = repl.match_index.plus(1);
                let match_index = repl.match_index;
                self.report_progress(AppendEntriesReply {
                    match_index,
                    ..reply
                });
                // Keep going until the remote has everything we hold.
                if match_index >= self.log.last_index()? {
                    return Ok(());
                }
                continue;
            }

            // Consistency check failed: back off, fast when the remote told
            // us where its log diverges.
            let proposed = match &reply.conflict {
                Some(hint) => repl.next_index.prev().min(hint.first_index),
                None => repl.next_index.prev(),
            }
            .max(first);
            if proposed >= repl.next_index {
                // No room left to back off within the retained log.
                self.begin_snapshot_transfer()?;
                continue;
            }
            repl.next_index = proposed;
        }
    }

    fn begin_snapshot_transfer(&mut self) -> Result<(), StoreError> {
        let repl = match &mut self.mode {
            PeerMode::Replicating(repl) => repl,
            PeerMode::Deactivated => return Ok(()),
        };
        let meta = self
            .snapshots
            .list()?
            .into_iter()
            .last()
            .ok_or_else(|| {
                StoreError::Corrupted(
                    "remote trails the retained log and no snapshot exists".to_string(),
                )
            })?;
        let (meta, reader) = self.snapshots.open(&meta.id)?;
        slog::info!(self.logger, "switching to snapshot transfer";
            "last_included_index" => %meta.last_included_index);
        repl.snapshot = Some(SnapshotTransfer {
            meta,
            reader,
            offset: 0,
        });
        Ok(())
    }

    /// Ships one snapshot chunk. Returns true when the transfer advanced and
    /// replication should continue immediately.
    async fn transfer_snapshot(&mut self) -> Result<bool, StoreError> {
        let repl = match &mut self.mode {
            PeerMode::Replicating(repl) => repl,
            PeerMode::Deactivated => return Ok(false),
        };
        let transfer = repl.snapshot.as_mut().expect("snapshot transfer active");

        let data = transfer
            .reader
            .read_chunk(transfer.offset, self.options.max_snapshot_chunk_size)?;
        let sent = data.len() as u64;
        let done = transfer.offset + sent >= transfer.reader.size();
        let args = InstallSnapshotArgs {
            term: repl.term,
            leader: self.local_addr.clone(),
            last_included_index: transfer.meta.last_included_index,
            last_included_term: transfer.meta.last_included_term,
            servers: transfer.meta.servers.clone(),
            offset: transfer.offset,
            data,
            done,
        };

        let call = self
            .transport
            .call(&self.peer_addr, RpcRequest::InstallSnapshot(args));
        let reply = match timeout(self.options.rpc_timeout, call).await {
            Ok(Ok(RpcReply::InstallSnapshot(reply))) => reply,
            Ok(Ok(_)) => {
                slog::warn!(self.logger, "mismatched reply to snapshot chunk");
                return Ok(false);
            }
            Ok(Err(err)) => {
                slog::debug!(self.logger, "snapshot chunk failed"; "error" => %err);
                return Ok(false);
            }
            Err(_) => {
                slog::debug!(self.logger, "snapshot chunk timed out");
                return Ok(false);
            }
        };

        if reply.term > repl.term {
            let term = reply.term;
            self.report_stale_term(term);
            return Ok(false);
        }

        if reply.next_offset == transfer.offset + sent {
            transfer.offset = reply.next_offset;
        } else {
            // The remote lost its partial snapshot; restart where it asks.
            transfer.offset = reply.next_offset;
            return Ok(true);
        }

        if done {
            let match_index = transfer.meta.last_included_index;
            let term = repl.term;
            repl.match_index = match_index;
            repl.next_index = match_index.plus(1);
            repl.snapshot = None;
            slog::info!(self.logger, "snapshot transfer complete";
                "match_index" => %match_index);
            self.report_progress(AppendEntriesReply {
                term,
                success: true,
                match_index,
                conflict: None,
            });
        }
        Ok(true)
    }

    fn report_progress(&self, reply: AppendEntriesReply) {
        self.local.send(Event::AppendReply {
            peer: self.peer_addr.clone(),
            reply,
        });
    }

    fn report_stale_term(&self, term: Term) {
        self.report_progress(AppendEntriesReply {
            term,
            success: false,
            match_index: Index::new(0),
            conflict: None,
        });
    }
}
