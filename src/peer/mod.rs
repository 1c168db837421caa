//! Per-remote replication tasks and the manager that owns them.

mod hsm;

pub(crate) use hsm::PeerCommand;

use crate::event::{event_channel, Event, EventSender, RequestVoteArgs};
use crate::options::OptionsValidated;
use crate::persist::{Index, Log, ServerAddress, SnapshotStore, Term};
use crate::transport::TransportClient;
use hsm::PeerHsm;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct PeerHandle {
    tx: EventSender<PeerCommand>,
    join: JoinHandle<()>,
}

/// PeerManager owns one replication task per remote in the active
/// configuration and reconfigures the set when membership changes. Peers talk
/// back to the consensus loop only through its event queue.
pub(crate) struct PeerManager {
    logger: slog::Logger,
    local_addr: ServerAddress,
    options: OptionsValidated,
    log: Arc<dyn Log>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<dyn TransportClient>,
    local: EventSender<Event>,
    peers: HashMap<ServerAddress, PeerHandle>,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: slog::Logger,
        local_addr: ServerAddress,
        options: OptionsValidated,
        log: Arc<dyn Log>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn TransportClient>,
        local: EventSender<Event>,
    ) -> Self {
        PeerManager {
            logger,
            local_addr,
            options,
            log,
            snapshots,
            transport,
            local,
            peers: HashMap::new(),
        }
    }

    /// Aligns the peer set with `targets`, spawning tasks for new remotes and
    /// shutting down removed ones. The local address is never a peer. Returns
    /// the newly added remotes so a leader can activate just those.
    pub fn reconfigure(&mut self, targets: &[ServerAddress]) -> Vec<ServerAddress> {
        let wanted: Vec<&ServerAddress> = targets
            .iter()
            .filter(|addr| **addr != self.local_addr)
            .collect();

        let removed: Vec<ServerAddress> = self
            .peers
            .keys()
            .filter(|addr| !wanted.contains(addr))
            .cloned()
            .collect();
        for addr in removed {
            if let Some(handle) = self.peers.remove(&addr) {
                slog::debug!(self.logger, "removing peer"; "peer" => %addr);
                handle.tx.send(PeerCommand::Shutdown);
                handle.join.abort();
            }
        }

        let mut added = Vec::new();
        for addr in wanted {
            if self.peers.contains_key(addr) {
                continue;
            }
            slog::debug!(self.logger, "adding peer"; "peer" => %addr);
            let (tx, rx) = event_channel();
            let hsm = PeerHsm::new(
                self.logger.new(slog::o!("peer" => addr.to_string())),
                self.local_addr.clone(),
                addr.clone(),
                self.options.clone(),
                Arc::clone(&self.log),
                Arc::clone(&self.snapshots),
                Arc::clone(&self.transport),
                self.local.clone(),
            );
            let join = tokio::spawn(hsm.run(rx));
            self.peers.insert(addr.clone(), PeerHandle { tx, join });
            added.push(addr.clone());
        }
        added
    }

    pub fn activate_all(&self, term: Term, next_index: Index) {
        for handle in self.peers.values() {
            handle.tx.send(PeerCommand::Activate { term, next_index });
        }
    }

    pub fn deactivate_all(&self) {
        for handle in self.peers.values() {
            handle.tx.send(PeerCommand::Deactivate);
        }
    }

    pub fn kick_all(&self) {
        for handle in self.peers.values() {
            handle.tx.send(PeerCommand::Kick);
        }
    }

    pub fn activate(&self, addr: &ServerAddress, term: Term, next_index: Index) {
        if let Some(handle) = self.peers.get(addr) {
            handle.tx.send(PeerCommand::Activate { term, next_index });
        }
    }

    pub fn request_vote_all(&self, args: RequestVoteArgs) {
        for handle in self.peers.values() {
            handle.tx.send(PeerCommand::RequestVote(args.clone()));
        }
    }

    pub async fn close(&mut self) {
        for (_, handle) in self.peers.drain() {
            handle.tx.send(PeerCommand::Shutdown);
            let _ = handle.join.await;
        }
    }
}
