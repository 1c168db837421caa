//! The per-node consensus engine: role state machine, dispatch loop, and the
//! externally readable node state.

mod candidate;
mod follower;
mod hsm;
mod leader;
mod timer;

use crate::applier::Applier;
use crate::error::{NodeError, StoreError};
use crate::event::{event_channel, Event, EventSender, Notifier, Notify, Responder};
use crate::options::OptionsValidated;
use crate::peer::PeerManager;
use crate::persist::{ConfigManager, ConfigMeta, Log, ServerAddress, SnapshotStore, StateMachine, Term};
use crate::transport::TransportClient;
use hsm::{FollowerRole, LocalHsm, Role, SharedState};
use std::sync::{Arc, Mutex};
use timer::ElectionTimerHandle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Where this node stands in a joint-consensus membership change, derived
/// from the config entries trailing the committed index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChangeStatus {
    NotSet,
    NotInMemberChange,
    OldNewConfigSeen,
    OldNewConfigCommitted,
    NewConfigSeen,
    NewConfigCommitted,
}

/// Classifies the configs after the committed index into a member-change
/// status. Any shape outside the table means the log and config manager
/// disagree, which is fatal at startup.
pub(crate) fn classify_member_change(
    metas: &[ConfigMeta],
) -> Result<MemberChangeStatus, StoreError> {
    let corrupted = || {
        StoreError::Corrupted(format!(
            "unclassifiable trailing configs ({} entries)",
            metas.len()
        ))
    };
    match metas {
        [only] if only.conf.is_normal() => Ok(MemberChangeStatus::NotInMemberChange),
        [only] if only.conf.is_old_new() => Ok(MemberChangeStatus::OldNewConfigCommitted),
        [prev, next] if prev.conf.is_normal() && next.conf.is_old_new() => {
            Ok(MemberChangeStatus::OldNewConfigSeen)
        }
        [prev, next] if prev.conf.is_old_new() && next.conf.is_normal() => {
            Ok(MemberChangeStatus::NewConfigSeen)
        }
        [prev, next] if prev.conf.is_normal() && next.conf.is_normal() => {
            Ok(MemberChangeStatus::NotInMemberChange)
        }
        _ => Err(corrupted()),
    }
}

/// Handle to a running consensus loop. Events go in through the normal
/// queue; shutdown posts a terminate event to the priority queue and waits
/// for the loop and its children to wind down.
pub struct LocalNode {
    shared: Arc<SharedState>,
    notifier: Arc<Notifier>,
    normal: EventSender<Event>,
    priority: EventSender<Event>,
    stop: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl LocalNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        logger: slog::Logger,
        options: OptionsValidated,
        local_addr: ServerAddress,
        log: Arc<dyn Log>,
        state_machine: Arc<dyn StateMachine>,
        config_manager: Arc<dyn ConfigManager>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn TransportClient>,
    ) -> Result<LocalNode, NodeError> {
        // Startup integrity check: the trailing configs must classify.
        let committed = log.committed_index()?;
        let metas = config_manager.list_after(committed)?;
        let status = classify_member_change(&metas)?;
        let term = log.last_term()?;

        let shared = Arc::new(SharedState::new(local_addr.clone(), term, status));
        let notifier = Arc::new(Notifier::new());
        let (normal_tx, normal_rx) = event_channel();
        let (priority_tx, priority_rx) = event_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let last_applied = log.first_index()?.prev();
        let applier = Applier::spawn(
            logger.new(slog::o!("task" => "applier")),
            Arc::clone(&log),
            state_machine,
            Arc::clone(&notifier),
            priority_tx.clone(),
            last_applied,
        );

        let mut peers = PeerManager::new(
            logger.new(slog::o!("task" => "peers")),
            local_addr.clone(),
            options.clone(),
            Arc::clone(&log),
            Arc::clone(&snapshots),
            transport,
            normal_tx.clone(),
        );
        let conf = config_manager.last_config()?;
        peers.reconfigure(&conf.all_servers());

        let role = Role::Follower(FollowerRole {
            timer: ElectionTimerHandle::spawn(
                options.election_timeout,
                options.max_timeout_jitter,
                normal_tx.clone(),
            ),
            last_leader_contact: None,
            snapshot_recovery: None,
        });
        let hsm = LocalHsm {
            logger,
            shared: Arc::clone(&shared),
            options,
            log,
            config_manager,
            snapshots,
            notifier: Arc::clone(&notifier),
            applier: Some(applier),
            peers,
            priority: priority_tx.clone(),
            normal: normal_tx.clone(),
            role,
        };
        let join = tokio::spawn(hsm.run(priority_rx, normal_rx, stop_rx));

        Ok(LocalNode {
            shared,
            notifier,
            normal: normal_tx,
            priority: priority_tx,
            stop: stop_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// The normal-queue backend handle clients and the transport inject
    /// events through.
    pub fn sender(&self) -> EventSender<Event> {
        self.normal.clone()
    }

    pub fn local_addr(&self) -> ServerAddress {
        self.shared.local_addr().clone()
    }

    pub fn current_term(&self) -> Term {
        self.shared.current_term()
    }

    pub fn voted_for(&self) -> Option<ServerAddress> {
        self.shared.voted_for()
    }

    pub fn leader(&self) -> Option<ServerAddress> {
        self.shared.leader()
    }

    pub fn member_change_status(&self) -> MemberChangeStatus {
        self.shared.member_change_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notify> {
        self.notifier.subscribe()
    }

    /// Current role id, answered through the loop for a serialized snapshot.
    pub async fn query_state(&self) -> Option<String> {
        let (responder, rx) = Responder::channel();
        self.normal.send(Event::QueryState(responder));
        rx.await.ok()
    }

    /// Stops the loop and tears children down in dependency order. Pending
    /// requests observe a closed channel.
    pub async fn close(&self) {
        self.priority.send(Event::Terminate);
        let _ = self.stop.send(true);
        let join = self.join.lock().expect("join handle lock poisoned").take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{Config, Index};

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::new(s)
    }

    fn meta(index: u64, conf: Config) -> ConfigMeta {
        ConfigMeta {
            index: Index::new(index),
            conf,
        }
    }

    fn normal(names: &[&str]) -> Config {
        Config::normal(names.iter().map(|n| addr(n)).collect())
    }

    fn joint(old: &[&str], new: &[&str]) -> Config {
        Config::old_new(
            old.iter().map(|n| addr(n)).collect(),
            new.iter().map(|n| addr(n)).collect(),
        )
    }

    #[test]
    fn classification_table() {
        let n = normal(&["a", "b", "c"]);
        let j = joint(&["a", "b", "c"], &["a", "b", "c", "d", "e"]);

        assert_eq!(
            classify_member_change(&[meta(0, n.clone())]).unwrap(),
            MemberChangeStatus::NotInMemberChange
        );
        assert_eq!(
            classify_member_change(&[meta(3, j.clone())]).unwrap(),
            MemberChangeStatus::OldNewConfigCommitted
        );
        assert_eq!(
            classify_member_change(&[meta(0, n.clone()), meta(3, j.clone())]).unwrap(),
            MemberChangeStatus::OldNewConfigSeen
        );
        assert_eq!(
            classify_member_change(&[meta(3, j.clone()), meta(5, n.clone())]).unwrap(),
            MemberChangeStatus::NewConfigSeen
        );
        assert_eq!(
            classify_member_change(&[meta(5, n.clone()), meta(9, n.clone())]).unwrap(),
            MemberChangeStatus::NotInMemberChange
        );
    }

    #[test]
    fn unclassifiable_shapes_are_fatal() {
        let n = normal(&["a"]);
        let j = joint(&["a"], &["b"]);

        assert!(classify_member_change(&[]).is_err());
        assert!(classify_member_change(&[meta(0, j.clone()), meta(1, j.clone())]).is_err());
        assert!(classify_member_change(&[
            meta(0, n.clone()),
            meta(1, n.clone()),
            meta(2, n.clone())
        ])
        .is_err());
    }
}
