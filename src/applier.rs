use crate::error::StoreError;
use crate::event::{
    event_channel, ClientResponse, Event, EventSender, Notifier, Notify, Responder,
};
use crate::persist::{EntryKind, Index, Log, StateMachine};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A committed client command waiting to be applied and answered.
#[derive(Debug)]
pub(crate) struct InflightApply {
    pub index: Index,
    pub data: Bytes,
    pub responder: Responder<ClientResponse>,
}

#[derive(Debug)]
enum ApplyCommand {
    /// Apply every entry up to and including the given committed index.
    FollowerCommit(Index),
    /// Apply one leader-tracked command and answer its client.
    LeaderCommit(InflightApply),
    /// A snapshot was installed; applied state now starts at this index.
    SnapshotRestored(Index),
}

/// Applier advances the host state machine from last-applied to committed,
/// strictly in index order, on its own task. A state machine or log failure
/// is escalated to the consensus loop as a persist error and stops the task.
pub(crate) struct Applier {
    tx: EventSender<ApplyCommand>,
    join: JoinHandle<()>,
}

impl Applier {
    pub fn spawn(
        logger: slog::Logger,
        log: Arc<dyn Log>,
        state_machine: Arc<dyn StateMachine>,
        notifier: Arc<Notifier>,
        escalation: EventSender<Event>,
        last_applied: Index,
    ) -> Self {
        let (tx, mut rx) = event_channel();
        let join = tokio::spawn(async move {
            let mut task = ApplierTask {
                logger,
                log,
                state_machine,
                notifier,
                escalation,
                last_applied,
            };
            while let Some(command) = rx.recv().await {
                if let Err(err) = task.handle(command) {
                    slog::error!(task.logger, "apply failed"; "error" => %err);
                    task.escalation.send(Event::PersistError(err));
                    return;
                }
            }
        });
        Applier { tx, join }
    }

    pub fn follower_commit(&self, up_to: Index) {
        self.tx.send(ApplyCommand::FollowerCommit(up_to));
    }

    pub fn leader_commit(&self, entry: InflightApply) {
        self.tx.send(ApplyCommand::LeaderCommit(entry));
    }

    pub fn snapshot_restored(&self, last_included: Index) {
        self.tx.send(ApplyCommand::SnapshotRestored(last_included));
    }

    pub async fn close(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}

struct ApplierTask {
    logger: slog::Logger,
    log: Arc<dyn Log>,
    state_machine: Arc<dyn StateMachine>,
    notifier: Arc<Notifier>,
    escalation: EventSender<Event>,
    last_applied: Index,
}

impl ApplierTask {
    fn handle(&mut self, command: ApplyCommand) -> Result<(), StoreError> {
        match command {
            ApplyCommand::FollowerCommit(up_to) => {
                while self.last_applied < up_to {
                    let index = self.last_applied.plus(1);
                    let entry = self.log.entry(index)?.ok_or_else(|| {
                        StoreError::Corrupted(format!("committed entry {} missing", index))
                    })?;
                    if entry.kind == EntryKind::Command {
                        let output = self.state_machine.apply(entry.data)?;
                        self.notifier.notify(Notify::Apply {
                            index,
                            data: output,
                        });
                    }
                    self.last_applied = index;
                }
                Ok(())
            }
            ApplyCommand::LeaderCommit(entry) => {
                if entry.index != self.last_applied.plus(1) {
                    return Err(StoreError::Corrupted(format!(
                        "leader commit at {} but last applied is {}",
                        entry.index, self.last_applied
                    )));
                }
                let output = self.state_machine.apply(entry.data)?;
                self.last_applied = entry.index;
                self.notifier.notify(Notify::Apply {
                    index: entry.index,
                    data: output.clone(),
                });
                entry.responder.send(ClientResponse::Success { data: output });
                Ok(())
            }
            ApplyCommand::SnapshotRestored(last_included) => {
                if last_included > self.last_applied {
                    self.last_applied = last_included;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{LogEntry, MemoryLog, MemoryStateMachine, Term};

    fn entry(index: u64, kind: EntryKind, data: &'static [u8]) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(1),
            kind,
            data: Bytes::from_static(data),
        }
    }

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn applies_strictly_in_index_order() {
        let log = Arc::new(MemoryLog::new());
        log.store_entries(vec![
            entry(1, EntryKind::Noop, b""),
            entry(2, EntryKind::Command, b"a"),
            entry(3, EntryKind::Command, b"b"),
        ])
        .unwrap();
        let sm = Arc::new(MemoryStateMachine::new());
        let notifier = Arc::new(Notifier::new());
        let mut notifications = notifier.subscribe();
        let (escalation, _escalation_rx) = event_channel();

        let applier = Applier::spawn(
            discard_logger(),
            log,
            Arc::clone(&sm) as Arc<dyn crate::persist::StateMachine>,
            Arc::clone(&notifier),
            escalation,
            Index::new(0),
        );
        applier.follower_commit(Index::new(3));

        // Noop at 1 is skipped; commands at 2 and 3 apply in order.
        for expected in [2u64, 3] {
            match notifications.recv().await.unwrap() {
                Notify::Apply { index, .. } => assert_eq!(index, Index::new(expected)),
                other => panic!("unexpected notify: {:?}", other),
            }
        }
        applier.close().await;
        assert_eq!(sm.applied(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn leader_commit_answers_the_client() {
        let log = Arc::new(MemoryLog::new());
        log.store_entries(vec![entry(1, EntryKind::Command, b"x")])
            .unwrap();
        let notifier = Arc::new(Notifier::new());
        let (escalation, _escalation_rx) = event_channel();
        let applier = Applier::spawn(
            discard_logger(),
            log,
            Arc::new(MemoryStateMachine::new()),
            notifier,
            escalation,
            Index::new(0),
        );

        let (responder, rx) = Responder::channel();
        applier.leader_commit(InflightApply {
            index: Index::new(1),
            data: Bytes::from_static(b"x"),
            responder,
        });

        match rx.await.unwrap() {
            ClientResponse::Success { data } => assert_eq!(data, Bytes::from_static(b"x")),
            other => panic!("unexpected response: {:?}", other),
        }
        applier.close().await;
    }

    #[tokio::test]
    async fn missing_committed_entry_escalates() {
        let log = Arc::new(MemoryLog::new());
        let notifier = Arc::new(Notifier::new());
        let (escalation, mut escalation_rx) = event_channel();
        let applier = Applier::spawn(
            discard_logger(),
            log,
            Arc::new(MemoryStateMachine::new()),
            notifier,
            escalation,
            Index::new(0),
        );

        applier.follower_commit(Index::new(1));

        match escalation_rx.recv().await.unwrap() {
            Event::PersistError(_) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        applier.close().await;
    }
}
