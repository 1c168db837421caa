use crate::persist::{Index, ServerAddress, Term};
use bytes::Bytes;
use tokio::sync::broadcast;

/// Lifecycle notifications published by a node. Subscribers that fall behind
/// lose the oldest notifications (broadcast semantics); consume promptly.
#[derive(Debug, Clone)]
pub enum Notify {
    TermChange {
        old: Term,
        new: Term,
    },
    LeaderChange {
        leader: Option<ServerAddress>,
    },
    MemberChange {
        servers: Vec<ServerAddress>,
        new_servers: Vec<ServerAddress>,
    },
    Commit {
        index: Index,
    },
    Apply {
        index: Index,
        data: Bytes,
    },
    Error {
        message: String,
    },
}

const NOTIFY_BUFFER: usize = 1024;

/// Notifier multicasts [`Notify`] events to any number of subscribers.
/// Publishing never blocks and succeeds with zero subscribers.
pub struct Notifier {
    tx: broadcast::Sender<Notify>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_BUFFER);
        Notifier { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notify> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: Notify) {
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
