//! Event taxonomy for the consensus loop, the reliable event channel it is
//! dispatched over, and the lifecycle notifier.

mod channel;
mod notifier;

pub use channel::event_channel;
pub use channel::EventReceiver;
pub use channel::EventSender;
pub use notifier::Notifier;
pub use notifier::Notify;

use crate::error::StoreError;
use crate::persist::{Config, Index, LogEntry, ServerAddress, Term};
use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;

/// Single-use reply callback carried inside request events. The channel has
/// capacity one and the sender is consumed on first use, so every request is
/// answered at most once by construction.
pub struct Responder<T>(oneshot::Sender<T>);

impl<T> Responder<T> {
    pub fn channel() -> (Responder<T>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Responder(tx), rx)
    }

    pub fn send(self, value: T) {
        let _ = self.0.send(value);
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish()
    }
}

/// A client operation, independent of its reply channel so it can be retried
/// and forwarded.
#[derive(Debug, Clone)]
pub enum ClientOp {
    Append(Bytes),
    ReadOnly(Bytes),
    ChangeConfig(Config),
    GetConfig,
}

#[derive(Debug)]
pub struct ClientRequest {
    pub op: ClientOp,
    pub responder: Responder<ClientResponse>,
}

/// Reply to a client request.
#[derive(Debug, Clone)]
pub enum ClientResponse {
    Success { data: Bytes },
    Config(Config),
    Failure,
    LeaderUnknown,
    LeaderUnsync,
    InMemberChange,
    PersistError,
    Redirect { leader: ServerAddress },
}

#[derive(Debug, Clone)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate: ServerAddress,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone)]
pub struct RequestVoteReply {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader: ServerAddress,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Index,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    /// Highest index known replicated on the follower when `success`.
    pub match_index: Index,
    /// Fast-backoff hint when the consistency check fails.
    pub conflict: Option<ConflictHint>,
}

/// Where the follower's log first diverges: the term of its entry at the
/// probed position and the first index it holds for that term. A follower
/// shorter than the probe reports `term` 0 and its `last_index + 1`.
#[derive(Debug, Clone)]
pub struct ConflictHint {
    pub term: Term,
    pub first_index: Index,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotArgs {
    pub term: Term,
    pub leader: ServerAddress,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub servers: Vec<ServerAddress>,
    pub offset: u64,
    pub data: Bytes,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotReply {
    pub term: Term,
    /// Offset the follower expects next; resets to 0 on mismatch.
    pub next_offset: u64,
}

/// Everything the consensus loop dispatches on. Request events carry their
/// reply callbacks; dropping a callback unanswered surfaces as a closed
/// channel at the waiting caller.
#[derive(Debug)]
pub enum Event {
    /// No leader contact within the jittered election timeout.
    ElectionTimeout,
    /// Stop the loop. Posted to the priority queue during shutdown.
    Terminate,
    /// A store failed somewhere in the pipeline; the node must halt.
    PersistError(StoreError),
    Client(ClientRequest),
    QueryState(Responder<String>),
    RequestVote(RequestVoteArgs, Responder<RequestVoteReply>),
    AppendEntries(AppendEntriesArgs, Responder<AppendEntriesReply>),
    InstallSnapshot(InstallSnapshotArgs, Responder<InstallSnapshotReply>),
    /// A replication task forwarding a vote reply from its remote.
    VoteReply {
        peer: ServerAddress,
        reply: RequestVoteReply,
    },
    /// A replication task reporting progress (or a newer term) observed from
    /// its remote. Snapshot completion reports as progress at the snapshot's
    /// last included index.
    AppendReply {
        peer: ServerAddress,
        reply: AppendEntriesReply,
    },
}
