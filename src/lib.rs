mod applier;
mod client;
mod error;
mod event;
mod local;
mod node;
mod options;
mod peer;
mod persist;
mod quorum;
mod retry;
mod transport;

pub use client::Client;
pub use client::RedirectClient;
pub use client::SimpleClient;
pub use error::ClientError;
pub use error::ClientErrorKind;
pub use error::NodeError;
pub use error::StoreError;
pub use error::TransportError;
pub use event::AppendEntriesArgs;
pub use event::AppendEntriesReply;
pub use event::ClientOp;
pub use event::ClientResponse;
pub use event::ConflictHint;
pub use event::Event;
pub use event::EventReceiver;
pub use event::EventSender;
pub use event::InstallSnapshotArgs;
pub use event::InstallSnapshotReply;
pub use event::Notify;
pub use event::RequestVoteArgs;
pub use event::RequestVoteReply;
pub use event::Responder;
pub use local::LocalNode;
pub use local::MemberChangeStatus;
pub use node::RaftNode;
pub use options::Options;
pub use persist::Config;
pub use persist::ConfigManager;
pub use persist::ConfigMeta;
pub use persist::EntryKind;
pub use persist::Index;
pub use persist::Log;
pub use persist::LogEntry;
pub use persist::MemoryConfigManager;
pub use persist::MemoryLog;
pub use persist::MemorySnapshotStore;
pub use persist::MemoryStateMachine;
pub use persist::ServerAddress;
pub use persist::SnapshotId;
pub use persist::SnapshotMeta;
pub use persist::SnapshotReader;
pub use persist::SnapshotStore;
pub use persist::SnapshotWriter;
pub use persist::StateMachine;
pub use persist::Term;
pub use retry::Retry;
pub use transport::MemoryTransport;
pub use transport::MemoryTransportClient;
pub use transport::MemoryTransportServer;
pub use transport::RpcReply;
pub use transport::RpcRequest;
pub use transport::ServeFuture;
pub use transport::ServeHandler;
pub use transport::TransportClient;
pub use transport::TransportServer;
