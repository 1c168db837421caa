//! Pluggable persistence interfaces and their in-memory implementations.

mod config;
mod log;
mod snapshot;
mod state_machine;
mod types;

pub use config::Config;
pub use config::ConfigManager;
pub use config::ConfigMeta;
pub use config::MemoryConfigManager;
pub use log::EntryKind;
pub use log::Log;
pub use log::LogEntry;
pub use log::MemoryLog;
pub use snapshot::MemorySnapshotStore;
pub use snapshot::SnapshotId;
pub use snapshot::SnapshotMeta;
pub use snapshot::SnapshotReader;
pub use snapshot::SnapshotStore;
pub use snapshot::SnapshotWriter;
pub use state_machine::MemoryStateMachine;
pub use state_machine::StateMachine;
pub use types::Index;
pub use types::ServerAddress;
pub use types::Term;
