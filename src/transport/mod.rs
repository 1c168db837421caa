//! Pluggable duplex RPC transport. One envelope carries both consensus RPCs
//! and client requests forwarded between nodes.

mod memory;

pub use memory::MemoryTransport;
pub use memory::MemoryTransportClient;
pub use memory::MemoryTransportServer;

use crate::error::TransportError;
use crate::event::{
    AppendEntriesArgs, AppendEntriesReply, ClientOp, ClientResponse, InstallSnapshotArgs,
    InstallSnapshotReply, RequestVoteArgs, RequestVoteReply,
};
use crate::persist::ServerAddress;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
    /// A client request forwarded from another node (leader redirection).
    Client(ClientOp),
}

#[derive(Debug, Clone)]
pub enum RpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
    Client(ClientResponse),
}

/// Client half of the transport: one request, one reply.
#[async_trait::async_trait]
pub trait TransportClient: Send + Sync {
    async fn call(
        &self,
        target: &ServerAddress,
        request: RpcRequest,
    ) -> Result<RpcReply, TransportError>;
}

pub type ServeFuture = Pin<Box<dyn Future<Output = Option<RpcReply>> + Send>>;

/// Server-side request handler. Returns `None` once the node behind it has
/// shut down.
pub type ServeHandler = Arc<dyn Fn(RpcRequest) -> ServeFuture + Send + Sync>;

/// Server half of the transport: binds an address to a handler.
pub trait TransportServer: Send + Sync {
    fn serve(&self, handler: ServeHandler);

    fn close(&self);
}
