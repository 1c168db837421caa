use crate::client::{Client, RedirectClient};
use crate::error::{ClientErrorKind, NodeError};
use crate::event::{ClientRequest, Event, EventSender, Notify, Responder};
use crate::local::LocalNode;
use crate::options::{Options, OptionsValidated};
use crate::persist::{ConfigManager, Log, ServerAddress, SnapshotStore, StateMachine};
use crate::retry::Retry;
use crate::transport::{
    RpcReply, RpcRequest, ServeHandler, TransportClient, TransportServer,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

/// RaftNode assembles one cluster member: the consensus loop, its transport
/// server (consensus RPCs plus forwarded client requests), and a redirecting
/// client bound to the local backend.
pub struct RaftNode {
    local: Arc<LocalNode>,
    server: Box<dyn TransportServer>,
    client: RedirectClient,
}

impl RaftNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: slog::Logger,
        options: Options,
        local_addr: ServerAddress,
        log: Arc<dyn Log>,
        state_machine: Arc<dyn StateMachine>,
        config_manager: Arc<dyn ConfigManager>,
        snapshots: Arc<dyn SnapshotStore>,
        transport_client: Arc<dyn TransportClient>,
        transport_server: Box<dyn TransportServer>,
    ) -> Result<RaftNode, NodeError> {
        let options = OptionsValidated::try_from(options).map_err(NodeError::InvalidOptions)?;
        let logger = logger.new(slog::o!("addr" => local_addr.to_string()));
        let local = Arc::new(LocalNode::spawn(
            logger,
            options.clone(),
            local_addr,
            log,
            state_machine,
            config_manager,
            snapshots,
            Arc::clone(&transport_client),
        )?);

        transport_server.serve(serve_handler(local.sender()));

        let client = RedirectClient::new(
            local.sender(),
            options.rpc_timeout,
            default_retry(&options),
            default_redirect_retry(),
            transport_client,
        );

        Ok(RaftNode {
            local,
            server: transport_server,
            client,
        })
    }

    pub fn client(&self) -> &dyn Client {
        &self.client
    }

    /// A client with caller-chosen retry policies, sharing this node's
    /// backend and transport.
    pub fn redirect_client(
        &self,
        transport: Arc<dyn TransportClient>,
        retry: Retry,
        redirect_retry: Retry,
    ) -> RedirectClient {
        RedirectClient::new(
            self.local.sender(),
            Duration::from_millis(500),
            retry,
            redirect_retry,
            transport,
        )
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notify> {
        self.local.subscribe()
    }

    /// Tears down in dependency order: stop accepting transport traffic,
    /// then stop the consensus loop and its children.
    pub async fn close(&self) {
        self.server.close();
        self.local.close().await;
    }
}

/// Transport-facing request handler: consensus RPCs and forwarded client
/// requests are injected into the loop's normal queue, each awaiting its own
/// single-use reply channel. The client arm is the redirect server.
fn serve_handler(backend: EventSender<Event>) -> ServeHandler {
    Arc::new(move |request| -> crate::transport::ServeFuture {
        let backend = backend.clone();
        Box::pin(async move {
            match request {
                RpcRequest::RequestVote(args) => {
                    let (responder, rx) = Responder::channel();
                    backend.send(Event::RequestVote(args, responder));
                    rx.await.ok().map(RpcReply::RequestVote)
                }
                RpcRequest::AppendEntries(args) => {
                    let (responder, rx) = Responder::channel();
                    backend.send(Event::AppendEntries(args, responder));
                    rx.await.ok().map(RpcReply::AppendEntries)
                }
                RpcRequest::InstallSnapshot(args) => {
                    let (responder, rx) = Responder::channel();
                    backend.send(Event::InstallSnapshot(args, responder));
                    rx.await.ok().map(RpcReply::InstallSnapshot)
                }
                RpcRequest::Client(op) => {
                    let (responder, rx) = Responder::channel();
                    backend.send(Event::Client(ClientRequest { op, responder }));
                    rx.await.ok().map(RpcReply::Client)
                }
            }
        })
    })
}

/// Outer client policy: ride out elections and leadership moves, surface
/// everything else.
fn default_retry(options: &OptionsValidated) -> Retry {
    Retry::until_elapsed(options.heartbeat_timeout, options.election_timeout * 10)
        .on_error(ClientErrorKind::Timeout)
        .on_error(ClientErrorKind::LeaderUnknown)
        .on_error(ClientErrorKind::LeaderUnsync)
        .on_error(ClientErrorKind::LeaderRedirect)
}

fn default_redirect_retry() -> Retry {
    Retry::n_times(3, Duration::from_millis(20))
        .on_error(ClientErrorKind::Timeout)
        .on_error(ClientErrorKind::Failure)
}
