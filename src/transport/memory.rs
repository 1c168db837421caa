use crate::error::TransportError;
use crate::persist::ServerAddress;
use crate::transport::{RpcReply, RpcRequest, ServeHandler, TransportClient, TransportServer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-process transport registry for single-process clusters and tests.
/// Every node registers its serve handler under its address; calls dispatch
/// directly to the target's handler.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: Arc<Mutex<HashMap<ServerAddress, ServeHandler>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemoryTransportClient {
        MemoryTransportClient {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn server(&self, addr: ServerAddress) -> MemoryTransportServer {
        MemoryTransportServer {
            registry: Arc::clone(&self.registry),
            addr,
        }
    }
}

#[derive(Clone)]
pub struct MemoryTransportClient {
    registry: Arc<Mutex<HashMap<ServerAddress, ServeHandler>>>,
}

#[async_trait::async_trait]
impl TransportClient for MemoryTransportClient {
    async fn call(
        &self,
        target: &ServerAddress,
        request: RpcRequest,
    ) -> Result<RpcReply, TransportError> {
        let handler = {
            let registry = self.registry.lock().expect("transport registry poisoned");
            registry
                .get(target)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(target.clone()))?
        };
        handler(request).await.ok_or(TransportError::Closed)
    }
}

pub struct MemoryTransportServer {
    registry: Arc<Mutex<HashMap<ServerAddress, ServeHandler>>>,
    addr: ServerAddress,
}

impl TransportServer for MemoryTransportServer {
    fn serve(&self, handler: ServeHandler) {
        self.registry
            .lock()
            .expect("transport registry poisoned")
            .insert(self.addr.clone(), handler);
    }

    fn close(&self) {
        self.registry
            .lock()
            .expect("transport registry poisoned")
            .remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClientOp, ClientResponse};
    use bytes::Bytes;

    #[tokio::test]
    async fn call_reaches_the_registered_handler() {
        let transport = MemoryTransport::new();
        let addr = ServerAddress::new("node-1");

        transport
            .server(addr.clone())
            .serve(Arc::new(|request| -> crate::transport::ServeFuture {
                Box::pin(async move {
                    match request {
                        RpcRequest::Client(ClientOp::Append(data)) => {
                            Some(RpcReply::Client(ClientResponse::Success { data }))
                        }
                        _ => Some(RpcReply::Client(ClientResponse::Failure)),
                    }
                })
            }));

        let reply = transport
            .client()
            .call(&addr, RpcRequest::Client(ClientOp::Append(Bytes::from_static(b"x"))))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            RpcReply::Client(ClientResponse::Success { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let transport = MemoryTransport::new();
        let result = transport
            .client()
            .call(
                &ServerAddress::new("nobody"),
                RpcRequest::Client(ClientOp::GetConfig),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn closed_server_unregisters() {
        let transport = MemoryTransport::new();
        let addr = ServerAddress::new("node-1");
        let server = transport.server(addr.clone());
        server.serve(Arc::new(|_| -> crate::transport::ServeFuture {
            Box::pin(async { None })
        }));
        server.close();

        let result = transport
            .client()
            .call(&addr, RpcRequest::Client(ClientOp::GetConfig))
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
