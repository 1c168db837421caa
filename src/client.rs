use crate::error::ClientError;
use crate::event::{ClientOp, ClientRequest, ClientResponse, Event, EventSender, Responder};
use crate::persist::Config;
use crate::retry::Retry;
use crate::transport::{RpcReply, RpcRequest, TransportClient};
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Client is the public request surface of a node. `append` and `read_only`
/// carry opaque command bytes to the replicated state machine and return its
/// output; `change_config` runs a joint-consensus membership change.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    async fn append(&self, data: Bytes) -> Result<Bytes, ClientError>;

    async fn read_only(&self, data: Bytes) -> Result<Bytes, ClientError>;

    async fn change_config(&self, conf: Config) -> Result<(), ClientError>;

    /// The last committed configuration.
    async fn get_config(&self) -> Result<Config, ClientError>;

    async fn close(&self);
}

/// One request attempt: send to the backend queue, wait up to the timeout on
/// the request's own reply channel.
async fn send_to_backend(
    backend: &EventSender<Event>,
    op: ClientOp,
    wait: Duration,
) -> Result<ClientResponse, ClientError> {
    let (responder, rx) = Responder::channel();
    backend.send(Event::Client(ClientRequest { op, responder }));
    match timeout(wait, rx).await {
        Err(_) => Err(ClientError::Timeout),
        Ok(Err(_)) => Err(ClientError::Closed),
        Ok(Ok(response)) => Ok(response),
    }
}

fn classify(response: ClientResponse) -> Result<ClientResponse, ClientError> {
    match response {
        ClientResponse::Success { .. } | ClientResponse::Config(_) => Ok(response),
        ClientResponse::Failure => Err(ClientError::Failure),
        ClientResponse::LeaderUnknown => Err(ClientError::LeaderUnknown),
        ClientResponse::LeaderUnsync => Err(ClientError::LeaderUnsync),
        ClientResponse::InMemberChange => Err(ClientError::InMemberChange),
        ClientResponse::PersistError => Err(ClientError::PersistError),
        ClientResponse::Redirect { leader } => Err(ClientError::LeaderRedirect(leader)),
    }
}

/// Shared request pipeline: the outer retry policy wraps whole attempts, the
/// redirect policy wraps the hop to a named leader. Every attempt builds a
/// fresh single-use reply channel, so a belated response to an abandoned
/// attempt is dropped rather than double-delivered.
struct RequestDriver {
    backend: EventSender<Event>,
    wait: Duration,
    retry: Retry,
    redirect_retry: Retry,
    /// Absent in the direct client: redirects surface to the outer policy.
    redirect: Option<Arc<dyn TransportClient>>,
}

impl RequestDriver {
    async fn do_request(&self, op: ClientOp) -> Result<ClientResponse, ClientError> {
        self.retry.call(|| self.attempt(op.clone())).await
    }

    async fn attempt(&self, op: ClientOp) -> Result<ClientResponse, ClientError> {
        let mut response = send_to_backend(&self.backend, op.clone(), self.wait).await?;
        if let ClientResponse::Redirect { leader } = &response {
            if let Some(transport) = &self.redirect {
                let leader = leader.clone();
                let wait = self.wait;
                response = self
                    .redirect_retry
                    .call(|| {
                        let leader = leader.clone();
                        let op = op.clone();
                        let transport = Arc::clone(transport);
                        async move {
                            let call = transport.call(&leader, RpcRequest::Client(op));
                            match timeout(wait, call).await {
                                Err(_) => Err(ClientError::Timeout),
                                Ok(Ok(RpcReply::Client(response))) => Ok(response),
                                Ok(Ok(_)) => Err(ClientError::InvalidResponseType),
                                Ok(Err(_)) => Err(ClientError::Timeout),
                            }
                        }
                    })
                    .await?;
            }
        }
        classify(response)
    }
}

fn extract_data(response: ClientResponse) -> Result<Bytes, ClientError> {
    match response {
        ClientResponse::Success { data } => Ok(data),
        _ => Err(ClientError::InvalidResponseType),
    }
}

/// SimpleClient talks only to its local backend. Against a follower it
/// surfaces `LeaderRedirect` (retryable, in case leadership lands here).
pub struct SimpleClient {
    driver: RequestDriver,
}

impl SimpleClient {
    pub fn new(backend: EventSender<Event>, wait: Duration, retry: Retry) -> Self {
        SimpleClient {
            driver: RequestDriver {
                backend,
                wait,
                retry,
                redirect_retry: Retry::once(),
                redirect: None,
            },
        }
    }
}

#[async_trait::async_trait]
impl Client for SimpleClient {
    async fn append(&self, data: Bytes) -> Result<Bytes, ClientError> {
        extract_data(self.driver.do_request(ClientOp::Append(data)).await?)
    }

    async fn read_only(&self, data: Bytes) -> Result<Bytes, ClientError> {
        extract_data(self.driver.do_request(ClientOp::ReadOnly(data)).await?)
    }

    async fn change_config(&self, conf: Config) -> Result<(), ClientError> {
        self.driver
            .do_request(ClientOp::ChangeConfig(conf))
            .await
            .map(|_| ())
    }

    async fn get_config(&self) -> Result<Config, ClientError> {
        match self.driver.do_request(ClientOp::GetConfig).await? {
            ClientResponse::Config(conf) => Ok(conf),
            _ => Err(ClientError::InvalidResponseType),
        }
    }

    async fn close(&self) {}
}

/// RedirectClient follows leader redirects over the transport, so a handle to
/// any node serves requests no matter where leadership sits.
pub struct RedirectClient {
    driver: RequestDriver,
}

impl RedirectClient {
    pub fn new(
        backend: EventSender<Event>,
        wait: Duration,
        retry: Retry,
        redirect_retry: Retry,
        transport: Arc<dyn TransportClient>,
    ) -> Self {
        RedirectClient {
            driver: RequestDriver {
                backend,
                wait,
                retry,
                redirect_retry,
                redirect: Some(transport),
            },
        }
    }
}

#[async_trait::async_trait]
impl Client for RedirectClient {
    async fn append(&self, data: Bytes) -> Result<Bytes, ClientError> {
        extract_data(self.driver.do_request(ClientOp::Append(data)).await?)
    }

    async fn read_only(&self, data: Bytes) -> Result<Bytes, ClientError> {
        extract_data(self.driver.do_request(ClientOp::ReadOnly(data)).await?)
    }

    async fn change_config(&self, conf: Config) -> Result<(), ClientError> {
        self.driver
            .do_request(ClientOp::ChangeConfig(conf))
            .await
            .map(|_| ())
    }

    async fn get_config(&self) -> Result<Config, ClientError> {
        match self.driver.do_request(ClientOp::GetConfig).await? {
            ClientResponse::Config(conf) => Ok(conf),
            _ => Err(ClientError::InvalidResponseType),
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientErrorKind, TransportError};
    use crate::event::event_channel;
    use crate::persist::ServerAddress;

    /// Backend stub that answers every request with a canned response.
    fn canned_backend(response: ClientResponse) -> EventSender<Event> {
        let (tx, mut rx) = event_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Event::Client(request) = event {
                    request.responder.send(response.clone());
                }
            }
        });
        tx
    }

    #[tokio::test]
    async fn append_returns_the_state_machine_output() {
        let backend = canned_backend(ClientResponse::Success {
            data: Bytes::from_static(b"out"),
        });
        let client = SimpleClient::new(backend, Duration::from_millis(100), Retry::once());

        let result = client.append(Bytes::from_static(b"in")).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"out"));
    }

    #[tokio::test]
    async fn direct_client_surfaces_redirects() {
        let backend = canned_backend(ClientResponse::Redirect {
            leader: ServerAddress::new("leader"),
        });
        let client = SimpleClient::new(backend, Duration::from_millis(100), Retry::once());

        let result = client.append(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(ClientError::LeaderRedirect(_))));
    }

    #[tokio::test]
    async fn closed_backend_is_not_a_timeout() {
        let (tx, mut rx) = event_channel::<Event>();
        rx.close();
        drop(rx);
        let client = SimpleClient::new(tx, Duration::from_millis(100), Retry::once());

        let result = client.append(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    struct FakeLeader;

    #[async_trait::async_trait]
    impl TransportClient for FakeLeader {
        async fn call(
            &self,
            target: &ServerAddress,
            request: RpcRequest,
        ) -> Result<RpcReply, TransportError> {
            assert_eq!(target, &ServerAddress::new("leader"));
            match request {
                RpcRequest::Client(ClientOp::Append(data)) => {
                    Ok(RpcReply::Client(ClientResponse::Success { data }))
                }
                _ => Err(TransportError::Closed),
            }
        }
    }

    #[tokio::test]
    async fn redirect_client_follows_the_leader() {
        let backend = canned_backend(ClientResponse::Redirect {
            leader: ServerAddress::new("leader"),
        });
        let client = RedirectClient::new(
            backend,
            Duration::from_millis(100),
            Retry::once(),
            Retry::n_times(2, Duration::from_millis(10))
                .on_error(ClientErrorKind::Timeout),
            Arc::new(FakeLeader),
        );

        let result = client.append(Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"y"));
    }
}
